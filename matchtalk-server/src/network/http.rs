//! HTTP surface.
//!
//! REST endpoints under `/api` plus the `/ws` upgrade. Every `/api` route
//! passes through the request-scoped authenticator; handlers that need an
//! identity take [`Authenticated`].

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ws::WebSocketUpgrade,
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::server::{handle_socket, AppState};
use crate::accounts::{LoginRequest, LoginResponse};
use crate::auth::handshake::{authenticate_handshake, HandshakeQuery};
use crate::auth::request::{resolve_principal, Authenticated};
use crate::core::identity::Capability;
use crate::core::store::UserRecord;
use crate::error::{AppError, ValidationError};
use crate::matching::{Candidate, Decision, MatchCriteria, MatchDecisionResponse, MatchStartResponse};
use crate::rooms::{Room, RoomError, MAX_INVITE_TARGETS};

/// Body of an invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    /// Login ids to admit.
    pub targets: Vec<String>,
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/login", post(login))
        .route("/match/requests", post(start_match).delete(cancel_match))
        .route("/match/proposals/{id}/accept", post(accept_proposal))
        .route("/match/proposals/{id}/decline", post(decline_proposal))
        .route("/rooms", post(create_group_room))
        .route("/rooms/{id}/invite", post(invite))
        .route("/rooms/{id}/leave", post(leave_room))
        .route_layer(middleware::from_fn_with_state(state.credentials.clone(), resolve_principal));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ValidationError::new("body", e.body_text()).into())
}

fn path<T>(param: Result<Path<T>, PathRejection>, field: &str) -> Result<T, AppError> {
    param
        .map(|Path(v)| v)
        .map_err(|e| ValidationError::new(field, e.body_text()).into())
}

async fn caller_record(state: &AppState, user: &Authenticated) -> Result<UserRecord, AppError> {
    state
        .storage
        .users
        .find(&user.0.subject_id)
        .await?
        .ok_or(AppError::Unauthorized)
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let request = body(payload)?;
    Ok(Json(state.accounts.login(&request, Utc::now()).await?))
}

async fn start_match(
    State(state): State<AppState>,
    user: Authenticated,
    payload: Result<Json<MatchCriteria>, JsonRejection>,
) -> Result<Json<MatchStartResponse>, AppError> {
    user.require(Capability::Match)?;
    let criteria = body(payload)?;
    let record = caller_record(&state, &user).await?;
    let candidate = Candidate::from_record(&record, Utc::now().date_naive());
    Ok(Json(state.engine.start_or_find(candidate, criteria).await?))
}

async fn cancel_match(State(state): State<AppState>, user: Authenticated) -> Result<Json<Value>, AppError> {
    let principal = user.require(Capability::Match)?;
    let cancelled = state.engine.cancel(&principal.subject_id).await;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn decide(
    state: &AppState,
    user: &Authenticated,
    id: Result<Path<Uuid>, PathRejection>,
    decision: Decision,
) -> Result<Json<MatchDecisionResponse>, AppError> {
    let principal = user.require(Capability::Match)?;
    let proposal_id = path(id, "proposalId")?;
    Ok(Json(
        state.engine.decide(&principal.subject_id, proposal_id, decision).await?,
    ))
}

async fn accept_proposal(
    State(state): State<AppState>,
    user: Authenticated,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<MatchDecisionResponse>, AppError> {
    decide(&state, &user, id, Decision::Accepted).await
}

async fn decline_proposal(
    State(state): State<AppState>,
    user: Authenticated,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<MatchDecisionResponse>, AppError> {
    decide(&state, &user, id, Decision::Declined).await
}

async fn create_group_room(State(state): State<AppState>, user: Authenticated) -> Result<Json<Room>, AppError> {
    let principal = user.require(Capability::Chat)?;
    Ok(Json(state.rooms.create_group(&principal.subject_id).await?))
}

async fn invite(
    State(state): State<AppState>,
    user: Authenticated,
    id: Result<Path<u64>, PathRejection>,
    payload: Result<Json<InviteRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let principal = user.require(Capability::Chat)?;
    let room_id = path(id, "roomId")?;
    let request = body(payload)?;
    if request.targets.len() > MAX_INVITE_TARGETS {
        return Err(RoomError::TooManyTargets { max: MAX_INVITE_TARGETS }.into());
    }
    for target in &request.targets {
        if state.storage.users.find(target).await?.is_none() {
            return Err(AppError::NotFound(format!("user {target} not found")));
        }
    }
    state.rooms.invite(room_id, &principal.subject_id, &request.targets).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_room(
    State(state): State<AppState>,
    user: Authenticated,
    id: Result<Path<u64>, PathRejection>,
) -> Result<StatusCode, AppError> {
    let principal = user.require(Capability::Chat)?;
    let room_id = path(id, "roomId")?;
    state.rooms.leave(room_id, &principal.subject_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<HandshakeQuery>, QueryRejection>,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let principal = authenticate_handshake(&state.credentials, &headers, query.token.as_deref()).await;
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfirmationMode;
    use crate::network::server::testing;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    async fn call(router: &Router, method: Method, uri: &str, token: Option<&str>, payload: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match payload {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    async fn login_as(router: &Router, user: &str) -> String {
        let (status, body) = call(
            router,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"loginId": user, "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    fn criteria(want: &str, interests: &[&str]) -> Value {
        json!({"desiredGender": want, "minAge": 18, "maxAge": 40, "regionCode": "SEOUL", "interests": interests})
    }

    #[tokio::test]
    async fn test_login_shape() {
        let router = create_router(testing::state(ConfirmationMode::Immediate).await);
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"loginId": "alice", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["token"].is_string());
        assert!(body["expiresAt"].is_string());
        assert_eq!(body["user"]["loginId"], "alice");
        assert_eq!(body["user"]["email"], "alice@example.com");

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"loginId": "alice", "password": "wrong"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_match_requires_authentication() {
        let router = create_router(testing::state(ConfirmationMode::Immediate).await);
        let missing = call(&router, Method::POST, "/api/match/requests", None, Some(criteria("M", &["x"]))).await;
        let invalid = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some("not-a-token"),
            Some(criteria("M", &["x"])),
        )
        .await;
        assert_eq!(missing.0, StatusCode::UNAUTHORIZED);
        assert_eq!(missing, invalid);
    }

    #[tokio::test]
    async fn test_immediate_match_over_http() {
        let router = create_router(testing::state(ConfirmationMode::Immediate).await);
        let alice = login_as(&router, "alice").await;
        let bob = login_as(&router, "bob").await;

        let (status, first) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&alice),
            Some(criteria("M", &["music", "travel"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "QUEUED");
        assert_eq!(first["queueState"], "EMPTY");

        let (_, again) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&alice),
            Some(criteria("M", &["music"])),
        )
        .await;
        assert_eq!(again["status"], "ALREADY_IN_QUEUE");

        let (_, second) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&bob),
            Some(criteria("F", &["music", "games"])),
        )
        .await;
        assert_eq!(second["status"], "MATCHED");
        assert_eq!(second["partnerId"], "alice");
        assert!(second["roomId"].is_u64());
    }

    #[tokio::test]
    async fn test_mutual_decline_over_http() {
        let router = create_router(testing::state(ConfirmationMode::Mutual).await);
        let alice = login_as(&router, "alice").await;
        let bob = login_as(&router, "bob").await;

        call(&router, Method::POST, "/api/match/requests", Some(&alice), Some(criteria("M", &["music"]))).await;
        let (_, matched) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&bob),
            Some(criteria("F", &["music"])),
        )
        .await;
        let proposal = matched["proposalId"].as_str().unwrap().to_string();

        let (status, declined) = call(
            &router,
            Method::POST,
            &format!("/api/match/proposals/{proposal}/decline"),
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(declined["decision"], "DECLINED");
        assert_eq!(declined["myStatus"], "WAITING");
        assert_eq!(declined["partnerStatus"], "WAITING");

        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/api/match/proposals/{proposal}/accept"),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/match/proposals/not-a-uuid/accept",
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "proposalId");
    }

    #[tokio::test]
    async fn test_validation_errors_name_the_field() {
        let router = create_router(testing::state(ConfirmationMode::Immediate).await);
        let alice = login_as(&router, "alice").await;

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&alice),
            Some(json!({"desiredGender": "M", "minAge": 10, "maxAge": 40, "regionCode": "SEOUL", "interests": ["x"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "minAge");

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/match/requests",
            Some(&alice),
            Some(json!({"desiredGender": "Q"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "body");
    }

    #[tokio::test]
    async fn test_group_room_and_invites() {
        let router = create_router(testing::state(ConfirmationMode::Immediate).await);
        let alice = login_as(&router, "alice").await;
        let bob = login_as(&router, "bob").await;

        let (status, room) = call(&router, Method::POST, "/api/rooms", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(room["roomType"], "GROUP");
        let room_id = room["roomId"].as_u64().unwrap();

        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/api/rooms/{room_id}/invite"),
            Some(&alice),
            Some(json!({"targets": ["bob", "carol"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/rooms/{room_id}/invite"),
            Some(&bob),
            Some(json!({"targets": ["x", "y", "z"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "targets");

        let (status, _) = call(
            &router,
            Method::POST,
            "/api/rooms/999/invite",
            Some(&alice),
            Some(json!({"targets": ["bob"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invite_of_unknown_user_is_not_found() {
        let state = testing::state(ConfirmationMode::Immediate).await;
        let router = create_router(state.clone());
        let alice = login_as(&router, "alice").await;
        let (_, room) = call(&router, Method::POST, "/api/rooms", Some(&alice), None).await;
        let room_id = room["roomId"].as_u64().unwrap();

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/rooms/{room_id}/invite"),
            Some(&alice),
            Some(json!({"targets": ["bob", "nobody-by-that-name"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
        assert!(!state.rooms.is_active_member(room_id, "nobody-by-that-name").await);
        assert!(!state.rooms.is_active_member(room_id, "bob").await);
    }

    #[tokio::test]
    async fn test_leave_frees_the_seat() {
        let state = testing::state(ConfirmationMode::Immediate).await;
        let router = create_router(state.clone());
        let alice = login_as(&router, "alice").await;
        let bob = login_as(&router, "bob").await;
        let (_, room) = call(&router, Method::POST, "/api/rooms", Some(&alice), None).await;
        let room_id = room["roomId"].as_u64().unwrap();
        call(
            &router,
            Method::POST,
            &format!("/api/rooms/{room_id}/invite"),
            Some(&alice),
            Some(json!({"targets": ["bob"]})),
        )
        .await;

        let (status, _) = call(&router, Method::POST, &format!("/api/rooms/{room_id}/leave"), Some(&bob), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.rooms.is_active_member(room_id, "bob").await);

        let (status, body) = call(&router, Method::POST, &format!("/api/rooms/{room_id}/leave"), Some(&bob), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "REJECTED");

        let (status, _) = call(&router, Method::POST, "/api/rooms/999/leave", Some(&bob), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

//! End-to-end realtime tests over a real socket.

use chrono::{NaiveDate, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use matchtalk::config::{ConfirmationMode, MatchingConfig, TokenConfig};
use matchtalk::core::store::{Gender, InMemoryUserDirectory, Role, UserDirectory, UserRecord};
use matchtalk::matching::{Candidate, MatchCriteria};
use matchtalk::{AppConfig, AppState, MatchTalkServer, Storage};

const SECRET: &str = "integration-test-signing-key-with-enough-bytes";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn record(id: u64, login: &str, gender: Gender, year: i32) -> UserRecord {
    UserRecord {
        id,
        login_id: login.into(),
        display_name: format!("{login}-nick"),
        email: format!("{login}@example.com"),
        gender,
        birth_date: NaiveDate::from_ymd_opt(year, 4, 2).unwrap(),
        role: Role::User,
        enabled: true,
        password_hash: bcrypt::hash("pw", 4).unwrap(),
        failed_login_count: 0,
        locked_until: None,
        translate_to: None,
    }
}

async fn start(mode: ConfirmationMode) -> (Arc<MatchTalkServer>, String) {
    let users = InMemoryUserDirectory::new();
    users.upsert(record(1, "alice", Gender::F, 2000)).await.unwrap();
    users.upsert(record(2, "bob", Gender::M, 1999)).await.unwrap();

    let config = AppConfig {
        token: TokenConfig {
            secret: SECRET.into(),
            ..Default::default()
        },
        matching: MatchingConfig {
            confirmation: mode,
            ..Default::default()
        },
        ..Default::default()
    };
    let server = Arc::new(MatchTalkServer::new(config, Storage::in_memory(users)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });
    (server, format!("ws://{addr}/ws"))
}

fn token_for(server: &MatchTalkServer, user: &str) -> String {
    server.state().tokens.issue(user).unwrap().token
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame, or `None` once the socket closes.
async fn recv(ws: &mut Socket) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn connect_with_header(url: &str, token: &str) -> Socket {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(&mut ws, json!({"command": "CONNECT", "headers": {"Authorization": format!("Bearer {token}")}})).await;
    let connected = recv(&mut ws).await.unwrap();
    assert_eq!(connected["command"], "CONNECTED");
    ws
}

async fn subscribe(ws: &mut Socket, id: &str, destination: &str) {
    send(ws, json!({"command": "SUBSCRIBE", "id": id, "destination": destination})).await;
    // SUBSCRIBE has no receipt; give the reader loop a moment
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn candidate(state: &AppState, user: &str) -> Candidate {
    let record = state.storage.users.find(user).await.unwrap().unwrap();
    Candidate::from_record(&record, Utc::now().date_naive())
}

fn criteria(want: &str) -> MatchCriteria {
    serde_json::from_value(json!({
        "desiredGender": want,
        "minAge": 18,
        "maxAge": 40,
        "regionCode": "SEOUL",
        "interests": ["music"]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_handshake_token_survives_junk_connect_header() {
    let (server, url) = start(ConfirmationMode::Immediate).await;
    let token = token_for(&server, "alice");

    let (mut ws, _) = connect_async(format!("{url}?token={token}")).await.unwrap();
    send(&mut ws, json!({"command": "CONNECT", "headers": {"Authorization": "Bearer junk"}})).await;

    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(frame["command"], "CONNECTED");
    assert_eq!(frame["user"], "alice");
    server.shutdown();
}

#[tokio::test]
async fn test_connect_header_authenticates() {
    let (server, url) = start(ConfirmationMode::Immediate).await;
    let token = token_for(&server, "bob");
    let _ws = connect_with_header(&url, &token).await;
    server.shutdown();
}

#[tokio::test]
async fn test_bad_connect_is_rejected_and_closed() {
    let (server, url) = start(ConfirmationMode::Immediate).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut ws, json!({"command": "CONNECT", "headers": {"Authorization": "Bearer nope"}})).await;

    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(frame["command"], "ERROR");
    assert!(recv(&mut ws).await.is_none());
    server.shutdown();
}

#[tokio::test]
async fn test_frames_before_connect_are_refused() {
    let (server, url) = start(ConfirmationMode::Immediate).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut ws, json!({"command": "SUBSCRIBE", "id": "s1", "destination": "/user/queue/match-results"})).await;

    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(frame["command"], "ERROR");
    server.shutdown();
}

#[tokio::test]
async fn test_match_and_chat_end_to_end() {
    let (server, url) = start(ConfirmationMode::Immediate).await;
    let state = server.state().clone();

    let mut alice = connect_with_header(&url, &token_for(&server, "alice")).await;
    let mut bob = connect_with_header(&url, &token_for(&server, "bob")).await;
    subscribe(&mut alice, "m", "/user/queue/match-results").await;
    subscribe(&mut bob, "m", "/user/queue/match-results").await;

    state.engine.start_or_find(candidate(&state, "alice").await, criteria("M")).await.unwrap();
    let matched = state.engine.start_or_find(candidate(&state, "bob").await, criteria("F")).await.unwrap();
    let room_id = matched.room_id.unwrap();

    let queued = recv(&mut alice).await.unwrap();
    assert_eq!(queued["body"]["eventType"], "QUEUED");

    let to_alice = recv(&mut alice).await.unwrap();
    assert_eq!(to_alice["command"], "MESSAGE");
    assert_eq!(to_alice["destination"], "/user/queue/match-results");
    assert_eq!(to_alice["body"]["eventType"], "MATCH_FOUND");
    assert_eq!(to_alice["body"]["partnerId"], "bob");
    assert_eq!(to_alice["body"]["roomId"], room_id);

    let to_bob = recv(&mut bob).await.unwrap();
    assert_eq!(to_bob["body"]["partnerId"], "alice");
    assert_ne!(to_alice["body"]["shouldCreateOffer"], to_bob["body"]["shouldCreateOffer"]);

    let topic = format!("/topic/rooms/{room_id}");
    subscribe(&mut alice, "r", &topic).await;
    subscribe(&mut bob, "r", &topic).await;

    send(
        &mut alice,
        json!({
            "command": "SEND",
            "destination": format!("/app/chat.sendMessage/{room_id}"),
            "body": {"content": "hello", "senderId": "mallory"}
        }),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        let frame = recv(ws).await.unwrap();
        assert_eq!(frame["command"], "MESSAGE");
        assert_eq!(frame["destination"], topic);
        assert_eq!(frame["body"]["content"], "hello");
        assert_eq!(frame["body"]["senderId"], "alice");
    }
    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_withdraws_waiting_request() {
    let (server, url) = start(ConfirmationMode::Immediate).await;
    let state = server.state().clone();

    let mut alice = connect_with_header(&url, &token_for(&server, "alice")).await;
    state.engine.start_or_find(candidate(&state, "alice").await, criteria("M")).await.unwrap();
    assert_eq!(state.engine.waiting_count().await, 1);

    send(&mut alice, json!({"command": "DISCONNECT"})).await;
    assert!(recv(&mut alice).await.is_none());

    let mut withdrawn = false;
    for _ in 0..50 {
        if state.engine.waiting_count().await == 0 {
            withdrawn = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(withdrawn);
    server.shutdown();
}

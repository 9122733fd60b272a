//! Account Service
//!
//! Password login with a consecutive-failure lockout. A successful login
//! resets the counter and returns a session token from the codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::LockoutPolicy;
use crate::core::store::{FailedLogin, StoreError, UserDirectory, UserRecord};
use crate::core::token::TokenCodec;

/// Login request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Login identifier.
    pub login_id: String,
    /// Plaintext password.
    pub password: String,
}

/// Public part of a user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    /// Numeric id.
    pub id: u64,
    /// Login identifier.
    pub login_id: String,
    /// Display name.
    pub display_name: String,
    /// Contact address.
    pub email: String,
}

impl From<&UserRecord> for UserSummary {
    fn from(record: &UserRecord) -> Self {
        Self {
            id: record.id,
            login_id: record.login_id.clone(),
            display_name: record.display_name.clone(),
            email: record.email.clone(),
        }
    }
}

/// Login response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Bearer token.
    pub token: String,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Who logged in.
    pub user: UserSummary,
}

/// Login failures.
#[derive(Debug, Error)]
pub enum LoginError {
    /// Unknown login id or wrong password. Deliberately one variant.
    #[error("invalid login id or password")]
    InvalidCredentials,
    /// Too many failures; try again later.
    #[error("account is locked, try again in {remaining_minutes} minutes")]
    Locked {
        /// Whole minutes until the lock lifts, rounded up.
        remaining_minutes: i64,
    },
    /// Account switched off by an operator.
    #[error("account is disabled")]
    Disabled,
    /// Directory failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hashing or signing failed.
    #[error("{0}")]
    Internal(String),
}

fn minutes_until(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (until - now).num_seconds().max(0);
    (secs + 59) / 60
}

/// Login front door.
pub struct AccountService {
    users: Arc<dyn UserDirectory>,
    codec: Arc<TokenCodec>,
    policy: LockoutPolicy,
}

impl AccountService {
    /// Service over `users`, issuing tokens with `codec`.
    pub fn new(users: Arc<dyn UserDirectory>, codec: Arc<TokenCodec>, policy: LockoutPolicy) -> Self {
        Self { users, codec, policy }
    }

    /// Check credentials at `now` and issue a token.
    pub async fn login(&self, request: &LoginRequest, now: DateTime<Utc>) -> Result<LoginResponse, LoginError> {
        let Some(record) = self.users.find(&request.login_id).await? else {
            warn!("Login failed: unknown user");
            return Err(LoginError::InvalidCredentials);
        };

        if !record.enabled {
            warn!("Login refused for disabled account {}", record.login_id);
            return Err(LoginError::Disabled);
        }

        if let Some(until) = record.locked_until.filter(|until| *until > now) {
            warn!("Login refused for locked account {}", record.login_id);
            return Err(LoginError::Locked {
                remaining_minutes: minutes_until(until, now),
            });
        }

        // bcrypt blocks; run it on the blocking pool
        let password = request.password.clone();
        let hash = record.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| LoginError::Internal(format!("password check aborted: {e}")))?
            .map_err(|e| LoginError::Internal(format!("password check failed: {e}")))?;

        if !valid {
            let outcome = self
                .users
                .record_failed_login(&record.login_id, self.policy.threshold, self.policy.lock_for, now)
                .await?;
            return match outcome {
                FailedLogin::Counted(n) => {
                    warn!("Login failed for {} ({} consecutive)", record.login_id, n);
                    Err(LoginError::InvalidCredentials)
                }
                FailedLogin::Locked(until) => {
                    warn!("Account {} locked until {}", record.login_id, until);
                    Err(LoginError::Locked {
                        remaining_minutes: minutes_until(until, now),
                    })
                }
            };
        }

        self.users.record_successful_login(&record.login_id).await?;
        let issued = self
            .codec
            .issue_at(&record.login_id, now)
            .map_err(|e| LoginError::Internal(e.to_string()))?;

        info!("{} logged in", record.login_id);
        Ok(LoginResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            user: UserSummary::from(&record),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::codec;
    use crate::core::store::testing::{directory, user};
    use crate::core::store::Gender;
    use chrono::NaiveDate;

    async fn service() -> AccountService {
        let birth = NaiveDate::from_ymd_opt(1999, 3, 1).unwrap();
        let mut disabled = user(2, "carol", Gender::F, birth, "secret");
        disabled.enabled = false;
        let users = directory(vec![user(1, "alice", Gender::F, birth, "secret"), disabled]).await;
        AccountService::new(Arc::new(users), codec(), LockoutPolicy::default())
    }

    fn req(login: &str, password: &str) -> LoginRequest {
        LoginRequest {
            login_id: login.into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn test_login_issues_verifiable_token() {
        let service = service().await;
        let now = Utc::now();
        let response = service.login(&req("alice", "secret"), now).await.unwrap();

        assert_eq!(response.user.login_id, "alice");
        assert_eq!(response.user.display_name, "alice-nick");
        assert!(response.expires_at > now);
        assert_eq!(service.codec.verify(&response.token).unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_unknown_and_wrong_password_look_the_same() {
        let service = service().await;
        let now = Utc::now();
        let unknown = service.login(&req("nobody", "secret"), now).await.unwrap_err();
        let wrong = service.login(&req("alice", "nope"), now).await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn test_five_failures_lock_until_cooldown() {
        let service = service().await;
        let now = Utc::now();

        for _ in 0..4 {
            assert!(matches!(
                service.login(&req("alice", "nope"), now).await,
                Err(LoginError::InvalidCredentials)
            ));
        }
        assert!(matches!(
            service.login(&req("alice", "nope"), now).await,
            Err(LoginError::Locked { remaining_minutes: 10 })
        ));

        // correct password is refused while locked
        let later = now + chrono::Duration::minutes(3);
        assert!(matches!(
            service.login(&req("alice", "secret"), later).await,
            Err(LoginError::Locked { remaining_minutes: 7 })
        ));

        let after = now + chrono::Duration::minutes(11);
        assert!(service.login(&req("alice", "secret"), after).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let service = service().await;
        let now = Utc::now();
        for _ in 0..4 {
            let _ = service.login(&req("alice", "nope"), now).await;
        }
        service.login(&req("alice", "secret"), now).await.unwrap();
        // four more failures do not lock
        for _ in 0..4 {
            assert!(matches!(
                service.login(&req("alice", "nope"), now).await,
                Err(LoginError::InvalidCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn test_disabled_account_refused() {
        let service = service().await;
        assert!(matches!(
            service.login(&req("carol", "secret"), Utc::now()).await,
            Err(LoginError::Disabled)
        ));
    }
}

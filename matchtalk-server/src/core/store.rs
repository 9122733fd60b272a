//! Collaborator Ports
//!
//! Narrow interfaces to the systems this server does not own: the user
//! directory, chat persistence and the translation service. One concrete
//! implementation of each is chosen at startup through [`Storage::from_config`].

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{AppConfig, StorageBackend};
use crate::network::protocol::ChatMessage;

/// Collaborator failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or refused the call.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Seed data could not be loaded.
    #[error("failed to load seed data: {0}")]
    Seed(String),
}

/// Self-declared gender of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    /// Male.
    M,
    /// Female.
    F,
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Regular member.
    User,
    /// Moderator or operator.
    Admin,
}

/// A user as stored in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Numeric user id.
    pub id: u64,
    /// Unique login identifier. Also the token subject.
    pub login_id: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Contact address.
    pub email: String,
    /// Self-declared gender.
    pub gender: Gender,
    /// Birth date, used to derive the matching age.
    pub birth_date: NaiveDate,
    /// Account role.
    pub role: Role,
    /// Disabled accounts cannot log in or authenticate.
    pub enabled: bool,
    /// bcrypt hash of the password.
    pub password_hash: String,
    /// Consecutive failed logins since the last success or lock.
    #[serde(default)]
    pub failed_login_count: u32,
    /// Set while the account is locked.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// Preferred language for translated chat, if any.
    #[serde(default)]
    pub translate_to: Option<String>,
}

impl UserRecord {
    /// Age in whole years on `today`.
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        let mut age = today.year() - self.birth_date.year();
        if (today.month(), today.day()) < (self.birth_date.month(), self.birth_date.day()) {
            age -= 1;
        }
        age.max(0) as u32
    }
}

/// Outcome of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedLogin {
    /// Counter incremented, account still usable.
    Counted(u32),
    /// Threshold reached; account locked until the given instant.
    Locked(DateTime<Utc>),
}

/// User directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look a user up by login id.
    async fn find(&self, login_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Insert or replace a user.
    async fn upsert(&self, record: UserRecord) -> Result<(), StoreError>;

    /// Count a failed login, locking the account once `threshold` is reached.
    /// The counter restarts from zero when the lock is applied.
    async fn record_failed_login(
        &self,
        login_id: &str,
        threshold: u32,
        lock_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<FailedLogin, StoreError>;

    /// Clear the failure counter and any lock.
    async fn record_successful_login(&self, login_id: &str) -> Result<(), StoreError>;
}

/// Chat persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return it with its assigned id.
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    /// Messages of a room in insertion order.
    async fn room_history(&self, room_id: u64) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Machine translation.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target_lang`. `Ok(None)` means translation is
    /// not available and the message should go out untranslated.
    async fn translate(&self, text: &str, target_lang: &str) -> Result<Option<String>, StoreError>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

/// User directory held in process memory.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<BTreeMap<String, UserRecord>>,
}

/// Seed file entry. Passwords are hashed on load.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedUser {
    id: u64,
    login_id: String,
    display_name: String,
    email: String,
    gender: Gender,
    birth_date: NaiveDate,
    #[serde(default = "default_role")]
    role: Role,
    password: String,
    #[serde(default)]
    translate_to: Option<String>,
}

fn default_role() -> Role {
    Role::User
}

impl InMemoryUserDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load users from a JSON array of seed entries.
    pub fn from_seed_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        let seeds: Vec<SeedUser> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Seed(e.to_string()))?;

        let mut users = BTreeMap::new();
        for seed in seeds {
            let password_hash = bcrypt::hash(&seed.password, bcrypt::DEFAULT_COST)
                .map_err(|e| StoreError::Seed(e.to_string()))?;
            users.insert(
                seed.login_id.clone(),
                UserRecord {
                    id: seed.id,
                    login_id: seed.login_id,
                    display_name: seed.display_name,
                    email: seed.email,
                    gender: seed.gender,
                    birth_date: seed.birth_date,
                    role: seed.role,
                    enabled: true,
                    password_hash,
                    failed_login_count: 0,
                    locked_until: None,
                    translate_to: seed.translate_to,
                },
            );
        }

        info!("Seeded {} users from {}", users.len(), path.display());
        Ok(Self {
            users: RwLock::new(users),
        })
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find(&self, login_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(login_id).cloned())
    }

    async fn upsert(&self, record: UserRecord) -> Result<(), StoreError> {
        self.users.write().await.insert(record.login_id.clone(), record);
        Ok(())
    }

    async fn record_failed_login(
        &self,
        login_id: &str,
        threshold: u32,
        lock_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<FailedLogin, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(login_id)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown user {login_id}")))?;

        user.failed_login_count += 1;
        if user.failed_login_count >= threshold {
            let until = now
                + chrono::Duration::from_std(lock_for)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            user.locked_until = Some(until);
            user.failed_login_count = 0;
            return Ok(FailedLogin::Locked(until));
        }

        Ok(FailedLogin::Counted(user.failed_login_count))
    }

    async fn record_successful_login(&self, login_id: &str) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().await.get_mut(login_id) {
            user.failed_login_count = 0;
            user.locked_until = None;
        }
        Ok(())
    }
}

/// Chat log held in process memory.
#[derive(Default)]
pub struct InMemoryMessageStore {
    next_id: AtomicU64,
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryMessageStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, mut message: ChatMessage) -> Result<ChatMessage, StoreError> {
        message.message_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn room_history(&self, room_id: u64) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect())
    }
}

/// Translator used when no translation service is configured.
pub struct DisabledTranslator;

#[async_trait]
impl Translator for DisabledTranslator {
    async fn translate(&self, _text: &str, _target_lang: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

// =============================================================================
// SELECTION
// =============================================================================

/// The collaborator set the server runs with.
#[derive(Clone)]
pub struct Storage {
    /// User directory.
    pub users: Arc<dyn UserDirectory>,
    /// Chat persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Translation service.
    pub translator: Arc<dyn Translator>,
}

impl Storage {
    /// Pick implementations according to configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, StoreError> {
        match config.storage {
            StorageBackend::Memory => {
                let users = match &config.users_file {
                    Some(path) => InMemoryUserDirectory::from_seed_file(path)?,
                    None => InMemoryUserDirectory::new(),
                };
                Ok(Self::in_memory(users))
            }
        }
    }

    /// In-memory collaborators around a prepared directory.
    pub fn in_memory(users: InMemoryUserDirectory) -> Self {
        Self {
            users: Arc::new(users),
            messages: Arc::new(InMemoryMessageStore::new()),
            translator: Arc::new(DisabledTranslator),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by tests across modules.

    use super::*;

    /// A regular user with a cheap bcrypt hash of `password`.
    pub fn user(id: u64, login_id: &str, gender: Gender, birth_date: NaiveDate, password: &str) -> UserRecord {
        UserRecord {
            id,
            login_id: login_id.into(),
            display_name: format!("{login_id}-nick"),
            email: format!("{login_id}@example.com"),
            gender,
            birth_date,
            role: Role::User,
            enabled: true,
            password_hash: bcrypt::hash(password, 4).unwrap(),
            failed_login_count: 0,
            locked_until: None,
            translate_to: None,
        }
    }

    /// Directory preloaded with `records`.
    pub async fn directory(records: Vec<UserRecord>) -> InMemoryUserDirectory {
        let dir = InMemoryUserDirectory::new();
        for r in records {
            dir.upsert(r).await.unwrap();
        }
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_age_respects_birthday() {
        let u = user(1, "alice", Gender::F, date(2000, 6, 15), "pw");
        assert_eq!(u.age_on(date(2025, 6, 14)), 24);
        assert_eq!(u.age_on(date(2025, 6, 15)), 25);
    }

    #[tokio::test]
    async fn test_failed_logins_lock_and_reset() {
        let dir = directory(vec![user(1, "alice", Gender::F, date(2000, 1, 1), "pw")]).await;
        let now = Utc::now();
        let lock = Duration::from_secs(600);

        for n in 1..5 {
            let outcome = dir.record_failed_login("alice", 5, lock, now).await.unwrap();
            assert_eq!(outcome, FailedLogin::Counted(n));
        }
        let outcome = dir.record_failed_login("alice", 5, lock, now).await.unwrap();
        assert!(matches!(outcome, FailedLogin::Locked(_)));

        let record = dir.find("alice").await.unwrap().unwrap();
        assert_eq!(record.failed_login_count, 0);
        assert!(record.locked_until.is_some());

        dir.record_successful_login("alice").await.unwrap();
        let record = dir.find("alice").await.unwrap().unwrap();
        assert!(record.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_message_ids_are_assigned() {
        let store = InMemoryMessageStore::new();
        let base = ChatMessage {
            message_id: 0,
            room_id: 7,
            sender_id: "alice".into(),
            sender_display_name: "Alice".into(),
            content_type: crate::network::protocol::ContentType::Text,
            content: Some("hi".into()),
            translated_content: None,
            target_lang: None,
            attachment: None,
            created_at: Utc::now(),
        };
        let first = store.append(base.clone()).await.unwrap();
        let second = store.append(base).await.unwrap();
        assert_eq!(first.message_id, 1);
        assert_eq!(second.message_id, 2);
        assert_eq!(store.room_history(7).await.unwrap().len(), 2);
        assert!(store.room_history(8).await.unwrap().is_empty());
    }

    #[test]
    fn test_seed_file_loads() {
        let path = std::env::temp_dir().join(format!("matchtalk-seed-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"[{{"id":1,"loginId":"alice","displayName":"Alice","email":"a@example.com",
                "gender":"F","birthDate":"1999-04-01","password":"secret"}}]"#
        )
        .unwrap();

        let dir = InMemoryUserDirectory::from_seed_file(&path).unwrap();
        let record = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(dir.find("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(record.role, Role::User);
        assert!(bcrypt::verify("secret", &record.password_hash).unwrap());
        let _ = std::fs::remove_file(path);
    }
}

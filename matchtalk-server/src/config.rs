//! Runtime Configuration
//!
//! Every tunable lives here. Each section has a `Default` matching the
//! production values and [`AppConfig::from_env`] overlays environment
//! variables on top of those defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required setting {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed or is out of range.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Raw value as found in the environment.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Session token settings.
#[derive(Clone, Debug)]
pub struct TokenConfig {
    /// HMAC signing secret. Must be at least 32 bytes.
    pub secret: String,
    /// Lifetime of an issued token.
    pub ttl: Duration,
    /// Issuer tag written into and required from every token.
    pub issuer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl: Duration::from_secs(24 * 60 * 60),
            issuer: "MatchTalk".to_string(),
        }
    }
}

/// Bounded worker pool for inbound realtime frames.
#[derive(Clone, Debug)]
pub struct InboundPoolConfig {
    /// Workers kept alive even when idle.
    pub core_size: usize,
    /// Hard ceiling on concurrent workers.
    pub max_size: usize,
    /// Frames that may wait for a worker before submissions are rejected.
    pub queue_capacity: usize,
    /// Idle time after which a worker above `core_size` retires.
    pub keep_alive: Duration,
}

impl Default for InboundPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 4,
            max_size: 16,
            queue_capacity: 200,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// How a compatible pair becomes a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Room is created as soon as a compatible counterpart is found.
    Immediate,
    /// Both sides must accept a proposal before the room is created.
    Mutual,
}

impl FromStr for ConfirmationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "mutual" => Ok(Self::Mutual),
            other => Err(format!("expected immediate or mutual, got {other}")),
        }
    }
}

/// Matching engine timing and mode.
#[derive(Clone, Debug)]
pub struct MatchingConfig {
    /// Immediate or two-sided confirmation.
    pub confirmation: ConfirmationMode,
    /// How long a request may stay WAITING before it is expired.
    pub request_ttl: Duration,
    /// How long a proposal may wait for both decisions.
    pub proposal_ttl: Duration,
    /// Sweeper tick.
    pub sweep_interval: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confirmation: ConfirmationMode::Immediate,
            request_ttl: Duration::from_secs(120),
            proposal_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Login lockout policy.
#[derive(Clone, Debug)]
pub struct LockoutPolicy {
    /// Consecutive failures that lock the account.
    pub threshold: u32,
    /// How long the lock lasts.
    pub lock_for: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            lock_for: Duration::from_secs(10 * 60),
        }
    }
}

/// Which collaborator implementations back the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local maps. Contents are lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            other => Err(format!("unsupported storage backend {other}")),
        }
    }
}

/// Top-level server configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP and WebSocket listen address.
    pub bind_addr: SocketAddr,
    /// Token codec settings.
    pub token: TokenConfig,
    /// Inbound frame pool.
    pub pool: InboundPoolConfig,
    /// Matching engine.
    pub matching: MatchingConfig,
    /// Login lockout.
    pub lockout: LockoutPolicy,
    /// Collaborator implementation selector.
    pub storage: StorageBackend,
    /// Optional JSON file used to seed the in-memory user directory.
    pub users_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            token: TokenConfig::default(),
            pool: InboundPoolConfig::default(),
            matching: MatchingConfig::default(),
            lockout: LockoutPolicy::default(),
            storage: StorageBackend::Memory,
            users_file: None,
        }
    }
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let pool = InboundPoolConfig {
            core_size: parse_or(&lookup, "INBOUND_CORE_POOL_SIZE", defaults.pool.core_size)?,
            max_size: parse_or(&lookup, "INBOUND_MAX_POOL_SIZE", defaults.pool.max_size)?,
            queue_capacity: parse_or(&lookup, "INBOUND_QUEUE_CAPACITY", defaults.pool.queue_capacity)?,
            keep_alive: secs_or(&lookup, "INBOUND_KEEP_ALIVE_SECS", defaults.pool.keep_alive)?,
        };
        if pool.core_size == 0 || pool.max_size < pool.core_size {
            return Err(ConfigError::Invalid {
                key: "INBOUND_MAX_POOL_SIZE",
                value: pool.max_size.to_string(),
                reason: format!("must be >= core size {} and core size must be > 0", pool.core_size),
            });
        }

        let config = Self {
            bind_addr: parse_or(&lookup, "MATCHTALK_BIND", defaults.bind_addr)?,
            token: TokenConfig {
                secret,
                ttl: secs_or(&lookup, "JWT_EXPIRATION_SECS", defaults.token.ttl)?,
                issuer: defaults.token.issuer,
            },
            pool,
            matching: MatchingConfig {
                confirmation: parse_or(&lookup, "MATCH_CONFIRMATION", defaults.matching.confirmation)?,
                request_ttl: secs_or(&lookup, "MATCH_REQUEST_TTL_SECS", defaults.matching.request_ttl)?,
                proposal_ttl: secs_or(&lookup, "MATCH_PROPOSAL_TTL_SECS", defaults.matching.proposal_ttl)?,
                sweep_interval: secs_or(&lookup, "MATCH_SWEEP_INTERVAL_SECS", defaults.matching.sweep_interval)?,
            },
            lockout: LockoutPolicy {
                threshold: parse_or(&lookup, "LOGIN_LOCK_THRESHOLD", defaults.lockout.threshold)?,
                lock_for: Duration::from_secs(
                    60 * parse_or::<u64, _>(&lookup, "LOGIN_LOCK_MINUTES", defaults.lockout.lock_for.as_secs() / 60)?,
                ),
            },
            storage: parse_or(&lookup, "STORAGE_BACKEND", defaults.storage)?,
            users_file: lookup("MATCHTALK_USERS_FILE").map(PathBuf::from),
        };

        if config.matching.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "MATCH_SWEEP_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least one second".into(),
            });
        }

        Ok(config)
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

//! # MatchTalk Server
//!
//! Matchmaking, realtime chat relay and peer signaling for MatchTalk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      MATCHTALK SERVER                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/            - Transport-free building blocks            │
//! │  ├── token.rs     - HS256 session token codec                 │
//! │  ├── identity.rs  - Principal and capability resolution       │
//! │  └── store.rs     - User, message and translation ports       │
//! │                                                               │
//! │  auth/            - One credential contract, three entries    │
//! │  ├── request.rs   - Per HTTP request (never rejects)          │
//! │  ├── handshake.rs - Per WebSocket upgrade (never rejects)     │
//! │  └── frame.rs     - Per CONNECT frame (rejects)               │
//! │                                                               │
//! │  matching/        - Waiting set, proposals, outcome events    │
//! │  rooms.rs         - Room creation and membership              │
//! │  accounts.rs      - Login and lockout                         │
//! │                                                               │
//! │  network/         - Sockets and routing                       │
//! │  ├── http.rs      - REST endpoints and /ws upgrade            │
//! │  ├── server.rs    - App state, connection loop, sweeper       │
//! │  ├── protocol.rs  - Realtime frames and payloads              │
//! │  ├── broker.rs    - Connections and subscriptions             │
//! │  ├── relay.rs     - Chat, signal and match event delivery     │
//! │  ├── pool.rs      - Bounded inbound worker pool               │
//! │  └── audit.rs     - Connection lifecycle audit log            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//!
//! The matching engine lock may be held while the room table lock is taken,
//! never the reverse. Match events are delivered after the engine lock is
//! released, and broker deliveries happen outside the broker lock.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod accounts;
pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod matching;
pub mod network;
pub mod rooms;

// Re-export commonly used types
pub use config::AppConfig;
pub use crate::core::identity::{Capability, Principal};
pub use crate::core::store::Storage;
pub use crate::core::token::TokenCodec;
pub use error::AppError;
pub use matching::MatchingEngine;
pub use network::{AppState, MatchTalkServer};
pub use rooms::RoomProvisioner;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Network Layer
//!
//! HTTP endpoints, the WebSocket realtime channel and everything between a
//! socket and the domain components.

pub mod audit;
pub mod broker;
pub mod http;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod server;

pub use broker::Broker;
pub use http::create_router;
pub use pool::{InboundPool, PoolStats, SaturationError, Sequencer};
pub use protocol::{ClientFrame, ServerFrame};
pub use relay::{Relay, RelayError};
pub use server::{AppState, MatchTalkServer, ServerError};

//! Matchmaking.
//!
//! - `request` - criteria, candidates and the compatibility predicate
//! - `engine`  - waiting set, proposals and room hand-off
//! - `events`  - outcome events and their delivery seam

pub mod engine;
pub mod events;
pub mod request;

pub use engine::{
    Decision, MatchDecisionResponse, MatchError, MatchStartResponse, MatchStatus, MatchingEngine, QueueState,
    SweepReport,
};
pub use events::{MatchEvent, MatchEventType, MatchNotifier};
pub use request::{Candidate, GenderPreference, MatchCriteria, RequestStatus};

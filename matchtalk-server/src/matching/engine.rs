//! Matching Engine
//!
//! Pairs concurrently arriving users. The waiting set, the per-user index and
//! the pending proposals sit behind a single lock, so finding a counterpart
//! and reserving it is one atomic step. Rooms are provisioned while the lock
//! is held (engine lock, then room lock, never the reverse); events are
//! delivered after it is released.
//!
//! ```text
//! IDLE ──start──► WAITING ──compatible──► MATCHED ──┬─ immediate ───────► room, IDLE
//!                    ▲                               ├─ both accept ────► room, IDLE
//!                    └──────────── decline ──────────┘
//!        cancel / disconnect / timeout ──► CANCELLED, IDLE
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::events::{MatchEvent, MatchEventType, MatchNotifier, Outbox};
use super::request::{Candidate, MatchCriteria, MatchRequest, RequestStatus};
use crate::config::{ConfirmationMode, MatchingConfig};
use crate::error::ValidationError;
use crate::rooms::{RoomError, RoomProvisioner};

/// Result of a start-or-find call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// Paired with a counterpart.
    Matched,
    /// Entered the waiting set.
    Queued,
    /// Was already waiting; nothing changed.
    AlreadyInQueue,
}

/// Whether anyone else is waiting in the requester's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    /// Nobody else in the region.
    Empty,
    /// Others are waiting in the region.
    Waiting,
}

/// Response to start-or-find.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStartResponse {
    /// Outcome.
    pub status: MatchStatus,
    /// Set when queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_state: Option<QueueState>,
    /// Caller's request.
    pub request_id: Uuid,
    /// Pending proposal, in mutual mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    /// Room, in immediate mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    /// Counterpart login id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
    /// Counterpart display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_display_name: Option<String>,
    /// Other requests currently waiting.
    pub waiting_count: usize,
    /// Whether the caller creates the media offer.
    pub should_create_offer: bool,
    /// Human readable summary.
    pub message: String,
}

/// A participant's decision on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Go ahead.
    Accepted,
    /// No thanks.
    Declined,
}

/// Response to accept or decline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDecisionResponse {
    /// What the caller decided.
    pub decision: Decision,
    /// Proposal decided on.
    pub proposal_id: Uuid,
    /// Room, once both accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    /// Caller's request status afterwards.
    pub my_status: RequestStatus,
    /// Counterpart's request status afterwards.
    pub partner_status: RequestStatus,
    /// Both sides have accepted.
    pub both_accepted: bool,
    /// Human readable summary.
    pub message: String,
}

/// Matching errors. Expected outcomes such as a duplicate enqueue are
/// statuses, not errors.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Criteria failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Proposal unknown, resolved, or not the caller's.
    #[error("proposal {0} not found")]
    ProposalNotFound(Uuid),
    /// Room provisioning failed.
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// What a sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// WAITING requests past their time-to-live.
    pub expired_requests: usize,
    /// Proposals that did not collect both decisions in time.
    pub expired_proposals: usize,
}

#[derive(Debug, Clone)]
struct Proposal {
    id: Uuid,
    initiator: Uuid,
    responder: Uuid,
    created_at: Instant,
}

impl Proposal {
    /// `(mine, theirs, i_initiated)` for the request owned by `user`.
    fn sides_for(&self, state: &EngineState, user: &str) -> Option<(Uuid, Uuid, bool)> {
        let owner = |id: &Uuid| state.requests.get(id).map(|r| r.requester.user_id.as_str());
        if owner(&self.initiator) == Some(user) {
            Some((self.initiator, self.responder, true))
        } else if owner(&self.responder) == Some(user) {
            Some((self.responder, self.initiator, false))
        } else {
            None
        }
    }
}

#[derive(Default)]
struct EngineState {
    next_seq: u64,
    requests: BTreeMap<Uuid, MatchRequest>,
    /// seq -> request, scanned in order.
    waiting: BTreeMap<u64, Uuid>,
    by_user: BTreeMap<String, Uuid>,
    proposals: BTreeMap<Uuid, Proposal>,
    proposal_of: BTreeMap<Uuid, Uuid>,
}

impl EngineState {
    fn insert(&mut self, request: MatchRequest) {
        self.by_user.insert(request.requester.user_id.clone(), request.id);
        if request.status == RequestStatus::Waiting {
            self.waiting.insert(request.seq, request.id);
        }
        self.requests.insert(request.id, request);
    }

    fn remove(&mut self, id: Uuid) -> Option<MatchRequest> {
        let request = self.requests.remove(&id)?;
        self.waiting.remove(&request.seq);
        if self.by_user.get(&request.requester.user_id) == Some(&id) {
            self.by_user.remove(&request.requester.user_id);
        }
        self.proposal_of.remove(&id);
        Some(request)
    }

    fn requeue(&mut self, id: Uuid) {
        self.proposal_of.remove(&id);
        if let Some(request) = self.requests.get_mut(&id) {
            request.status = RequestStatus::Waiting;
            self.waiting.insert(request.seq, id);
        }
    }

    /// First compatible WAITING request in insertion order.
    fn find_partner(&self, request: &MatchRequest) -> Option<(Uuid, Candidate)> {
        self.waiting
            .values()
            .filter_map(|id| self.requests.get(id))
            .find(|other| request.is_compatible_with(other))
            .map(|other| (other.id, other.requester.clone()))
    }

    fn queue_snapshot(&self, user: &str, region: &str) -> (usize, QueueState) {
        let mut others = 0;
        let mut same_region = false;
        for id in self.waiting.values() {
            if let Some(r) = self.requests.get(id) {
                if r.requester.user_id != user {
                    others += 1;
                    same_region |= r.region() == region;
                }
            }
        }
        let state = if same_region { QueueState::Waiting } else { QueueState::Empty };
        (others, state)
    }

    fn status(&self, id: Uuid) -> RequestStatus {
        self.requests
            .get(&id)
            .map(|r| r.status)
            .unwrap_or(RequestStatus::Cancelled)
    }

    fn user_of(&self, id: Uuid) -> String {
        self.requests
            .get(&id)
            .map(|r| r.requester.user_id.clone())
            .unwrap_or_default()
    }
}

/// The matching engine.
pub struct MatchingEngine {
    config: MatchingConfig,
    rooms: Arc<RoomProvisioner>,
    notifier: Arc<dyn MatchNotifier>,
    state: Mutex<EngineState>,
}

impl MatchingEngine {
    /// Engine provisioning rooms through `rooms` and reporting through `notifier`.
    pub fn new(config: MatchingConfig, rooms: Arc<RoomProvisioner>, notifier: Arc<dyn MatchNotifier>) -> Self {
        Self {
            config,
            rooms,
            notifier,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Match `candidate` against the waiting set or enqueue them.
    pub async fn start_or_find(
        &self,
        candidate: Candidate,
        criteria: MatchCriteria,
    ) -> Result<MatchStartResponse, MatchError> {
        criteria.validate()?;

        let mut outbox = Outbox::default();
        let response = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if let Some(existing) = state
                .by_user
                .get(&candidate.user_id)
                .and_then(|id| Self::existing_response(state, *id))
            {
                return Ok(existing);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let request = MatchRequest::new(seq, candidate, criteria, Instant::now());

            match state.find_partner(&request) {
                Some((partner_id, partner)) => self.pair(state, request, partner_id, partner, &mut outbox).await?,
                None => Self::enqueue(state, request, &mut outbox),
            }
        };

        outbox.deliver(self.notifier.as_ref()).await;
        Ok(response)
    }

    fn existing_response(state: &EngineState, id: Uuid) -> Option<MatchStartResponse> {
        let request = state.requests.get(&id)?;
        let user = request.requester.user_id.as_str();

        if request.status == RequestStatus::Waiting {
            let (waiting_count, queue_state) = state.queue_snapshot(user, &request.region());
            return Some(MatchStartResponse {
                status: MatchStatus::AlreadyInQueue,
                queue_state: Some(queue_state),
                request_id: id,
                proposal_id: None,
                room_id: None,
                partner_id: None,
                partner_display_name: None,
                waiting_count,
                should_create_offer: false,
                message: "Already waiting for a match".into(),
            });
        }

        let proposal = state.proposal_of.get(&id).and_then(|p| state.proposals.get(p));
        let sides = proposal.and_then(|p| p.sides_for(state, user));
        let partner = sides.and_then(|(_, theirs, _)| state.requests.get(&theirs));
        Some(MatchStartResponse {
            status: MatchStatus::Matched,
            queue_state: None,
            request_id: id,
            proposal_id: proposal.map(|p| p.id),
            room_id: None,
            partner_id: partner.map(|p| p.requester.user_id.clone()),
            partner_display_name: partner.map(|p| p.requester.display_name.clone()),
            waiting_count: 0,
            should_create_offer: sides.is_some_and(|(_, _, initiated)| initiated),
            message: "A match is already waiting for your decision".into(),
        })
    }

    fn enqueue(state: &mut EngineState, request: MatchRequest, outbox: &mut Outbox) -> MatchStartResponse {
        let user = request.requester.user_id.clone();
        let (waiting_count, queue_state) = state.queue_snapshot(&user, &request.region());
        let id = request.id;

        let message = match queue_state {
            QueueState::Empty => "Queued; nobody else is waiting in your region yet",
            QueueState::Waiting => "Queued; waiting for a compatible partner",
        };
        outbox.push(&user, MatchEvent::new(MatchEventType::Queued, id, message));
        state.insert(request);
        debug!("{} queued ({} others waiting)", user, waiting_count);

        MatchStartResponse {
            status: MatchStatus::Queued,
            queue_state: Some(queue_state),
            request_id: id,
            proposal_id: None,
            room_id: None,
            partner_id: None,
            partner_display_name: None,
            waiting_count,
            should_create_offer: false,
            message: message.into(),
        }
    }

    async fn pair(
        &self,
        state: &mut EngineState,
        mut request: MatchRequest,
        partner_id: Uuid,
        partner: Candidate,
        outbox: &mut Outbox,
    ) -> Result<MatchStartResponse, MatchError> {
        let Candidate {
            user_id: partner_user,
            display_name: partner_name,
            ..
        } = partner;
        let user = request.requester.user_id.clone();
        let user_name = request.requester.display_name.clone();

        let found = |recipient_request: Uuid, other: &str, other_name: &str, offer: bool| MatchEvent {
            partner_id: Some(other.to_string()),
            partner_display_name: Some(other_name.to_string()),
            should_create_offer: offer,
            ..MatchEvent::new(MatchEventType::MatchFound, recipient_request, format!("Matched with {other_name}"))
        };

        match self.config.confirmation {
            ConfirmationMode::Immediate => {
                let room = self.rooms.create_private(&partner_user, &user).await?;
                state.remove(partner_id);

                outbox.push(
                    &partner_user,
                    MatchEvent { room_id: Some(room.id), ..found(partner_id, &user, &user_name, false) },
                );
                outbox.push(
                    &user,
                    MatchEvent { room_id: Some(room.id), ..found(request.id, &partner_user, &partner_name, true) },
                );
                info!("Matched {} with {} in room {}", user, partner_user, room.id);

                Ok(MatchStartResponse {
                    status: MatchStatus::Matched,
                    queue_state: None,
                    request_id: request.id,
                    proposal_id: None,
                    room_id: Some(room.id),
                    partner_id: Some(partner_user),
                    partner_display_name: Some(partner_name.clone()),
                    waiting_count: 0,
                    should_create_offer: true,
                    message: format!("Matched with {partner_name}"),
                })
            }
            ConfirmationMode::Mutual => {
                let proposal = Proposal {
                    id: Uuid::new_v4(),
                    initiator: request.id,
                    responder: partner_id,
                    created_at: Instant::now(),
                };

                if let Some(partner) = state.requests.get_mut(&partner_id) {
                    partner.status = RequestStatus::Matched;
                    let seq = partner.seq;
                    state.waiting.remove(&seq);
                }
                request.status = RequestStatus::Matched;
                let request_id = request.id;
                state.insert(request);
                state.proposal_of.insert(request_id, proposal.id);
                state.proposal_of.insert(partner_id, proposal.id);

                outbox.push(
                    &partner_user,
                    MatchEvent { proposal_id: Some(proposal.id), ..found(partner_id, &user, &user_name, false) },
                );
                outbox.push(
                    &user,
                    MatchEvent { proposal_id: Some(proposal.id), ..found(request_id, &partner_user, &partner_name, true) },
                );
                info!("Proposed {} with {} ({})", user, partner_user, proposal.id);

                let proposal_id = proposal.id;
                state.proposals.insert(proposal.id, proposal);

                Ok(MatchStartResponse {
                    status: MatchStatus::Matched,
                    queue_state: None,
                    request_id,
                    proposal_id: Some(proposal_id),
                    room_id: None,
                    partner_id: Some(partner_user),
                    partner_display_name: Some(partner_name.clone()),
                    waiting_count: 0,
                    should_create_offer: true,
                    message: format!("Matched with {partner_name}; waiting for both to accept"),
                })
            }
        }
    }

    /// Record `user`'s decision on a proposal.
    pub async fn decide(
        &self,
        user: &str,
        proposal_id: Uuid,
        decision: Decision,
    ) -> Result<MatchDecisionResponse, MatchError> {
        let mut outbox = Outbox::default();
        let response = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let proposal = state
                .proposals
                .get(&proposal_id)
                .cloned()
                .ok_or(MatchError::ProposalNotFound(proposal_id))?;
            let (mine, theirs, i_initiated) = proposal
                .sides_for(state, user)
                .ok_or(MatchError::ProposalNotFound(proposal_id))?;
            let partner_user = state.user_of(theirs);

            match decision {
                Decision::Accepted => {
                    self.accept(state, &proposal, (mine, theirs, i_initiated), user, &partner_user, &mut outbox)
                        .await?
                }
                Decision::Declined => {
                    state.proposals.remove(&proposal_id);
                    let me = user.to_string();
                    for (a, b) in [(mine, &partner_user), (theirs, &me)] {
                        if let Some(r) = state.requests.get_mut(&a) {
                            r.excluded.insert(b.clone());
                        }
                        state.requeue(a);
                    }

                    outbox.push(
                        &partner_user,
                        MatchEvent {
                            proposal_id: Some(proposal_id),
                            partner_id: Some(user.to_string()),
                            ..MatchEvent::new(MatchEventType::PartnerDeclined, theirs, "Your partner declined")
                        },
                    );
                    for (recipient, request) in [(user, mine), (partner_user.as_str(), theirs)] {
                        outbox.push(
                            recipient,
                            MatchEvent {
                                proposal_id: Some(proposal_id),
                                ..MatchEvent::new(
                                    MatchEventType::MatchCancelled,
                                    request,
                                    "Match cancelled; you are back in the queue",
                                )
                            },
                        );
                    }
                    info!("{} declined proposal {}", user, proposal_id);

                    MatchDecisionResponse {
                        decision,
                        proposal_id,
                        room_id: None,
                        my_status: state.status(mine),
                        partner_status: state.status(theirs),
                        both_accepted: false,
                        message: "Declined; both requests are back in the queue".into(),
                    }
                }
            }
        };

        outbox.deliver(self.notifier.as_ref()).await;
        Ok(response)
    }

    async fn accept(
        &self,
        state: &mut EngineState,
        proposal: &Proposal,
        (mine, theirs, i_initiated): (Uuid, Uuid, bool),
        user: &str,
        partner_user: &str,
        outbox: &mut Outbox,
    ) -> Result<MatchDecisionResponse, MatchError> {
        if state.status(theirs) != RequestStatus::Confirmed {
            let newly = state.status(mine) != RequestStatus::Confirmed;
            if let Some(r) = state.requests.get_mut(&mine) {
                r.status = RequestStatus::Confirmed;
            }
            if newly {
                outbox.push(
                    partner_user,
                    MatchEvent {
                        proposal_id: Some(proposal.id),
                        partner_id: Some(user.to_string()),
                        ..MatchEvent::new(MatchEventType::PartnerAccepted, theirs, "Your partner accepted")
                    },
                );
            }
            return Ok(MatchDecisionResponse {
                decision: Decision::Accepted,
                proposal_id: proposal.id,
                room_id: None,
                my_status: RequestStatus::Confirmed,
                partner_status: state.status(theirs),
                both_accepted: false,
                message: "Accepted; waiting for your partner".into(),
            });
        }

        let room = self.rooms.create_private(partner_user, user).await?;
        state.proposals.remove(&proposal.id);
        state.remove(mine);
        state.remove(theirs);

        for (recipient, request, offer) in [(user, mine, i_initiated), (partner_user, theirs, !i_initiated)] {
            outbox.push(
                recipient,
                MatchEvent {
                    proposal_id: Some(proposal.id),
                    room_id: Some(room.id),
                    should_create_offer: offer,
                    ..MatchEvent::new(MatchEventType::BothConfirmed, request, "Both accepted; room is ready")
                },
            );
        }
        info!("Proposal {} confirmed into room {}", proposal.id, room.id);

        Ok(MatchDecisionResponse {
            decision: Decision::Accepted,
            proposal_id: proposal.id,
            room_id: Some(room.id),
            my_status: RequestStatus::Confirmed,
            partner_status: RequestStatus::Confirmed,
            both_accepted: true,
            message: "Both accepted; room is ready".into(),
        })
    }

    /// Withdraw `user` from matching. A pending proposal is cancelled and the
    /// counterpart goes back to WAITING. Returns whether anything was withdrawn.
    pub async fn cancel(&self, user: &str) -> bool {
        let mut outbox = Outbox::default();
        let cancelled = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(&id) = state.by_user.get(user) else {
                return false;
            };

            if let Some(proposal_id) = state.proposal_of.get(&id).copied() {
                if let Some(proposal) = state.proposals.remove(&proposal_id) {
                    let theirs = if proposal.initiator == id { proposal.responder } else { proposal.initiator };
                    let partner_user = state.user_of(theirs);
                    state.requeue(theirs);
                    outbox.push(
                        &partner_user,
                        MatchEvent {
                            proposal_id: Some(proposal_id),
                            partner_id: Some(user.to_string()),
                            ..MatchEvent::new(
                                MatchEventType::MatchCancelled,
                                theirs,
                                "Your partner left; you are back in the queue",
                            )
                        },
                    );
                }
            }

            state.remove(id);
            info!("{} left matching", user);
            true
        };

        outbox.deliver(self.notifier.as_ref()).await;
        cancelled
    }

    /// Expire stale requests and proposals as of `now`.
    pub async fn sweep_expired(&self, now: Instant) -> SweepReport {
        let mut outbox = Outbox::default();
        let mut report = SweepReport::default();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let stale_proposals: Vec<Proposal> = state
                .proposals
                .values()
                .filter(|p| now.saturating_duration_since(p.created_at) >= self.config.proposal_ttl)
                .cloned()
                .collect();
            for proposal in stale_proposals {
                state.proposals.remove(&proposal.id);
                for id in [proposal.initiator, proposal.responder] {
                    if let Some(request) = state.remove(id) {
                        outbox.push(
                            &request.requester.user_id,
                            MatchEvent {
                                proposal_id: Some(proposal.id),
                                ..MatchEvent::new(MatchEventType::MatchCancelled, id, "Match confirmation timed out")
                            },
                        );
                    }
                }
                report.expired_proposals += 1;
            }

            let stale_requests: Vec<Uuid> = state
                .waiting
                .values()
                .copied()
                .filter(|id| {
                    state
                        .requests
                        .get(id)
                        .is_some_and(|r| now.saturating_duration_since(r.requested_at) >= self.config.request_ttl)
                })
                .collect();
            for id in stale_requests {
                if let Some(request) = state.remove(id) {
                    outbox.push(
                        &request.requester.user_id,
                        MatchEvent::new(MatchEventType::RequestExpired, id, "No match found in time"),
                    );
                    report.expired_requests += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                "Sweep expired {} requests and {} proposals",
                report.expired_requests, report.expired_proposals
            );
        }
        outbox.deliver(self.notifier.as_ref()).await;
        report
    }

    /// Current status of `user`'s active request.
    pub async fn status_of(&self, user: &str) -> Option<RequestStatus> {
        let state = self.state.lock().await;
        state.by_user.get(user).map(|id| state.status(*id))
    }

    /// Requests currently WAITING.
    pub async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// Proposals awaiting decisions.
    pub async fn pending_proposals(&self) -> usize {
        self.state.lock().await.proposals.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Match requests and compatibility.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use uuid::Uuid;

use crate::core::store::{Gender, UserRecord};
use crate::error::ValidationError;

/// Youngest age a request may ask for.
pub const MIN_MATCH_AGE: u32 = 18;
/// Oldest age a request may ask for.
pub const MAX_MATCH_AGE: u32 = 99;
/// Upper bound on declared interests.
pub const MAX_INTERESTS: usize = 16;

/// Which gender the requester wants to meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenderPreference {
    /// Male only.
    M,
    /// Female only.
    F,
    /// Anyone.
    A,
}

impl GenderPreference {
    /// Whether a user of `gender` satisfies this preference.
    pub fn admits(self, gender: Gender) -> bool {
        matches!(
            (self, gender),
            (GenderPreference::A, _) | (GenderPreference::M, Gender::M) | (GenderPreference::F, Gender::F)
        )
    }
}

/// What the requester is looking for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCriteria {
    /// Gender preference.
    pub desired_gender: GenderPreference,
    /// Youngest acceptable counterpart.
    pub min_age: u32,
    /// Oldest acceptable counterpart.
    pub max_age: u32,
    /// Region the requester is in; counterparts must share it.
    pub region_code: String,
    /// Topics the requester wants to talk about.
    pub interests: Vec<String>,
}

impl MatchCriteria {
    /// Check field constraints.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_MATCH_AGE..=MAX_MATCH_AGE).contains(&self.min_age) {
            return Err(ValidationError::new(
                "minAge",
                format!("must be between {MIN_MATCH_AGE} and {MAX_MATCH_AGE}"),
            ));
        }
        if !(MIN_MATCH_AGE..=MAX_MATCH_AGE).contains(&self.max_age) {
            return Err(ValidationError::new(
                "maxAge",
                format!("must be between {MIN_MATCH_AGE} and {MAX_MATCH_AGE}"),
            ));
        }
        if self.min_age > self.max_age {
            return Err(ValidationError::new("maxAge", "must not be below minAge"));
        }
        if self.region_code.trim().is_empty() {
            return Err(ValidationError::new("regionCode", "must not be blank"));
        }
        if self.normalized_interests().is_empty() {
            return Err(ValidationError::new("interests", "at least one interest is required"));
        }
        if self.interests.len() > MAX_INTERESTS {
            return Err(ValidationError::new(
                "interests",
                format!("at most {MAX_INTERESTS} interests are allowed"),
            ));
        }
        Ok(())
    }

    /// Interests trimmed, lowercased and deduplicated.
    pub fn normalized_interests(&self) -> BTreeSet<String> {
        self.interests
            .iter()
            .map(|i| i.trim().to_lowercase())
            .filter(|i| !i.is_empty())
            .collect()
    }

    /// Whether `candidate` satisfies gender and age.
    pub fn accepts(&self, candidate: &Candidate) -> bool {
        self.desired_gender.admits(candidate.gender)
            && (self.min_age..=self.max_age).contains(&candidate.age)
    }
}

/// The requester's own attributes, as seen by others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Login id.
    pub user_id: String,
    /// Name shown to the counterpart.
    pub display_name: String,
    /// Self-declared gender.
    pub gender: Gender,
    /// Age in years.
    pub age: u32,
}

impl Candidate {
    /// Candidate view of a directory record.
    pub fn from_record(record: &UserRecord, today: NaiveDate) -> Self {
        Self {
            user_id: record.login_id.clone(),
            display_name: record.display_name.clone(),
            gender: record.gender,
            age: record.age_on(today),
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// In the waiting set.
    Waiting,
    /// Paired; room created or proposal pending.
    Matched,
    /// Accepted its side of a proposal.
    Confirmed,
    /// Withdrawn, expired or abandoned.
    Cancelled,
}

/// A pending request to be matched.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    /// Request id.
    pub id: Uuid,
    /// Insertion order; the waiting set is scanned in this order.
    pub seq: u64,
    /// Who is asking.
    pub requester: Candidate,
    /// What they ask for.
    pub criteria: MatchCriteria,
    /// Normalized interests.
    pub interests: BTreeSet<String>,
    /// Current status.
    pub status: RequestStatus,
    /// When the request entered the queue.
    pub requested_at: Instant,
    /// Users this request must not be paired with again.
    pub excluded: BTreeSet<String>,
}

impl MatchRequest {
    /// New WAITING request.
    pub fn new(seq: u64, requester: Candidate, criteria: MatchCriteria, now: Instant) -> Self {
        let interests = criteria.normalized_interests();
        Self {
            id: Uuid::new_v4(),
            seq,
            requester,
            criteria,
            interests,
            status: RequestStatus::Waiting,
            requested_at: now,
            excluded: BTreeSet::new(),
        }
    }

    /// Region code compared case-insensitively.
    pub fn region(&self) -> String {
        self.criteria.region_code.trim().to_ascii_uppercase()
    }

    /// Symmetric compatibility: each side accepts the other, same region,
    /// overlapping interests, and neither has excluded the other.
    pub fn is_compatible_with(&self, other: &MatchRequest) -> bool {
        self.requester.user_id != other.requester.user_id
            && !self.excluded.contains(&other.requester.user_id)
            && !other.excluded.contains(&self.requester.user_id)
            && self.region() == other.region()
            && self.criteria.accepts(&other.requester)
            && other.criteria.accepts(&self.requester)
            && !self.interests.is_disjoint(&other.interests)
    }
}

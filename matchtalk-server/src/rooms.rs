//! Room Provisioning
//!
//! Rooms and their member lists live in one table behind one lock, so a room
//! is never visible without its initial members.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Most users a single invite call may add.
pub const MAX_INVITE_TARGETS: usize = 2;

/// Room type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomKind {
    /// One-to-one room created by a confirmed match.
    Private,
    /// Small group hosted by its creator.
    Group,
    /// One-to-one room for an anonymous random pairing.
    Random,
}

impl RoomKind {
    /// Member capacity of this room type.
    pub fn capacity(self) -> usize {
        match self {
            RoomKind::Private | RoomKind::Random => 2,
            RoomKind::Group => 4,
        }
    }
}

/// Role of a member inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    /// Room owner.
    Host,
    /// Everyone else.
    Member,
}

/// A conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Room id.
    #[serde(rename = "roomId")]
    pub id: u64,
    /// Room type.
    #[serde(rename = "roomType")]
    pub kind: RoomKind,
    /// Member capacity.
    pub capacity: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Membership of one user in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    /// Room id.
    pub room_id: u64,
    /// Login id of the member.
    pub user_id: String,
    /// Host or member.
    pub role: MemberRole,
    /// When the user was admitted.
    pub joined_at: DateTime<Utc>,
    /// When the user left, if they did.
    pub left_at: Option<DateTime<Utc>>,
}

impl RoomMember {
    /// Still in the room.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// No such room.
    #[error("room {0} not found")]
    NotFound(u64),
    /// Caller is not an active member.
    #[error("{user} is not a member of room {room_id}")]
    NotAMember {
        /// Room id.
        room_id: u64,
        /// Caller.
        user: String,
    },
    /// Invites are only possible in group rooms.
    #[error("room {0} is not a group room")]
    NotGroupRoom(u64),
    /// Too many invite targets at once.
    #[error("at most {max} users can be invited at once")]
    TooManyTargets {
        /// Limit.
        max: usize,
    },
    /// Admission would exceed capacity.
    #[error("room is full (capacity {capacity})")]
    CapacityExceeded {
        /// Room capacity.
        capacity: usize,
    },
    /// Initial member list does not fit the room type.
    #[error("invalid member list: {0}")]
    InvalidMembers(String),
}

#[derive(Default)]
struct RoomTable {
    rooms: BTreeMap<u64, Room>,
    members: BTreeMap<(u64, String), RoomMember>,
}

impl RoomTable {
    fn active_count(&self, room_id: u64) -> usize {
        self.members
            .range((room_id, String::new())..)
            .take_while(|((id, _), _)| *id == room_id)
            .filter(|(_, m)| m.is_active())
            .count()
    }

    fn is_active(&self, room_id: u64, user: &str) -> bool {
        self.members
            .get(&(room_id, user.to_string()))
            .is_some_and(RoomMember::is_active)
    }

    fn admit(&mut self, room_id: u64, user: &str, role: MemberRole, now: DateTime<Utc>) {
        self.members.insert(
            (room_id, user.to_string()),
            RoomMember {
                room_id,
                user_id: user.to_string(),
                role,
                joined_at: now,
                left_at: None,
            },
        );
    }
}

/// Creates rooms and tracks membership.
pub struct RoomProvisioner {
    next_id: AtomicU64,
    table: RwLock<RoomTable>,
}

impl Default for RoomProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomProvisioner {
    /// Empty provisioner. Room ids start at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: RwLock::new(RoomTable::default()),
        }
    }

    /// Create a room with its initial members in one step.
    ///
    /// One-to-one kinds take exactly two distinct members, both `MEMBER`.
    /// A group room takes exactly its creator, who becomes `HOST`.
    pub async fn create_room(&self, kind: RoomKind, members: &[&str]) -> Result<Room, RoomError> {
        match kind {
            RoomKind::Private | RoomKind::Random => {
                if members.len() != 2 || members[0] == members[1] {
                    return Err(RoomError::InvalidMembers(format!(
                        "{kind:?} room needs two distinct members"
                    )));
                }
            }
            RoomKind::Group => {
                if members.len() != 1 {
                    return Err(RoomError::InvalidMembers("group room needs exactly one creator".into()));
                }
            }
        }

        let now = Utc::now();
        let mut table = self.table.write().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let room = Room {
            id,
            kind,
            capacity: kind.capacity(),
            created_at: now,
        };
        table.rooms.insert(id, room.clone());

        let role = if kind == RoomKind::Group { MemberRole::Host } else { MemberRole::Member };
        for user in members {
            table.admit(id, user, role, now);
        }

        info!("Created {:?} room {} for {:?}", kind, id, members);
        Ok(room)
    }

    /// Private room for a matched pair.
    pub async fn create_private(&self, a: &str, b: &str) -> Result<Room, RoomError> {
        self.create_room(RoomKind::Private, &[a, b]).await
    }

    /// Group room hosted by `creator`.
    pub async fn create_group(&self, creator: &str) -> Result<Room, RoomError> {
        self.create_room(RoomKind::Group, &[creator]).await
    }

    /// Invite up to [`MAX_INVITE_TARGETS`] users into a group room. Targets
    /// already in the room are skipped. Returns the newly admitted users.
    pub async fn invite(&self, room_id: u64, inviter: &str, targets: &[String]) -> Result<Vec<String>, RoomError> {
        if targets.len() > MAX_INVITE_TARGETS {
            return Err(RoomError::TooManyTargets { max: MAX_INVITE_TARGETS });
        }

        let mut table = self.table.write().await;
        let room = table.rooms.get(&room_id).cloned().ok_or(RoomError::NotFound(room_id))?;
        if room.kind != RoomKind::Group {
            return Err(RoomError::NotGroupRoom(room_id));
        }
        if !table.is_active(room_id, inviter) {
            return Err(RoomError::NotAMember {
                room_id,
                user: inviter.to_string(),
            });
        }

        let mut fresh: Vec<String> = Vec::new();
        for target in targets {
            if !table.is_active(room_id, target) && !fresh.contains(target) {
                fresh.push(target.clone());
            }
        }
        if table.active_count(room_id) + fresh.len() > room.capacity {
            return Err(RoomError::CapacityExceeded { capacity: room.capacity });
        }

        let now = Utc::now();
        for user in &fresh {
            table.admit(room_id, user, MemberRole::Member, now);
        }
        if !fresh.is_empty() {
            info!("{} invited {:?} into room {}", inviter, fresh, room_id);
        }
        Ok(fresh)
    }

    /// Mark `user` as having left the room.
    pub async fn leave(&self, room_id: u64, user: &str) -> Result<(), RoomError> {
        let mut table = self.table.write().await;
        if !table.rooms.contains_key(&room_id) {
            return Err(RoomError::NotFound(room_id));
        }
        match table.members.get_mut(&(room_id, user.to_string())) {
            Some(member) if member.is_active() => {
                member.left_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(RoomError::NotAMember {
                room_id,
                user: user.to_string(),
            }),
        }
    }

    /// Whether `user` is currently in the room.
    pub async fn is_active_member(&self, room_id: u64, user: &str) -> bool {
        self.table.read().await.is_active(room_id, user)
    }

    /// All members of a room, including those who left.
    pub async fn members(&self, room_id: u64) -> Result<Vec<RoomMember>, RoomError> {
        let table = self.table.read().await;
        if !table.rooms.contains_key(&room_id) {
            return Err(RoomError::NotFound(room_id));
        }
        Ok(table
            .members
            .range((room_id, String::new())..)
            .take_while(|((id, _), _)| *id == room_id)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

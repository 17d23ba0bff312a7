use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Entity, EntityKind, RowKey, chronological};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Entity for Room {
    const KIND: EntityKind = EntityKind::Room;

    fn key(&self) -> RowKey {
        RowKey::Id(self.id)
    }

    fn scope_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> Option<OffsetDateTime> {
        Some(self.updated_at.unwrap_or(self.created_at))
    }

    fn touch(&mut self, at: OffsetDateTime) {
        self.updated_at = Some(at);
    }

    fn display_order(&self, other: &Self) -> Ordering {
        chronological((self.created_at, self.id), (other.created_at, other.id))
    }
}

/// Links a user to a room. Unique per `(room_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub room_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub is_creator: bool,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
}

impl Membership {
    /// The row every room implicitly has for its creator.
    pub fn creator_of(room: &Room) -> Membership {
        Membership {
            room_id: room.id,
            user_id: room.created_by,
            is_creator: true,
            created_at: Some(room.created_at),
        }
    }
}

impl Entity for Membership {
    const KIND: EntityKind = EntityKind::Membership;

    fn key(&self) -> RowKey {
        RowKey::Pair(self.room_id, self.user_id)
    }

    fn scope_id(&self) -> Uuid {
        self.room_id
    }

    fn stamp(&self) -> Option<OffsetDateTime> {
        self.created_at
    }

    /// Creator first, then by join time.
    fn display_order(&self, other: &Self) -> Ordering {
        other
            .is_creator
            .cmp(&self.is_creator)
            .then(self.created_at.cmp(&other.created_at))
            .then(self.user_id.cmp(&other.user_id))
    }
}

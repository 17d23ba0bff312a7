use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Entity, EntityKind, RowKey, chronological};

/// Chat line in a room. Append-only apart from `is_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<Uuid>,
}

impl Entity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn key(&self) -> RowKey {
        RowKey::Id(self.id)
    }

    fn scope_id(&self) -> Uuid {
        self.room_id
    }

    fn stamp(&self) -> Option<OffsetDateTime> {
        Some(self.updated_at.unwrap_or(self.created_at))
    }

    fn client_token(&self) -> Option<Uuid> {
        self.client_token
    }

    fn touch(&mut self, at: OffsetDateTime) {
        self.updated_at = Some(at);
    }

    fn display_order(&self, other: &Self) -> Ordering {
        chronological((self.created_at, self.id), (other.created_at, other.id))
    }
}

//! Rows mirrored from the store, and the traits the caches need from them.

pub mod message;
pub mod room;
pub mod task;

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{GetField, SyncError, SyncResult, gateway::Filter};

pub use message::Message;
pub use room::{Membership, Room};
pub use task::{ActivityLogEntry, Comment, Priority, Subtask, Task, TaskAssignment, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Room,
    Membership,
    Task,
    TaskAssignment,
    Message,
    Subtask,
    Comment,
    ActivityLog,
}

impl EntityKind {
    /// Kinds opened together when a room view is shown.
    pub const ROOM_SCOPED: [EntityKind; 5] = [
        EntityKind::Room,
        EntityKind::Membership,
        EntityKind::Task,
        EntityKind::TaskAssignment,
        EntityKind::Message,
    ];

    /// Kinds opened together when a task detail view is shown.
    pub const TASK_SCOPED: [EntityKind; 3] = [
        EntityKind::Subtask,
        EntityKind::Comment,
        EntityKind::ActivityLog,
    ];

    pub fn table_name(self) -> &'static str {
        use EntityKind::*;
        match self {
            Room => "rooms",
            Membership => "room_members",
            Task => "tasks",
            TaskAssignment => "task_assignments",
            Message => "messages",
            Subtask => "subtasks",
            Comment => "comments",
            ActivityLog => "activity_logs",
        }
    }

    pub fn key_columns(self) -> &'static [&'static str] {
        use EntityKind::*;
        match self {
            Membership => &["room_id", "user_id"],
            TaskAssignment => &["task_id", "user_id"],
            _ => &["id"],
        }
    }

    /// Column a subscription for this kind is filtered on.
    pub fn scope_column(self) -> &'static str {
        use EntityKind::*;
        match self {
            Room => "id",
            Membership | Task | TaskAssignment | Message => "room_id",
            Subtask | Comment | ActivityLog => "task_id",
        }
    }

    /// Whether the store hands out the primary key on insert.
    pub fn assigns_id(self) -> bool {
        self.key_columns() == ["id"]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Primary key of a cached row, surrogate or natural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RowKey {
    Id(Uuid),
    Pair(Uuid, Uuid),
}

impl RowKey {
    pub fn from_row(kind: EntityKind, row: &Value) -> SyncResult<RowKey> {
        match kind.key_columns() {
            [a, b] => Ok(RowKey::Pair(row.get_uuid_field(a)?, row.get_uuid_field(b)?)),
            [column] => Ok(RowKey::Id(row.get_uuid_field(column)?)),
            columns => Err(SyncError::MalformedRow(format!(
                "{kind} has unsupported key {columns:?}"
            ))),
        }
    }

    /// Equality filter selecting exactly this row.
    pub fn filter(&self, kind: EntityKind) -> Filter {
        let values = match *self {
            RowKey::Id(id) => vec![id],
            RowKey::Pair(a, b) => vec![a, b],
        };
        kind.key_columns()
            .iter()
            .zip(values)
            .fold(Filter::all(), |filter, (column, value)| filter.and(column, value))
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RowKey::Id(id) => write!(f, "{id}"),
            RowKey::Pair(a, b) => write!(f, "{a}/{b}"),
        }
    }
}

/// A row type the caches can hold.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn key(&self) -> RowKey;

    /// Id of the room (or task) whose subscription delivers this row.
    fn scope_id(&self) -> Uuid;

    /// Timestamp compared for last-writer-wins: `updated_at` when present,
    /// otherwise `created_at`.
    fn stamp(&self) -> Option<OffsetDateTime>;

    fn client_token(&self) -> Option<Uuid> {
        None
    }

    /// Records a local edit time on rows that carry `updated_at`.
    fn touch(&mut self, _at: OffsetDateTime) {}

    /// Render order within a snapshot.
    fn display_order(&self, other: &Self) -> Ordering;

    fn decode(row: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(row.clone())?)
    }

    fn encode(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Oldest first, ties broken by id.
pub(crate) fn chronological(
    a: (OffsetDateTime, Uuid),
    b: (OffsetDateTime, Uuid),
) -> Ordering {
    a.0.cmp(&b.0).then(a.1.cmp(&b.1))
}

pub fn rfc3339(at: OffsetDateTime) -> SyncResult<String> {
    Ok(at.format(&Rfc3339)?)
}

/// Implements [`Entity`] for append-only children keyed by `id`.
macro_rules! chronological_entity {
    (@impl $T:ty, $kind:expr, $scope:ident, { $($extra:tt)* }) => {
        impl $crate::model::Entity for $T {
            const KIND: $crate::model::EntityKind = $kind;

            fn key(&self) -> $crate::model::RowKey {
                $crate::model::RowKey::Id(self.id)
            }

            fn scope_id(&self) -> ::uuid::Uuid {
                self.$scope
            }

            fn stamp(&self) -> Option<::time::OffsetDateTime> {
                Some(self.created_at)
            }

            fn display_order(&self, other: &Self) -> ::std::cmp::Ordering {
                $crate::model::chronological(
                    (self.created_at, self.id),
                    (other.created_at, other.id),
                )
            }

            $($extra)*
        }
    };
    ($T:ty, $kind:expr, $scope:ident) => {
        $crate::model::chronological_entity!(@impl $T, $kind, $scope, {});
    };
    ($T:ty, $kind:expr, $scope:ident, client_token) => {
        $crate::model::chronological_entity!(@impl $T, $kind, $scope, {
            fn client_token(&self) -> Option<::uuid::Uuid> {
                self.client_token
            }
        });
    };
}

pub(crate) use chronological_entity;

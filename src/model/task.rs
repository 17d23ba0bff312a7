use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Entity, EntityKind, RowKey, chronological, chronological_entity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "To Do")]
    ToDo,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Blocked")]
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::ToDo,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Blocked,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::ToDo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Blocked => "Blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub room_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<OffsetDateTime>,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<Uuid>,
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

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

/// Many-to-many link between tasks and their assignees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
}

impl Entity for TaskAssignment {
    const KIND: EntityKind = EntityKind::TaskAssignment;

    fn key(&self) -> RowKey {
        RowKey::Pair(self.task_id, self.user_id)
    }

    fn scope_id(&self) -> Uuid {
        self.room_id
    }

    fn stamp(&self) -> Option<OffsetDateTime> {
        None
    }

    fn display_order(&self, other: &Self) -> Ordering {
        (self.task_id, self.user_id).cmp(&(other.task_id, other.user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub is_done: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

chronological_entity!(Subtask, EntityKind::Subtask, task_id, client_token);
chronological_entity!(Comment, EntityKind::Comment, task_id, client_token);
chronological_entity!(ActivityLogEntry, EntityKind::ActivityLog, task_id);

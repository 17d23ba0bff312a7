//! JSON frames exchanged over the room websocket.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    SyncController, SyncError, SyncResult,
    model::{Priority, TaskStatus},
    projections::{RoomProjection, TaskDetail},
    sync::{NewTask, TaskPatch},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    SendMessage {
        text: String,
    },
    AddTask {
        content: String,
        #[serde(default)]
        priority: Priority,
        #[serde(default, with = "time::serde::rfc3339::option")]
        deadline: Option<time::OffsetDateTime>,
    },
    SetTaskStatus {
        task_id: Uuid,
        status: TaskStatus,
    },
    UpdateTask {
        task_id: Uuid,
        #[serde(flatten)]
        patch: TaskPatch,
    },
    AssignTask {
        task_id: Uuid,
        user_id: Uuid,
    },
    AddMember {
        user_id: Uuid,
    },
    RenameRoom {
        name: String,
    },
    MarkRead {
        message_id: Uuid,
    },
    OpenTask {
        task_id: Uuid,
    },
    CloseTask,
    AddSubtask {
        title: String,
    },
    SetSubtaskDone {
        subtask_id: Uuid,
        done: bool,
    },
    AddComment {
        text: String,
    },
}

impl ClientCommand {
    /// Runs a mutation against the room (and open task, if any) and returns
    /// its correlation token.
    pub(crate) fn apply(
        self,
        sync: &mut SyncController,
        room_id: Uuid,
        task_id: Option<Uuid>,
    ) -> SyncResult<Uuid> {
        let open_task = || task_id.ok_or_else(|| SyncError::ScopeClosed("task view".into()));
        match self {
            ClientCommand::SendMessage { text } => sync.send_message(room_id, &text),
            ClientCommand::AddTask {
                content,
                priority,
                deadline,
            } => sync.add_task(
                room_id,
                NewTask {
                    content,
                    priority,
                    deadline,
                },
            ),
            ClientCommand::SetTaskStatus { task_id, status } => sync.set_task_status(task_id, status),
            ClientCommand::UpdateTask { task_id, patch } => sync.update_task(task_id, patch),
            ClientCommand::AssignTask { task_id, user_id } => sync.assign_task(task_id, user_id),
            ClientCommand::AddMember { user_id } => sync.add_member(room_id, user_id),
            ClientCommand::RenameRoom { name } => sync.rename_room(room_id, &name),
            ClientCommand::MarkRead { message_id } => sync.mark_read(message_id),
            ClientCommand::AddSubtask { title } => sync.add_subtask(open_task()?, &title),
            ClientCommand::SetSubtaskDone { subtask_id, done } => {
                sync.set_subtask_done(subtask_id, done)
            }
            ClientCommand::AddComment { text } => sync.add_comment(open_task()?, &text),
            ClientCommand::OpenTask { .. } | ClientCommand::CloseTask => {
                Err(SyncError::Validation { field: "type" })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Room(RoomProjection),
    Task(TaskDetail),
    Accepted { token: Uuid },
    Confirmed { token: Uuid },
    Failed {
        token: Uuid,
        kind: &'static str,
        message: String,
    },
    Error {
        kind: &'static str,
        message: String,
    },
    ScopeFailed {
        scope: String,
        message: String,
    },
    AuthExpired,
}

impl ServerFrame {
    pub fn error(err: &SyncError) -> Self {
        ServerFrame::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

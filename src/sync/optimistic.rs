//! Local-first writes: the cache changes now, the store catches up later.
//!
//! Each mutation gets a correlation token. The confirmed row (whether it
//! comes back as the write response or as a change event, in either order)
//! replaces the provisional one; a failed write rolls it back.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Scope, SyncController, Update, controller::Inbound};
use crate::{
    SyncError, SyncResult,
    cache::Cached,
    gateway::{ChangeEvent, ChangeOp, Filter},
    model::{
        Comment, Entity, EntityKind, Membership, Message, Priority, Room, RowKey, Subtask, Task,
        TaskAssignment, TaskStatus,
    },
};

#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Insert(Value),
    Update { key: Filter, patch: Value },
}

#[derive(Debug, Clone)]
pub(crate) struct WriteRequest {
    pub token: Uuid,
    pub scope: Scope,
    /// Version of the scope when the write was made.
    pub version: u64,
    /// Cache key the optimistic effect lives under.
    pub key: RowKey,
    pub op: WriteOp,
}

pub(crate) struct WriteOutcome {
    pub request: WriteRequest,
    pub result: SyncResult<Value>,
}

/// Per-row FIFO of writes. Only the head of each queue is in flight, so
/// the store sees writes to one row in submission order.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    queues: HashMap<(EntityKind, RowKey), VecDeque<WriteRequest>>,
}

impl PendingWrites {
    /// Queues `request`, handing it back if it can be sent right away.
    pub fn enqueue(&mut self, request: WriteRequest) -> Option<WriteRequest> {
        let queue = self
            .queues
            .entry((request.scope.kind, request.key))
            .or_default();
        queue.push_back(request);
        (queue.len() == 1).then(|| queue[0].clone())
    }

    /// Retires the in-flight head for the row and returns the next write to send.
    pub fn complete(&mut self, kind: EntityKind, key: RowKey) -> Option<WriteRequest> {
        let queue = self.queues.get_mut(&(kind, key))?;
        queue.pop_front();
        match queue.front() {
            Some(next) => Some(next.clone()),
            None => {
                self.queues.remove(&(kind, key));
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
}

/// Fields of a task to change; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub content: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the deadline.
    #[serde(default, deserialize_with = "present")]
    pub deadline: Option<Option<OffsetDateTime>>,
}

/// Tells an explicit `null` apart from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Option<OffsetDateTime>>, D::Error>
where
    D: Deserializer<'de>,
{
    time::serde::rfc3339::option::deserialize(deserializer).map(Some)
}

fn required(field: &'static str, value: &str) -> SyncResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation { field });
    }
    Ok(trimmed.to_owned())
}

/// Client edit time, kept strictly after the row's current stamp so two
/// quick edits never tie.
fn edit_stamp(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    match previous {
        Some(previous) if previous >= now => previous + Duration::microseconds(1),
        _ => now,
    }
}

impl SyncController {
    pub fn send_message(&mut self, room_id: Uuid, text: &str) -> SyncResult<Uuid> {
        let text = required("text", text)?;
        let user_id = self.user_id()?;
        let token = Uuid::new_v4();
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            text,
            created_at: OffsetDateTime::now_utc(),
            is_read: false,
            updated_at: None,
            client_token: Some(token),
        };
        self.optimistic_insert(room_id, message, token)
    }

    pub fn add_task(&mut self, room_id: Uuid, new: NewTask) -> SyncResult<Uuid> {
        let content = required("content", &new.content)?;
        let user_id = self.user_id()?;
        let token = Uuid::new_v4();
        let task = Task {
            id: Uuid::new_v4(),
            room_id,
            content,
            priority: new.priority,
            status: TaskStatus::ToDo,
            deadline: new.deadline,
            created_by: user_id,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            client_token: Some(token),
        };
        self.optimistic_insert(room_id, task, token)
    }

    pub fn set_task_status(&mut self, task_id: Uuid, status: TaskStatus) -> SyncResult<Uuid> {
        self.update_task(
            task_id,
            TaskPatch {
                status: Some(status),
                ..TaskPatch::default()
            },
        )
    }

    pub fn update_task(&mut self, task_id: Uuid, patch: TaskPatch) -> SyncResult<Uuid> {
        let content = patch
            .content
            .as_deref()
            .map(|content| required("content", content))
            .transpose()?;
        self.user_id()?;

        let mut fields = Vec::new();
        if content.is_some() {
            fields.push("content");
        }
        if patch.priority.is_some() {
            fields.push("priority");
        }
        if patch.status.is_some() {
            fields.push("status");
        }
        if patch.deadline.is_some() {
            fields.push("deadline");
        }
        if fields.is_empty() {
            return Err(SyncError::Validation { field: "patch" });
        }

        self.optimistic_update::<Task>(RowKey::Id(task_id), &fields, |task| {
            if let Some(content) = content {
                task.content = content;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(deadline) = patch.deadline {
                task.deadline = deadline;
            }
        })
    }

    pub fn assign_task(&mut self, task_id: Uuid, user_id: Uuid) -> SyncResult<Uuid> {
        self.user_id()?;
        let room_id = self
            .caches
            .tasks
            .confirmed(&RowKey::Id(task_id))
            .map(|task| task.room_id)
            .ok_or_else(|| SyncError::NotFound(format!("task {task_id}")))?;
        let assignment = TaskAssignment {
            task_id,
            room_id,
            user_id,
        };
        self.optimistic_insert(room_id, assignment, Uuid::new_v4())
    }

    pub fn add_member(&mut self, room_id: Uuid, user_id: Uuid) -> SyncResult<Uuid> {
        self.user_id()?;
        let member = Membership {
            room_id,
            user_id,
            is_creator: false,
            created_at: Some(OffsetDateTime::now_utc()),
        };
        self.optimistic_insert(room_id, member, Uuid::new_v4())
    }

    pub fn rename_room(&mut self, room_id: Uuid, name: &str) -> SyncResult<Uuid> {
        let name = required("name", name)?;
        self.user_id()?;
        self.optimistic_update::<Room>(RowKey::Id(room_id), &["name"], |room| room.name = name)
    }

    pub fn mark_read(&mut self, message_id: Uuid) -> SyncResult<Uuid> {
        self.user_id()?;
        self.optimistic_update::<Message>(RowKey::Id(message_id), &["is_read"], |message| {
            message.is_read = true
        })
    }

    pub fn add_subtask(&mut self, task_id: Uuid, title: &str) -> SyncResult<Uuid> {
        let title = required("title", title)?;
        let user_id = self.user_id()?;
        let token = Uuid::new_v4();
        let subtask = Subtask {
            id: Uuid::new_v4(),
            task_id,
            title,
            is_done: false,
            created_by: user_id,
            created_at: OffsetDateTime::now_utc(),
            client_token: Some(token),
        };
        self.optimistic_insert(task_id, subtask, token)
    }

    pub fn set_subtask_done(&mut self, subtask_id: Uuid, done: bool) -> SyncResult<Uuid> {
        self.user_id()?;
        self.optimistic_update::<Subtask>(RowKey::Id(subtask_id), &["is_done"], |subtask| {
            subtask.is_done = done
        })
    }

    pub fn add_comment(&mut self, task_id: Uuid, text: &str) -> SyncResult<Uuid> {
        let text = required("text", text)?;
        let user_id = self.user_id()?;
        let token = Uuid::new_v4();
        let comment = Comment {
            id: Uuid::new_v4(),
            task_id,
            user_id,
            text,
            created_at: OffsetDateTime::now_utc(),
            client_token: Some(token),
        };
        self.optimistic_insert(task_id, comment, token)
    }

    fn user_id(&self) -> SyncResult<Uuid> {
        self.identity
            .as_ref()
            .map(|identity| identity.user_id)
            .ok_or(SyncError::AuthExpired)
    }

    /// Shows `row` as a shadow and queues its insert. Store-assigned fields
    /// are left out of the write.
    fn optimistic_insert<T: Cached>(&mut self, scope_id: Uuid, row: T, token: Uuid) -> SyncResult<Uuid> {
        let scope = Scope::new(T::KIND, scope_id);
        let version = self.live_version(scope)?;
        let key = row.key();

        let mut body = row.encode()?;
        if let Some(fields) = body.as_object_mut() {
            if T::KIND.assigns_id() {
                fields.remove("id");
            }
            fields.remove("created_at");
        }

        T::cache_mut(&mut self.caches).insert_shadow(row, token);
        self.submit(WriteRequest {
            token,
            scope,
            version,
            key,
            op: WriteOp::Insert(body),
        });
        Ok(token)
    }

    /// Overlays the edited row and queues a patch of `fields` plus the edit stamp.
    fn optimistic_update<T: Cached>(
        &mut self,
        key: RowKey,
        fields: &[&str],
        edit: impl FnOnce(&mut T),
    ) -> SyncResult<Uuid> {
        let cache = T::cache(&self.caches);
        if cache.confirmed(&key).is_none() {
            return Err(SyncError::NotFound(format!("{} {key}", T::KIND)));
        }
        let Some(mut row) = cache.get(&key).cloned() else {
            return Err(SyncError::NotFound(format!("{} {key}", T::KIND)));
        };
        let scope = Scope::new(T::KIND, row.scope_id());
        let version = self.live_version(scope)?;

        edit(&mut row);
        row.touch(edit_stamp(row.stamp()));
        let encoded = row.encode()?;
        let mut patch = Map::new();
        for field in fields.iter().copied().chain(["updated_at"]) {
            match encoded.get(field) {
                Some(value) => {
                    patch.insert(field.to_owned(), value.clone());
                }
                None if field != "updated_at" => {
                    patch.insert(field.to_owned(), Value::Null);
                }
                None => {}
            }
        }

        let token = Uuid::new_v4();
        T::cache_mut(&mut self.caches).apply_overlay(key, row, token);
        self.submit(WriteRequest {
            token,
            scope,
            version,
            key,
            op: WriteOp::Update {
                key: key.filter(T::KIND),
                patch: Value::Object(patch),
            },
        });
        Ok(token)
    }

    fn submit(&mut self, request: WriteRequest) {
        self.updates.push_back(Update::Changed(request.scope));
        if let Some(ready) = self.writes.enqueue(request) {
            self.dispatch(ready);
        }
    }

    fn dispatch(&self, request: WriteRequest) {
        let gateway = self.gateway.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let table = request.scope.kind;
            let result = match &request.op {
                WriteOp::Insert(row) => gateway.insert(table, row.clone()).await,
                WriteOp::Update { key, patch } => gateway.update(table, key, patch.clone()).await,
            };
            let _ = inbox.send(Inbound::Written(WriteOutcome { request, result }));
        });
    }

    pub(super) fn on_written(&mut self, outcome: WriteOutcome) {
        let WriteOutcome { request, result } = outcome;
        let scope = request.scope;
        if let Some(next) = self.writes.complete(scope.kind, request.key) {
            self.dispatch(next);
        }

        if self.live_version(scope).ok() != Some(request.version) {
            debug!(%scope, token = %request.token, "discarding write outcome for closed scope");
            return;
        }

        match result {
            Ok(row) => {
                let op = match request.op {
                    WriteOp::Insert(_) => ChangeOp::Insert,
                    WriteOp::Update { .. } => ChangeOp::Update,
                };
                self.caches.apply(&ChangeEvent {
                    op,
                    table: scope.kind,
                    row,
                });
                self.caches.settle(scope.kind, request.token, &request.key);
                self.updates.push_back(Update::ActionConfirmed {
                    token: request.token,
                });
            }
            Err(error) => {
                warn!(%scope, token = %request.token, %error, "write failed, rolling back");
                self.caches.settle(scope.kind, request.token, &request.key);
                if error == SyncError::AuthExpired {
                    self.identity = None;
                    self.updates.push_back(Update::AuthExpired);
                }
                self.updates.push_back(Update::ActionFailed {
                    token: request.token,
                    error,
                });
            }
        }
        self.updates.push_back(Update::Changed(scope));
    }
}

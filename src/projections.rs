//! Render-ready views derived from cache snapshots. Nothing here is stored;
//! every projection is recomputed from the caches when they change.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::{
    cache::Caches,
    model::{
        ActivityLogEntry, Comment, Entity, Membership, Message, Room, RowKey, Subtask, Task,
        TaskAssignment, TaskStatus,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub to_do: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub total: usize,
}

pub fn task_counts(tasks: &[Task]) -> TaskCounts {
    tasks.iter().fold(TaskCounts::default(), |mut counts, task| {
        match task.status {
            TaskStatus::ToDo => counts.to_do += 1,
            TaskStatus::InProgress => counts.in_progress += 1,
            TaskStatus::Completed => counts.completed += 1,
            TaskStatus::Blocked => counts.blocked += 1,
        }
        counts.total += 1;
        counts
    })
}

/// Messages from other people that `user` has not read.
pub fn unread_count(messages: &[Message], user: Uuid) -> usize {
    messages
        .iter()
        .filter(|message| !message.is_read && message.user_id != user)
        .count()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberEntry {
    pub user_id: Uuid,
    pub is_creator: bool,
}

/// Creator first, then everyone else in membership order, each user once.
pub fn sorted_members(memberships: &[Membership], creator_id: Uuid) -> Vec<MemberEntry> {
    let mut seen = HashSet::from([creator_id]);
    let mut members = vec![MemberEntry {
        user_id: creator_id,
        is_creator: true,
    }];
    for membership in memberships {
        if seen.insert(membership.user_id) {
            members.push(MemberEntry {
                user_id: membership.user_id,
                is_creator: false,
            });
        }
    }
    members
}

/// Tasks assigned to `user`, soonest deadline first (undated last), then
/// most urgent.
pub fn my_tasks(tasks: &[Task], assignments: &[TaskAssignment], user: Uuid) -> Vec<Task> {
    let mine: HashSet<Uuid> = assignments
        .iter()
        .filter(|assignment| assignment.user_id == user)
        .map(|assignment| assignment.task_id)
        .collect();
    let mut tasks: Vec<Task> = tasks
        .iter()
        .filter(|task| mine.contains(&task.id))
        .cloned()
        .collect();
    tasks.sort_by(|a, b| {
        (a.deadline.is_none(), a.deadline)
            .cmp(&(b.deadline.is_none(), b.deadline))
            .then(b.priority.cmp(&a.priority))
    });
    tasks
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskCard {
    #[serde(flatten)]
    pub task: Task,
    pub assignees: Vec<Uuid>,
    /// Shown from a local write the store has not confirmed yet.
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageLine {
    #[serde(flatten)]
    pub message: Message,
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomProjection {
    pub room: Room,
    pub members: Vec<MemberEntry>,
    pub tasks: Vec<TaskCard>,
    pub counts: TaskCounts,
    pub my_tasks: Vec<Uuid>,
    pub messages: Vec<MessageLine>,
    pub unread: usize,
}

pub fn project_room(caches: &Caches, room_id: Uuid, user: Uuid) -> Option<RoomProjection> {
    let room = caches.rooms.get(&RowKey::Id(room_id))?.clone();
    let members = caches.members.scoped(room_id);
    let tasks = caches.tasks.scoped(room_id);
    let assignments = caches.assignments.scoped(room_id);
    let messages = caches.messages.scoped(room_id);

    let mut assignees: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for assignment in &assignments {
        assignees
            .entry(assignment.task_id)
            .or_default()
            .push(assignment.user_id);
    }

    Some(RoomProjection {
        members: sorted_members(&members, room.created_by),
        counts: task_counts(&tasks),
        my_tasks: my_tasks(&tasks, &assignments, user)
            .iter()
            .map(|task| task.id)
            .collect(),
        unread: unread_count(&messages, user),
        tasks: tasks
            .into_iter()
            .map(|task| TaskCard {
                assignees: assignees.remove(&task.id).unwrap_or_default(),
                pending: caches.tasks.is_pending(&task.key()),
                task,
            })
            .collect(),
        messages: messages
            .into_iter()
            .map(|message| MessageLine {
                pending: caches.messages.is_pending(&message.key()),
                message,
            })
            .collect(),
        room,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task_id: Uuid,
    pub task: Option<Task>,
    pub subtasks: Vec<Subtask>,
    pub done: usize,
    pub comments: Vec<Comment>,
    pub activity: Vec<ActivityLogEntry>,
}

pub fn project_task(caches: &Caches, task_id: Uuid) -> TaskDetail {
    let subtasks = caches.subtasks.scoped(task_id);
    TaskDetail {
        task_id,
        task: caches.tasks.get(&RowKey::Id(task_id)).cloned(),
        done: subtasks.iter().filter(|subtask| subtask.is_done).count(),
        subtasks,
        comments: caches.comments.scoped(task_id),
        activity: caches.activity.scoped(task_id),
    }
}

//! In-memory mirror of the rows the open views need, keyed by primary key.
//!
//! Every entry may hold two layers: the confirmed row last delivered by the
//! store, and an overlay written optimistically by this client (a shadow for
//! inserts, a pending edit for updates). Readers see the overlay while one
//! exists. Writes to caches happen only through the sync controller.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    GetField,
    gateway::{ChangeEvent, ChangeOp},
    model::{
        ActivityLogEntry, Comment, Entity, EntityKind, Membership, Message, Room, RowKey, Subtask,
        Task, TaskAssignment,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Applied,
    /// Older than the confirmed row already cached.
    Stale,
    /// The key was deleted and this row does not postdate the delete.
    Tombstoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlayKind {
    Insert,
    Update,
}

#[derive(Debug, Clone)]
struct Overlay<T> {
    row: T,
    kind: OverlayKind,
    /// Correlation tokens of writes still in flight, in submission order.
    pending: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    confirmed: Option<T>,
    overlay: Option<Overlay<T>>,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            confirmed: None,
            overlay: None,
        }
    }
}

impl<T: Entity> Entry<T> {
    fn visible(&self) -> Option<&T> {
        self.overlay
            .as_ref()
            .map(|overlay| &overlay.row)
            .or(self.confirmed.as_ref())
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.overlay.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    scope: Option<Uuid>,
    stamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct EntityCache<T: Entity> {
    entries: HashMap<RowKey, Entry<T>>,
    /// Correlation token -> key of the insert shadow it produced.
    shadows: HashMap<Uuid, RowKey>,
    tombstones: HashMap<RowKey, Tombstone>,
}

impl<T: Entity> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            shadows: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }
}

fn is_stale<T: Entity>(current: &T, incoming: &T) -> bool {
    matches!((current.stamp(), incoming.stamp()), (Some(have), Some(got)) if got < have)
}

fn is_newer<T: Entity>(incoming: &T, than: &T) -> bool {
    matches!((incoming.stamp(), than.stamp()), (Some(got), Some(have)) if got > have)
}

impl<T: Entity> EntityCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an authoritative row, last writer wins.
    pub fn upsert(&mut self, row: T) -> Merge {
        self.merge(row, false)
    }

    /// Like [`upsert`](Self::upsert), but the row was announced as a fresh
    /// insert and may reuse a key deleted before it was written.
    pub fn upsert_inserted(&mut self, row: T) -> Merge {
        self.merge(row, true)
    }

    fn merge(&mut self, row: T, inserted: bool) -> Merge {
        let key = row.key();
        if let Some(tombstone) = self.tombstones.get(&key) {
            // Without both stamps there is no telling the order; the insert wins.
            let reborn = inserted
                && match (tombstone.stamp, row.stamp()) {
                    (Some(dead), Some(born)) => born > dead,
                    _ => true,
                };
            if !reborn {
                return Merge::Tombstoned;
            }
            self.tombstones.remove(&key);
        }

        if let Some(shadow_key) = row.client_token().and_then(|token| self.shadows.remove(&token)) {
            if shadow_key != key {
                self.drop_overlay(&shadow_key);
            }
        }

        let entry = self.entries.entry(key).or_default();
        if entry
            .confirmed
            .as_ref()
            .is_some_and(|current| is_stale(current, &row))
        {
            return Merge::Stale;
        }

        let superseded = entry.overlay.as_ref().is_some_and(|overlay| {
            overlay.kind == OverlayKind::Insert || is_newer(&row, &overlay.row)
        });
        if superseded {
            if let Some(overlay) = entry.overlay.take() {
                for token in overlay.pending {
                    self.shadows.remove(&token);
                }
            }
        }
        entry.confirmed = Some(row);
        Merge::Applied
    }

    /// Deletes `key`; no-op if absent.
    pub fn remove(&mut self, key: &RowKey) -> bool {
        self.delete(*key, None, None)
    }

    /// Deletes `key` and remembers it so late updates cannot bring it back.
    pub fn delete(&mut self, key: RowKey, scope: Option<Uuid>, stamp: Option<OffsetDateTime>) -> bool {
        let existing = self.entries.remove(&key);
        let known = existing.as_ref().and_then(|entry| entry.confirmed.as_ref());
        let tombstone = Tombstone {
            scope: scope.or_else(|| existing.as_ref().and_then(Entry::visible).map(Entity::scope_id)),
            stamp: known.and_then(Entity::stamp).max(stamp),
        };
        self.tombstones.insert(key, tombstone);
        if let Some(overlay) = existing.as_ref().and_then(|entry| entry.overlay.as_ref()) {
            for token in &overlay.pending {
                self.shadows.remove(token);
            }
        }
        existing.is_some()
    }

    /// Shows a provisional row until its write is confirmed or rolled back.
    pub fn insert_shadow(&mut self, row: T, token: Uuid) {
        let key = row.key();
        self.shadows.insert(token, key);
        self.entries.entry(key).or_default().overlay = Some(Overlay {
            row,
            kind: OverlayKind::Insert,
            pending: vec![token],
        });
    }

    /// Shows a locally edited row on top of the confirmed one.
    pub fn apply_overlay(&mut self, key: RowKey, row: T, token: Uuid) -> bool {
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        match &mut entry.overlay {
            Some(overlay) => {
                overlay.row = row;
                overlay.pending.push(token);
            }
            None => {
                entry.overlay = Some(Overlay {
                    row,
                    kind: OverlayKind::Update,
                    pending: vec![token],
                })
            }
        }
        true
    }

    /// The write behind `token` finished. Once nothing is pending on `key`
    /// the overlay goes and the confirmed row shows through.
    pub fn settle(&mut self, token: Uuid, key: &RowKey) {
        self.shadows.remove(&token);
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if let Some(overlay) = &mut entry.overlay {
            overlay.pending.retain(|pending| *pending != token);
            if overlay.pending.is_empty() {
                entry.overlay = None;
            }
        }
        if entry.is_empty() {
            self.entries.remove(key);
        }
    }

    fn drop_overlay(&mut self, key: &RowKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.overlay = None;
            if entry.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Replaces the scope's confirmed rows with a full fetch. Overlays of
    /// writes still in flight survive.
    pub fn reset_scope(&mut self, scope: Uuid, rows: Vec<T>) {
        for entry in self.entries.values_mut() {
            if entry.confirmed.as_ref().is_some_and(|row| row.scope_id() == scope) {
                entry.confirmed = None;
            }
        }
        self.entries.retain(|_, entry| !entry.is_empty());
        self.tombstones.retain(|_, tombstone| tombstone.scope != Some(scope));
        for row in rows {
            self.upsert(row);
        }
    }

    /// Forgets everything belonging to the scope, optimistic rows included.
    pub fn purge_scope(&mut self, scope: Uuid) {
        let doomed: HashSet<RowKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.visible().is_some_and(|row| row.scope_id() == scope))
            .map(|(key, _)| *key)
            .collect();
        self.entries.retain(|key, _| !doomed.contains(key));
        self.shadows.retain(|_, key| !doomed.contains(key));
        self.tombstones.retain(|_, tombstone| tombstone.scope != Some(scope));
    }

    /// Stores a row derived locally from other confirmed rows.
    pub(crate) fn put_derived(&mut self, row: T) {
        let key = row.key();
        self.tombstones.remove(&key);
        self.entries.entry(key).or_default().confirmed = Some(row);
    }

    pub(crate) fn edit_confirmed(&mut self, mut edit: impl FnMut(&mut T)) {
        for row in self.entries.values_mut().filter_map(|entry| entry.confirmed.as_mut()) {
            edit(row);
        }
    }

    pub fn get(&self, key: &RowKey) -> Option<&T> {
        self.entries.get(key).and_then(Entry::visible)
    }

    pub fn confirmed(&self, key: &RowKey) -> Option<&T> {
        self.entries.get(key).and_then(|entry| entry.confirmed.as_ref())
    }

    /// Whether the row shown for `key` is still waiting on this client's writes.
    pub fn is_pending(&self, key: &RowKey) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.overlay.is_some())
    }

    pub fn shadow_key(&self, token: &Uuid) -> Option<RowKey> {
        self.shadows.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| entry.visible().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render-ready rows in display order.
    pub fn snapshot(&self) -> Vec<T> {
        self.collect(|_| true)
    }

    /// Like [`snapshot`](Self::snapshot), restricted to one room or task.
    pub fn scoped(&self, scope: Uuid) -> Vec<T> {
        self.collect(|row| row.scope_id() == scope)
    }

    fn collect(&self, keep: impl Fn(&T) -> bool) -> Vec<T> {
        let mut rows: Vec<T> = self
            .entries
            .values()
            .filter_map(Entry::visible)
            .filter(|row| keep(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.display_order(b));
        rows
    }
}

/// One cache per entity type.
#[derive(Debug, Default)]
pub struct Caches {
    pub rooms: EntityCache<Room>,
    pub members: EntityCache<Membership>,
    pub tasks: EntityCache<Task>,
    pub assignments: EntityCache<TaskAssignment>,
    pub messages: EntityCache<Message>,
    pub subtasks: EntityCache<Subtask>,
    pub comments: EntityCache<Comment>,
    pub activity: EntityCache<ActivityLogEntry>,
}

/// Maps an entity type to its cache in [`Caches`].
pub trait Cached: Entity {
    fn cache(caches: &Caches) -> &EntityCache<Self>;
    fn cache_mut(caches: &mut Caches) -> &mut EntityCache<Self>;
}

macro_rules! cached {
    ($($T:ty => $field:ident),* $(,)?) => {
        $(
            impl Cached for $T {
                fn cache(caches: &Caches) -> &EntityCache<Self> {
                    &caches.$field
                }

                fn cache_mut(caches: &mut Caches) -> &mut EntityCache<Self> {
                    &mut caches.$field
                }
            }
        )*
    };
}

cached! {
    Room => rooms,
    Membership => members,
    Task => tasks,
    TaskAssignment => assignments,
    Message => messages,
    Subtask => subtasks,
    Comment => comments,
    ActivityLogEntry => activity,
}

/// Runs `$body` with `$cache` bound to the cache for `$kind`.
macro_rules! dispatch {
    ($caches:expr, $kind:expr, $cache:ident => $body:expr) => {
        match $kind {
            EntityKind::Room => {
                let $cache = &mut $caches.rooms;
                $body
            }
            EntityKind::Membership => {
                let $cache = &mut $caches.members;
                $body
            }
            EntityKind::Task => {
                let $cache = &mut $caches.tasks;
                $body
            }
            EntityKind::TaskAssignment => {
                let $cache = &mut $caches.assignments;
                $body
            }
            EntityKind::Message => {
                let $cache = &mut $caches.messages;
                $body
            }
            EntityKind::Subtask => {
                let $cache = &mut $caches.subtasks;
                $body
            }
            EntityKind::Comment => {
                let $cache = &mut $caches.comments;
                $body
            }
            EntityKind::ActivityLog => {
                let $cache = &mut $caches.activity;
                $body
            }
        }
    };
}

impl Caches {
    /// Merges one change event. Returns whether anything visible changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        let changed = dispatch!(self, event.table, cache => apply_event(cache, event));
        if changed && matches!(event.table, EntityKind::Room | EntityKind::Membership) {
            if let Ok(room_id) = event.row.get_uuid_field(event.table.scope_column()) {
                self.enforce_creator(room_id);
            }
        }
        changed
    }

    pub fn reset_scope(&mut self, kind: EntityKind, scope: Uuid, rows: &[Value]) {
        dispatch!(self, kind, cache => {
            let decoded = rows.iter().filter_map(|row| decode_or_warn(row)).collect();
            cache.reset_scope(scope, decoded);
        });
        if matches!(kind, EntityKind::Room | EntityKind::Membership) {
            self.enforce_creator(scope);
        }
    }

    pub fn purge_scope(&mut self, kind: EntityKind, scope: Uuid) {
        dispatch!(self, kind, cache => cache.purge_scope(scope));
    }

    pub fn settle(&mut self, kind: EntityKind, token: Uuid, key: &RowKey) {
        dispatch!(self, kind, cache => cache.settle(token, key));
    }

    /// Membership list = explicit rows plus the creator, flagged once.
    fn enforce_creator(&mut self, room_id: Uuid) {
        let Some(room) = self.rooms.confirmed(&RowKey::Id(room_id)).cloned() else {
            return;
        };
        self.members.edit_confirmed(|member| {
            if member.room_id == room_id {
                member.is_creator = member.user_id == room.created_by;
            }
        });
        if self
            .members
            .confirmed(&RowKey::Pair(room_id, room.created_by))
            .is_none()
        {
            self.members.put_derived(Membership::creator_of(&room));
        }
    }
}

fn decode_or_warn<T: Entity>(row: &Value) -> Option<T> {
    match T::decode(row) {
        Ok(row) => Some(row),
        Err(err) => {
            warn!(table = %T::KIND, error = %err, "dropping malformed row");
            None
        }
    }
}

fn apply_event<T: Entity>(cache: &mut EntityCache<T>, event: &ChangeEvent) -> bool {
    match event.op {
        ChangeOp::Insert | ChangeOp::Update => {
            let Some(row) = decode_or_warn::<T>(&event.row) else {
                return false;
            };
            let outcome = match event.op {
                ChangeOp::Insert => cache.upsert_inserted(row),
                _ => cache.upsert(row),
            };
            if outcome != Merge::Applied {
                debug!(table = %T::KIND, ?outcome, "change not merged");
            }
            outcome == Merge::Applied
        }
        ChangeOp::Delete => match RowKey::from_row(T::KIND, &event.row) {
            Ok(key) => {
                let scope = event.row.get_uuid_field(T::KIND.scope_column()).ok();
                let stamp = T::decode(&event.row).ok().and_then(|row| row.stamp());
                cache.delete(key, scope, stamp)
            }
            Err(err) => {
                warn!(table = %T::KIND, error = %err, "dropping delete without key");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskStatus};
    use serde_json::json;
    use time::{Duration, macros::datetime};

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn task(id: u128, status: TaskStatus, minutes: i64) -> Task {
        Task {
            id: Uuid::from_u128(id),
            room_id: Uuid::from_u128(1000),
            content: format!("task {id}"),
            priority: Priority::Medium,
            status,
            deadline: None,
            created_by: Uuid::from_u128(7),
            created_at: T0,
            updated_at: (minutes > 0).then(|| T0 + Duration::minutes(minutes)),
            client_token: None,
        }
    }

    fn message(id: u128, at: OffsetDateTime) -> Message {
        Message {
            id: Uuid::from_u128(id),
            room_id: Uuid::from_u128(1000),
            user_id: Uuid::from_u128(7),
            text: format!("m{id}"),
            created_at: at,
            is_read: false,
            updated_at: None,
            client_token: None,
        }
    }

    #[test]
    fn older_update_loses() {
        let mut cache = EntityCache::new();
        assert_eq!(cache.upsert(task(1, TaskStatus::Completed, 10)), Merge::Applied);
        assert_eq!(cache.upsert(task(1, TaskStatus::InProgress, 5)), Merge::Stale);
        assert_eq!(cache.snapshot()[0].status, TaskStatus::Completed);
    }

    #[test]
    fn equal_stamp_replays_are_idempotent() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::Blocked, 3));
        assert_eq!(cache.upsert(task(1, TaskStatus::Blocked, 3)), Merge::Applied);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn messages_sort_by_time_then_id() {
        let mut cache = EntityCache::new();
        let later = T0 + Duration::seconds(1);
        cache.upsert(message(3, later));
        cache.upsert(message(2, T0));
        cache.upsert(message(1, T0));
        let ids: Vec<u128> = cache.snapshot().iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn shadow_replaced_by_token_match() {
        let mut cache = EntityCache::new();
        let token = Uuid::new_v4();
        let mut provisional = message(900, T0);
        provisional.client_token = Some(token);
        cache.insert_shadow(provisional, token);
        assert!(cache.is_pending(&RowKey::Id(Uuid::from_u128(900))));

        let mut confirmed = message(1, T0);
        confirmed.client_token = Some(token);
        cache.upsert_inserted(confirmed);

        let rows = cache.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Uuid::from_u128(1));
        assert_eq!(cache.shadow_key(&token), None);
    }

    #[test]
    fn rollback_removes_shadow() {
        let mut cache = EntityCache::new();
        let token = Uuid::new_v4();
        let provisional = message(900, T0);
        let key = provisional.key();
        cache.insert_shadow(provisional, token);
        cache.settle(token, &key);
        assert!(cache.is_empty());
    }

    #[test]
    fn overlay_shows_until_writes_settle() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::ToDo, 0));
        let key = RowKey::Id(Uuid::from_u128(1));
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        cache.apply_overlay(key, task(1, TaskStatus::InProgress, 1), first);
        cache.apply_overlay(key, task(1, TaskStatus::Completed, 2), second);

        cache.upsert(task(1, TaskStatus::InProgress, 1));
        cache.settle(first, &key);
        assert_eq!(cache.get(&key).unwrap().status, TaskStatus::Completed);

        cache.settle(second, &key);
        assert_eq!(cache.get(&key).unwrap().status, TaskStatus::InProgress);
        assert!(!cache.is_pending(&key));
    }

    #[test]
    fn newer_confirmation_overrides_overlay() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::ToDo, 0));
        let key = RowKey::Id(Uuid::from_u128(1));
        cache.apply_overlay(key, task(1, TaskStatus::InProgress, 1), Uuid::new_v4());
        cache.upsert(task(1, TaskStatus::Blocked, 9));
        assert_eq!(cache.get(&key).unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn delete_blocks_late_updates() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::ToDo, 0));
        assert!(cache.remove(&RowKey::Id(Uuid::from_u128(1))));
        assert_eq!(cache.upsert(task(1, TaskStatus::Blocked, 5)), Merge::Tombstoned);
        assert!(!cache.remove(&RowKey::Id(Uuid::from_u128(2))));
        assert!(cache.is_empty());
    }

    #[test]
    fn reinserted_assignment_comes_back() {
        let mut cache = EntityCache::new();
        let assignment = TaskAssignment {
            task_id: Uuid::from_u128(1),
            room_id: Uuid::from_u128(1000),
            user_id: Uuid::from_u128(7),
        };
        cache.upsert_inserted(assignment.clone());
        cache.remove(&assignment.key());
        assert_eq!(cache.upsert(assignment.clone()), Merge::Tombstoned);
        assert_eq!(cache.upsert_inserted(assignment), Merge::Applied);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reset_scope_keeps_in_flight_shadows() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::ToDo, 0));
        let token = Uuid::new_v4();
        cache.insert_shadow(task(50, TaskStatus::ToDo, 0), token);

        cache.reset_scope(Uuid::from_u128(1000), vec![task(2, TaskStatus::ToDo, 0)]);
        let ids: HashSet<u128> = cache.snapshot().iter().map(|t| t.id.as_u128()).collect();
        assert_eq!(ids, HashSet::from([2, 50]));
    }

    #[test]
    fn purge_scope_forgets_optimistic_rows() {
        let mut cache = EntityCache::new();
        cache.upsert(task(1, TaskStatus::ToDo, 0));
        let token = Uuid::new_v4();
        cache.insert_shadow(task(50, TaskStatus::ToDo, 0), token);
        cache.purge_scope(Uuid::from_u128(1000));
        assert!(cache.is_empty());
        assert_eq!(cache.shadow_key(&token), None);
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let mut caches = Caches::default();
        let changed = caches.apply(&ChangeEvent {
            op: ChangeOp::Insert,
            table: EntityKind::Message,
            row: json!({ "id": Uuid::now_v7(), "text": "no room" }),
        });
        assert!(!changed);
        assert!(caches.messages.is_empty());
    }

    #[test]
    fn creator_is_always_a_member_once() {
        let room_id = Uuid::from_u128(1000);
        let creator = Uuid::from_u128(1);
        let mut caches = Caches::default();
        caches.apply(&ChangeEvent {
            op: ChangeOp::Insert,
            table: EntityKind::Room,
            row: json!({
                "id": room_id,
                "name": "ops",
                "created_by": creator,
                "created_at": "2024-05-01T12:00:00Z",
            }),
        });
        for user in [1u128, 2, 3] {
            caches.apply(&ChangeEvent {
                op: ChangeOp::Insert,
                table: EntityKind::Membership,
                row: json!({ "room_id": room_id, "user_id": Uuid::from_u128(user) }),
            });
        }

        let members = caches.members.scoped(room_id);
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].user_id, creator);
        assert!(members[0].is_creator);
        assert_eq!(members.iter().filter(|m| m.is_creator).count(), 1);

        caches.apply(&ChangeEvent {
            op: ChangeOp::Delete,
            table: EntityKind::Membership,
            row: json!({ "room_id": room_id, "user_id": creator }),
        });
        assert_eq!(caches.members.scoped(room_id).len(), 3);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// Per key: how many updates follow the insert, and whether it ends deleted.
        type Plan = Vec<(usize, bool)>;

        fn history(plan: &Plan) -> Vec<(usize, ChangeEvent)> {
            let mut events = Vec::new();
            for (k, (updates, deleted)) in plan.iter().enumerate() {
                let id = k as u128 + 1;
                let mut latest = task(id, TaskStatus::ToDo, 0);
                events.push((0, event(ChangeOp::Insert, &latest)));
                for step in 1..=*updates {
                    let status = TaskStatus::ALL[step % TaskStatus::ALL.len()];
                    latest = task(id, status, step as i64);
                    events.push((step, event(ChangeOp::Update, &latest)));
                }
                if *deleted {
                    events.push((updates + 1, event(ChangeOp::Delete, &latest)));
                }
            }
            events
        }

        fn event(op: ChangeOp, task: &Task) -> ChangeEvent {
            ChangeEvent {
                op,
                table: EntityKind::Task,
                row: serde_json::to_value(task).unwrap(),
            }
        }

        fn replay<'a>(events: impl IntoIterator<Item = &'a ChangeEvent>) -> Vec<Task> {
            let mut caches = Caches::default();
            for event in events {
                caches.apply(event);
            }
            caches.tasks.snapshot()
        }

        fn shuffled_history() -> impl Strategy<Value = (Vec<(usize, ChangeEvent)>, Vec<(usize, ChangeEvent)>)> {
            proptest::collection::vec((0usize..4, any::<bool>()), 1..5).prop_flat_map(|plan| {
                let events = history(&plan);
                Just(events.clone())
                    .prop_shuffle()
                    .prop_map(move |shuffled| (events.clone(), shuffled))
            })
        }

        proptest! {
            #[test]
            fn merge_is_delivery_order_independent((ordered, shuffled) in shuffled_history()) {
                let mut in_time_order = ordered;
                in_time_order.sort_by_key(|(step, _)| *step);
                let expected = replay(in_time_order.iter().map(|(_, event)| event));
                let actual = replay(shuffled.iter().map(|(_, event)| event));
                prop_assert_eq!(actual, expected);
            }
        }
    }
}

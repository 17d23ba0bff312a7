//! Two clients sharing one store, driven step by step.

use std::{sync::Arc, time::Duration};

use roomsync::{
    GetField, Scope, ScopeState, StoreGateway, SyncConfig, SyncController, SyncError, Update,
    gateway::{ChangeEvent, ChangeOp, Filter, MemoryGateway, SqliteGateway},
    model::{EntityKind, Priority, RowKey, TaskStatus},
    session::{Identity, StaticAuth},
    sync::{NewTask, TaskPatch},
};
use serde_json::json;
use uuid::Uuid;

fn config() -> SyncConfig {
    SyncConfig {
        max_reconnect_attempts: 3,
        reconnect_backoff: Duration::from_millis(1),
        reconnect_jitter: Duration::ZERO,
    }
}

fn client(store: Arc<dyn StoreGateway>) -> (SyncController, Uuid) {
    let user_id = Uuid::now_v7();
    let auth = StaticAuth::signed_in(Identity {
        user_id,
        email: format!("{user_id}@example.com"),
    });
    (SyncController::new(store, Arc::new(auth), config()), user_id)
}

async fn seed_room(store: &dyn StoreGateway, creator: Uuid) -> Uuid {
    let row = store
        .insert(
            EntityKind::Room,
            json!({ "name": "launch", "created_by": creator }),
        )
        .await
        .unwrap();
    row.get_uuid_field("id").unwrap()
}

async fn seed_task(store: &dyn StoreGateway, room: Uuid, creator: Uuid) -> Uuid {
    let row = store
        .insert(
            EntityKind::Task,
            json!({
                "room_id": room,
                "content": "draft announcement",
                "priority": "high",
                "status": "To Do",
                "created_by": creator,
            }),
        )
        .await
        .unwrap();
    row.get_uuid_field("id").unwrap()
}

/// Two clients with `room` open, created by the first.
async fn room_with_two_clients(store: &MemoryGateway) -> (SyncController, SyncController, Uuid, Uuid) {
    let shared: Arc<dyn StoreGateway> = Arc::new(store.clone());
    let (mut alice, alice_id) = client(shared.clone());
    let (mut bob, _) = client(shared);
    let room = seed_room(store, alice_id).await;
    alice.open_room(room).await.unwrap();
    bob.open_room(room).await.unwrap();
    alice.settle().await;
    bob.settle().await;
    (alice, bob, room, alice_id)
}

fn status_of(sync: &SyncController, task: Uuid) -> Option<TaskStatus> {
    sync.caches()
        .tasks
        .get(&RowKey::Id(task))
        .map(|task| task.status)
}

#[tokio::test]
async fn peer_sees_new_task() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;

    let token = alice
        .add_task(
            room,
            NewTask {
                content: " Write tests ".into(),
                ..NewTask::default()
            },
        )
        .unwrap();
    assert_eq!(alice.caches().tasks.scoped(room).len(), 1);

    let updates = alice.settle().await;
    assert!(updates.contains(&Update::ActionConfirmed { token }));
    bob.settle().await;

    let tasks = bob.caches().tasks.scoped(room);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].content, "Write tests");
    assert_eq!(tasks[0].status, TaskStatus::ToDo);
    assert_eq!(tasks[0].created_by, alice_id);
    assert_eq!(alice.caches().tasks.scoped(room), tasks);
}

#[tokio::test]
async fn own_message_appears_once() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, _) = room_with_two_clients(&store).await;

    alice.send_message(room, "hello").unwrap();
    let shadow = alice.caches().messages.scoped(room);
    assert_eq!(shadow.len(), 1);
    assert!(alice.caches().messages.is_pending(&RowKey::Id(shadow[0].id)));

    alice.settle().await;
    bob.settle().await;

    let stored = store.rows(EntityKind::Message);
    assert_eq!(stored.len(), 1);
    let stored_id = stored[0].get_uuid_field("id").unwrap();
    for sync in [&alice, &bob] {
        let messages = sync.caches().messages.scoped(room);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, stored_id);
        assert!(!sync.caches().messages.is_pending(&RowKey::Id(stored_id)));
    }
}

#[tokio::test]
async fn late_echo_does_not_duplicate() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, _) = room_with_two_clients(&store).await;

    store.hold_events();
    alice.send_message(room, "hello").unwrap();
    alice.settle().await;
    assert_eq!(alice.caches().messages.scoped(room).len(), 1);

    store.release_events(false);
    alice.settle().await;
    assert_eq!(alice.caches().messages.scoped(room).len(), 1);
}

#[tokio::test]
async fn reordered_status_updates_keep_the_latest() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;
    bob.settle().await;

    store.hold_events();
    alice.set_task_status(task, TaskStatus::InProgress).unwrap();
    alice.set_task_status(task, TaskStatus::Completed).unwrap();
    assert_eq!(status_of(&alice, task), Some(TaskStatus::Completed));

    alice.settle().await;
    assert_eq!(status_of(&alice, task), Some(TaskStatus::Completed));

    store.release_events(true);
    alice.settle().await;
    bob.settle().await;
    assert_eq!(status_of(&alice, task), Some(TaskStatus::Completed));
    assert_eq!(status_of(&bob, task), Some(TaskStatus::Completed));
}

#[tokio::test]
async fn concurrent_edits_converge() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;
    bob.settle().await;

    alice.set_task_status(task, TaskStatus::InProgress).unwrap();
    alice.settle().await;
    bob.settle().await;
    bob.set_task_status(task, TaskStatus::Blocked).unwrap();
    bob.settle().await;
    alice.settle().await;

    assert_eq!(status_of(&alice, task), Some(TaskStatus::Blocked));
    assert_eq!(status_of(&bob, task), Some(TaskStatus::Blocked));
}

#[tokio::test]
async fn queued_write_landing_after_a_peer_still_wins() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;
    bob.settle().await;

    // Alice's second edit queues behind her first; Bob's write lands in between.
    alice
        .update_task(
            task,
            TaskPatch {
                priority: Some(Priority::Low),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    alice.set_task_status(task, TaskStatus::Blocked).unwrap();
    tokio::task::yield_now().await;
    bob.set_task_status(task, TaskStatus::Completed).unwrap();
    tokio::task::yield_now().await;
    alice.settle().await;
    bob.settle().await;
    alice.settle().await;

    let stored = store.rows(EntityKind::Task);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["status"], "Blocked");
    assert_eq!(stored[0]["priority"], "low");

    let (mut fresh, _) = client(Arc::new(store.clone()));
    fresh.open_room(room).await.unwrap();
    fresh.settle().await;

    for sync in [&alice, &bob, &fresh] {
        let cached = sync.caches().tasks.get(&RowKey::Id(task)).unwrap();
        assert_eq!(cached.status, TaskStatus::Blocked);
        assert_eq!(cached.priority, Priority::Low);
        assert!(!sync.caches().tasks.is_pending(&RowKey::Id(task)));
    }
}

#[tokio::test]
async fn reopening_leaves_no_stale_shadow() {
    let store = MemoryGateway::new();
    let shared: Arc<dyn StoreGateway> = Arc::new(store.clone());
    let (mut alice, alice_id) = client(shared);
    let room = seed_room(&store, alice_id).await;

    let first = alice.open_room(room).await.unwrap();
    alice.settle().await;
    alice.send_message(room, "sent while leaving").unwrap();
    alice.close_view(first.clone());
    assert!(alice.caches().messages.is_empty());

    let second = alice.open_room(room).await.unwrap();
    alice.settle().await;
    let messages = alice.caches().messages.scoped(room);
    assert_eq!(messages.len(), 1);
    assert!(!alice.caches().messages.is_pending(&RowKey::Id(messages[0].id)));

    alice.close_view(first);
    assert_eq!(
        alice.state(&Scope::new(EntityKind::Message, room)),
        ScopeState::Open
    );
    alice.close_view(second);
    assert_eq!(
        alice.state(&Scope::new(EntityKind::Message, room)),
        ScopeState::Closed
    );
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn reconnect_refetches_missed_rows() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, alice_id) = room_with_two_clients(&store).await;

    store.drop_subscriptions(EntityKind::Task);
    store
        .insert_unannounced(
            EntityKind::Task,
            json!({
                "room_id": room,
                "content": "written during the gap",
                "created_by": alice_id,
            }),
        )
        .unwrap();

    let updates = alice.settle().await;
    assert!(updates.contains(&Update::Reconnected(Scope::new(EntityKind::Task, room))));
    let tasks = alice.caches().tasks.scoped(room);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].content, "written during the gap");
}

#[tokio::test]
async fn repeated_reconnect_failure_closes_scope() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, _) = room_with_two_clients(&store).await;
    let scope = Scope::new(EntityKind::Message, room);

    for _ in 0..3 {
        store.fail_next_subscribe(SyncError::TransientIo("connection refused".into()));
    }
    store.drop_subscriptions(EntityKind::Message);

    let updates = alice.settle().await;
    assert!(updates.contains(&Update::ScopeFailed {
        scope,
        error: SyncError::SubscriptionDropped {
            scope: scope.to_string(),
            attempts: 3,
        },
    }));
    assert_eq!(alice.state(&scope), ScopeState::Closed);
    assert_eq!(
        alice.send_message(room, "anyone?"),
        Err(SyncError::ScopeClosed(scope.to_string()))
    );
}

#[tokio::test]
async fn events_for_other_rooms_are_discarded() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, alice_id) = room_with_two_clients(&store).await;

    store.broadcast_raw(ChangeEvent {
        op: ChangeOp::Insert,
        table: EntityKind::Message,
        row: json!({
            "id": Uuid::now_v7(),
            "room_id": Uuid::now_v7(),
            "user_id": alice_id,
            "text": "wrong room",
            "created_at": "2024-05-01T12:00:00Z",
        }),
    });
    alice.settle().await;
    assert!(alice.caches().messages.is_empty());
    assert!(alice.project_room(room).unwrap().messages.is_empty());
}

#[tokio::test]
async fn blank_input_never_reaches_the_store() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, _) = room_with_two_clients(&store).await;

    assert_eq!(
        alice.send_message(room, "   "),
        Err(SyncError::Validation { field: "text" })
    );
    assert_eq!(
        alice.add_task(room, NewTask::default()),
        Err(SyncError::Validation { field: "content" })
    );
    alice.settle().await;
    assert!(store.rows(EntityKind::Message).is_empty());
    assert!(store.rows(EntityKind::Task).is_empty());
    assert!(alice.caches().messages.is_empty());
}

#[tokio::test]
async fn failed_write_rolls_back() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, _) = room_with_two_clients(&store).await;

    let failure = SyncError::TransientIo("timeout".into());
    store.fail_next_write(failure.clone());
    let token = alice.send_message(room, "lost").unwrap();
    assert_eq!(alice.caches().messages.len(), 1);

    let updates = alice.settle().await;
    assert!(updates.contains(&Update::ActionFailed {
        token,
        error: failure,
    }));
    assert!(alice.caches().messages.is_empty());
    bob.settle().await;
    assert!(bob.caches().messages.is_empty());
}

#[tokio::test]
async fn failed_update_restores_confirmed_row() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;

    store.fail_next_write(SyncError::TransientIo("timeout".into()));
    alice.set_task_status(task, TaskStatus::Blocked).unwrap();
    assert_eq!(status_of(&alice, task), Some(TaskStatus::Blocked));

    alice.settle().await;
    assert_eq!(status_of(&alice, task), Some(TaskStatus::ToDo));
}

#[tokio::test]
async fn updating_an_unconfirmed_row_is_rejected() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, _) = room_with_two_clients(&store).await;

    store.hold_events();
    alice
        .add_task(
            room,
            NewTask {
                content: "not yet stored".into(),
                ..NewTask::default()
            },
        )
        .unwrap();
    let provisional = alice.caches().tasks.scoped(room)[0].id;
    assert!(matches!(
        alice.set_task_status(provisional, TaskStatus::Completed),
        Err(SyncError::NotFound(_))
    ));
    store.release_events(false);
    alice.settle().await;
}

#[tokio::test]
async fn expired_session_blocks_opening() {
    let store: Arc<dyn StoreGateway> = Arc::new(MemoryGateway::new());
    let auth = Arc::new(StaticAuth::signed_out());
    let mut sync = SyncController::new(store, auth, config());

    assert_eq!(
        sync.open_room(Uuid::now_v7()).await,
        Err(SyncError::AuthExpired)
    );
    assert_eq!(sync.drain(), vec![Update::AuthExpired]);
    assert_eq!(
        sync.send_message(Uuid::now_v7(), "hi"),
        Err(SyncError::AuthExpired)
    );
}

#[tokio::test]
async fn sign_out_is_noticed_on_next_open() {
    let store = MemoryGateway::new();
    let user_id = Uuid::now_v7();
    let auth = Arc::new(StaticAuth::signed_in(Identity {
        user_id,
        email: "ada@example.com".into(),
    }));
    let mut sync = SyncController::new(Arc::new(store.clone()), auth.clone(), config());
    let room = seed_room(&store, user_id).await;
    sync.open_room(room).await.unwrap();
    sync.settle().await;

    auth.sign_out();
    assert_eq!(
        sync.open_room(Uuid::now_v7()).await,
        Err(SyncError::AuthExpired)
    );
    assert!(sync.identity().is_none());
}

#[tokio::test]
async fn creator_is_listed_once_with_members() {
    let store = MemoryGateway::new();
    let shared: Arc<dyn StoreGateway> = Arc::new(store.clone());
    let (mut alice, alice_id) = client(shared);
    let room = seed_room(&store, alice_id).await;
    let (bob, carol) = (Uuid::now_v7(), Uuid::now_v7());
    for user in [alice_id, bob, carol] {
        store
            .insert(EntityKind::Membership, json!({ "room_id": room, "user_id": user }))
            .await
            .unwrap();
    }

    alice.open_room(room).await.unwrap();
    alice.settle().await;
    let projection = alice.project_room(room).unwrap();
    let members: Vec<Uuid> = projection.members.iter().map(|m| m.user_id).collect();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0], alice_id);
    assert!(projection.members[0].is_creator);
    assert!(members.contains(&bob) && members.contains(&carol));
}

#[tokio::test]
async fn room_projection_tracks_tasks_and_unread() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;
    bob.settle().await;

    bob.send_message(room, "ping").unwrap();
    bob.assign_task(task, alice_id).unwrap();
    bob.settle().await;
    alice.settle().await;

    let projection = alice.project_room(room).unwrap();
    assert_eq!(projection.unread, 1);
    assert_eq!(projection.counts.to_do, 1);
    assert_eq!(projection.my_tasks, vec![task]);
    assert_eq!(projection.tasks[0].assignees, vec![alice_id]);

    let message = projection.messages[0].message.id;
    alice.mark_read(message).unwrap();
    assert_eq!(alice.project_room(room).unwrap().unread, 0);
    alice.settle().await;
    bob.settle().await;
    assert!(bob.caches().messages.get(&RowKey::Id(message)).unwrap().is_read);
}

#[tokio::test]
async fn deleted_rows_disappear() {
    let store = MemoryGateway::new();
    let (mut alice, _bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;

    store.delete(EntityKind::Task, &Filter::eq("id", task)).unwrap();
    alice.settle().await;
    assert_eq!(status_of(&alice, task), None);
}

#[tokio::test]
async fn task_detail_view() {
    let store = MemoryGateway::new();
    let (mut alice, mut bob, room, alice_id) = room_with_two_clients(&store).await;
    let task = seed_task(&store, room, alice_id).await;
    alice.settle().await;
    bob.settle().await;

    let alice_view = alice.open_task(task);
    bob.open_task(task);
    alice.settle().await;
    bob.settle().await;

    alice.add_subtask(task, "outline").unwrap();
    alice.add_comment(task, "on it").unwrap();
    alice.settle().await;
    bob.settle().await;

    let detail = bob.project_task(task);
    assert_eq!(detail.subtasks.len(), 1);
    assert_eq!(detail.comments.len(), 1);
    assert_eq!(detail.task.map(|t| t.id), Some(task));

    alice.close_view(alice_view);
    assert!(alice.caches().subtasks.is_empty());
    assert!(matches!(
        alice.add_comment(task, "closed"),
        Err(SyncError::ScopeClosed(_))
    ));
}

#[tokio::test]
async fn sqlite_store_end_to_end() {
    let store: Arc<dyn StoreGateway> =
        Arc::new(SqliteGateway::connect("sqlite::memory:", 1).await.unwrap());
    let (mut alice, alice_id) = client(store.clone());
    let (mut bob, _) = client(store.clone());
    let room = seed_room(store.as_ref(), alice_id).await;
    alice.open_room(room).await.unwrap();
    bob.open_room(room).await.unwrap();
    alice.settle().await;
    bob.settle().await;

    let token = alice.send_message(room, "persisted").unwrap();
    assert!(alice.settle().await.contains(&Update::ActionConfirmed { token }));

    tokio::time::timeout(Duration::from_secs(2), async {
        while bob.caches().messages.is_empty() {
            bob.pump().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(bob.caches().messages.scoped(room)[0].text, "persisted");
    assert_eq!(alice.caches().messages.scoped(room).len(), 1);
}

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Scope, ScopeHandle, ScopeState, Update,
    optimistic::{PendingWrites, WriteOutcome},
};
use crate::{
    GetField, SyncConfig, SyncError, SyncResult,
    cache::Caches,
    gateway::{ChangeEvent, ChangeOp, ChannelSignal, EventSink, StoreGateway, UnsubscribeHandle},
    model::EntityKind,
    projections::{self, RoomProjection, TaskDetail},
    session::{AuthProvider, Identity},
};

/// Everything that can wake the controller up.
pub(crate) enum Inbound {
    Channel {
        scope: Scope,
        channel: u64,
        signal: ChannelSignal,
    },
    Subscribed {
        scope: Scope,
        channel: u64,
        result: SyncResult<(UnsubscribeHandle, Vec<Value>)>,
    },
    Written(WriteOutcome),
}

struct ScopeEntry {
    version: u64,
    /// Generation of the live subscription attempt. Signals and completions
    /// tagged with any other generation are stale.
    channel: u64,
    state: ScopeState,
    attempts: u32,
    buffered: Vec<ChangeEvent>,
    unsubscribe: Option<UnsubscribeHandle>,
}

/// Owns the entity caches and every subscription feeding them.
///
/// All cache mutation happens on the task that drives [`recv`](Self::recv);
/// store I/O runs on spawned tasks that report back through the inbox.
pub struct SyncController {
    pub(super) gateway: Arc<dyn StoreGateway>,
    auth: Arc<dyn AuthProvider>,
    config: SyncConfig,
    pub(super) identity: Option<Identity>,
    pub(super) caches: Caches,
    scopes: HashMap<Scope, ScopeEntry>,
    next_version: u64,
    next_channel: u64,
    pub(super) writes: PendingWrites,
    pub(super) inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    pub(super) updates: VecDeque<Update>,
}

impl SyncController {
    pub fn new(gateway: Arc<dyn StoreGateway>, auth: Arc<dyn AuthProvider>, config: SyncConfig) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            gateway,
            auth,
            config,
            identity: None,
            caches: Caches::default(),
            scopes: HashMap::new(),
            next_version: 0,
            next_channel: 0,
            writes: PendingWrites::default(),
            inbox_tx,
            inbox,
            updates: VecDeque::new(),
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn state(&self, scope: &Scope) -> ScopeState {
        self.scopes
            .get(scope)
            .map_or(ScopeState::Closed, |entry| entry.state)
    }

    /// Asks the auth provider who is signed in. A failure clears the
    /// identity so later mutations fail fast.
    pub async fn refresh_identity(&mut self) -> SyncResult<Identity> {
        match self.auth.current_identity().await {
            Ok(identity) => {
                self.identity = Some(identity.clone());
                Ok(identity)
            }
            Err(err) => {
                self.identity = None;
                Err(err)
            }
        }
    }

    /// Starts mirroring `scope`. Opening a scope that is already open hands
    /// back the existing handle.
    pub fn open(&mut self, scope: Scope) -> ScopeHandle {
        if let Some(entry) = self.scopes.get(&scope) {
            return ScopeHandle {
                scope,
                version: entry.version,
            };
        }

        self.next_version += 1;
        let version = self.next_version;
        let channel = self.next_channel();
        self.scopes.insert(
            scope,
            ScopeEntry {
                version,
                channel,
                state: ScopeState::Opening,
                attempts: 0,
                buffered: Vec::new(),
                unsubscribe: None,
            },
        );
        info!(%scope, "opening scope");
        self.spawn_subscribe(scope, channel, Duration::ZERO);
        ScopeHandle { scope, version }
    }

    /// Unsubscribes and forgets the scope's rows. Returns `false` for a
    /// handle that no longer owns the scope.
    pub fn close(&mut self, handle: ScopeHandle) -> bool {
        match self.scopes.get(&handle.scope) {
            Some(entry) if entry.version == handle.version => {}
            _ => {
                debug!(scope = %handle.scope, "ignoring close with stale handle");
                return false;
            }
        }
        self.scopes.remove(&handle.scope);
        self.caches.purge_scope(handle.scope.kind, handle.scope.id);
        info!(scope = %handle.scope, "closed scope");
        true
    }

    /// Opens everything a room view renders from.
    pub async fn open_room(&mut self, room_id: Uuid) -> SyncResult<Vec<ScopeHandle>> {
        if let Err(err) = self.refresh_identity().await {
            if err == SyncError::AuthExpired {
                self.updates.push_back(Update::AuthExpired);
            }
            return Err(err);
        }
        Ok(EntityKind::ROOM_SCOPED
            .into_iter()
            .map(|kind| self.open(Scope::new(kind, room_id)))
            .collect())
    }

    pub fn open_task(&mut self, task_id: Uuid) -> Vec<ScopeHandle> {
        EntityKind::TASK_SCOPED
            .into_iter()
            .map(|kind| self.open(Scope::new(kind, task_id)))
            .collect()
    }

    pub fn close_view(&mut self, handles: impl IntoIterator<Item = ScopeHandle>) {
        for handle in handles {
            self.close(handle);
        }
    }

    pub fn project_room(&self, room_id: Uuid) -> Option<RoomProjection> {
        let user = self.identity.as_ref()?.user_id;
        projections::project_room(&self.caches, room_id, user)
    }

    pub fn project_task(&self, task_id: Uuid) -> TaskDetail {
        projections::project_task(&self.caches, task_id)
    }

    /// Waits for the next update, processing inbound messages as needed.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Update> {
        loop {
            if let Some(update) = self.updates.pop_front() {
                return Some(update);
            }
            let inbound = self.inbox.recv().await?;
            self.handle(inbound);
        }
    }

    /// Processes one inbound message, waiting for it if none is ready.
    pub async fn pump(&mut self) -> bool {
        match self.inbox.recv().await {
            Some(inbound) => {
                self.handle(inbound);
                true
            }
            None => false,
        }
    }

    /// Processes whatever is ready without waiting and returns the updates so far.
    pub fn drain(&mut self) -> Vec<Update> {
        while let Ok(inbound) = self.inbox.try_recv() {
            self.handle(inbound);
        }
        self.updates.drain(..).collect()
    }

    /// Runs until every scope is open (or gave up) and no write is in flight.
    pub async fn settle(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        loop {
            updates.extend(self.drain());
            if self.is_idle() || !self.pump().await {
                updates.extend(self.drain());
                return updates;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.writes.is_empty()
            && self
                .scopes
                .values()
                .all(|entry| entry.state == ScopeState::Open)
    }

    pub(crate) fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Channel {
                scope,
                channel,
                signal,
            } => self.on_signal(scope, channel, signal),
            Inbound::Subscribed {
                scope,
                channel,
                result,
            } => self.on_subscribed(scope, channel, result),
            Inbound::Written(outcome) => self.on_written(outcome),
        }
    }

    /// Version of the live scope, or `ScopeClosed`.
    pub(super) fn live_version(&self, scope: Scope) -> SyncResult<u64> {
        self.scopes
            .get(&scope)
            .map(|entry| entry.version)
            .ok_or_else(|| SyncError::ScopeClosed(scope.to_string()))
    }

    fn next_channel(&mut self) -> u64 {
        self.next_channel += 1;
        self.next_channel
    }

    fn spawn_subscribe(&self, scope: Scope, channel: u64, delay: Duration) {
        let gateway = self.gateway.clone();
        let inbox = self.inbox_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let sink_inbox = inbox.clone();
            let sink: EventSink = Arc::new(move |signal| {
                let _ = sink_inbox.send(Inbound::Channel {
                    scope,
                    channel,
                    signal,
                });
            });

            // Subscribe before fetching so nothing written in between is missed.
            let filter = scope.filter();
            let result = match gateway.subscribe(scope.kind, filter.clone(), sink).await {
                Ok(handle) => gateway
                    .select(scope.kind, &filter)
                    .await
                    .map(|rows| (handle, rows)),
                Err(err) => Err(err),
            };
            let _ = inbox.send(Inbound::Subscribed {
                scope,
                channel,
                result,
            });
        });
    }

    fn on_signal(&mut self, scope: Scope, channel: u64, signal: ChannelSignal) {
        let Some(entry) = self
            .scopes
            .get_mut(&scope)
            .filter(|entry| entry.channel == channel)
        else {
            debug!(%scope, "discarding signal from stale channel");
            return;
        };

        match signal {
            ChannelSignal::Event(event) => {
                if !belongs_to(&scope, &event) {
                    warn!(%scope, table = %event.table, "discarding event outside scope");
                    return;
                }
                match entry.state {
                    ScopeState::Open => {
                        if self.caches.apply(&event) {
                            self.updates.push_back(Update::Changed(scope));
                        }
                    }
                    ScopeState::Opening | ScopeState::Reconnecting => entry.buffered.push(event),
                    ScopeState::Closed => {}
                }
            }
            ChannelSignal::Dropped { reason } => {
                warn!(%scope, reason, "channel dropped");
                entry.unsubscribe = None;
                self.schedule_reconnect(scope);
            }
        }
    }

    fn on_subscribed(
        &mut self,
        scope: Scope,
        channel: u64,
        result: SyncResult<(UnsubscribeHandle, Vec<Value>)>,
    ) {
        let Some(entry) = self
            .scopes
            .get_mut(&scope)
            .filter(|entry| entry.channel == channel)
        else {
            // Dropping a late handle unsubscribes it.
            debug!(%scope, "discarding stale subscription");
            return;
        };

        match result {
            Ok((unsubscribe, rows)) => {
                let reconnected = entry.state == ScopeState::Reconnecting;
                entry.state = ScopeState::Open;
                entry.attempts = 0;
                entry.unsubscribe = Some(unsubscribe);
                let buffered = std::mem::take(&mut entry.buffered);

                self.caches.reset_scope(scope.kind, scope.id, &rows);
                for event in &buffered {
                    self.caches.apply(event);
                }
                info!(%scope, rows = rows.len(), replayed = buffered.len(), "scope open");
                self.updates.push_back(if reconnected {
                    Update::Reconnected(scope)
                } else {
                    Update::Opened(scope)
                });
            }
            Err(SyncError::AuthExpired) => {
                warn!(%scope, "session expired while subscribing");
                self.scopes.remove(&scope);
                self.caches.purge_scope(scope.kind, scope.id);
                self.updates.push_back(Update::AuthExpired);
            }
            Err(err) if err.is_retryable() => {
                warn!(%scope, error = %err, "subscribe failed");
                self.schedule_reconnect(scope);
            }
            Err(err) => {
                warn!(%scope, error = %err, "subscribe rejected");
                self.scopes.remove(&scope);
                self.caches.purge_scope(scope.kind, scope.id);
                self.updates.push_back(Update::ScopeFailed { scope, error: err });
            }
        }
    }

    fn schedule_reconnect(&mut self, scope: Scope) {
        let channel = self.next_channel();
        let Some(entry) = self.scopes.get_mut(&scope) else {
            return;
        };
        entry.attempts += 1;
        let attempts = entry.attempts;
        if attempts > self.config.max_reconnect_attempts {
            warn!(%scope, attempts, "giving up on scope");
            self.scopes.remove(&scope);
            self.caches.purge_scope(scope.kind, scope.id);
            self.updates.push_back(Update::ScopeFailed {
                scope,
                error: SyncError::SubscriptionDropped {
                    scope: scope.to_string(),
                    attempts: attempts - 1,
                },
            });
            return;
        }

        entry.channel = channel;
        entry.unsubscribe = None;
        entry.buffered.clear();
        if entry.state == ScopeState::Open {
            entry.state = ScopeState::Reconnecting;
        }

        let delay = self.config.backoff(attempts) + self.jitter();
        debug!(%scope, attempts, ?delay, "reconnecting");
        self.spawn_subscribe(scope, channel, delay);
    }

    fn jitter(&self) -> Duration {
        let max = self.config.reconnect_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// Subscriptions are filtered by the store, but a misbehaving one must not
/// leak rows from another room into this scope. Deletes that only carry the
/// key are let through.
fn belongs_to(scope: &Scope, event: &ChangeEvent) -> bool {
    if event.table != scope.kind {
        return false;
    }
    match event.row.get_uuid_field(scope.kind.scope_column()) {
        Ok(id) => id == scope.id,
        Err(_) => event.op == ChangeOp::Delete,
    }
}

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    ChangeEvent, ChangeOp, ChannelSignal, EventSink, Filter, StoreGateway, UnsubscribeHandle,
    apply_patch, prepare_insert,
};
use crate::{SyncError, SyncResult, model::EntityKind};

/// In-process store. Change events are delivered synchronously from the
/// writing call, in write order, unless held.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<EntityKind, BTreeMap<String, Value>>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    held: Option<Vec<(EventSink, ChannelSignal)>>,
    write_failures: VecDeque<SyncError>,
    subscribe_failures: VecDeque<SyncError>,
}

struct Subscriber {
    id: u64,
    table: EntityKind,
    filter: Filter,
    sink: EventSink,
}

type Deliveries = Vec<(EventSink, ChannelSignal)>;

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next write fails with `err` instead of touching the store.
    pub fn fail_next_write(&self, err: SyncError) {
        self.lock().write_failures.push_back(err);
    }

    pub fn fail_next_subscribe(&self, err: SyncError) {
        self.lock().subscribe_failures.push_back(err);
    }

    /// Queue change events instead of delivering them.
    pub fn hold_events(&self) {
        let mut inner = self.lock();
        if inner.held.is_none() {
            inner.held = Some(Vec::new());
        }
    }

    /// Deliver everything held, newest first when `reversed`.
    pub fn release_events(&self, reversed: bool) {
        let mut held = self.lock().held.take().unwrap_or_default();
        if reversed {
            held.reverse();
        }
        deliver(held);
    }

    /// Breaks every channel on `table`; subscribers see `Dropped` and are forgotten.
    pub fn drop_subscriptions(&self, table: EntityKind) {
        let dropped: Vec<Subscriber> = {
            let mut inner = self.lock();
            let (dropped, kept): (Vec<Subscriber>, Vec<Subscriber>) = std::mem::take(&mut inner.subscribers)
                .into_iter()
                .partition(|sub| sub.table == table);
            inner.subscribers = kept;
            dropped
        };
        tracing::debug!(%table, count = dropped.len(), "dropping subscriptions");
        for sub in dropped {
            (sub.sink)(ChannelSignal::Dropped {
                reason: "connection reset".into(),
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn rows(&self, table: EntityKind) -> Vec<Value> {
        self.lock()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes without telling any subscriber, as if the event fell into a gap.
    pub fn insert_unannounced(&self, table: EntityKind, row: Value) -> SyncResult<Value> {
        let (pk, row) = prepare_insert(table, row)?;
        self.lock()
            .tables
            .entry(table)
            .or_default()
            .insert(pk, row.clone());
        Ok(row)
    }

    /// Removes the row matched by `key` and announces the delete.
    pub fn delete(&self, table: EntityKind, key: &Filter) -> SyncResult<Value> {
        let (deliveries, old) = {
            let mut inner = self.lock();
            let rows = inner.tables.entry(table).or_default();
            let Some(pk) = rows
                .iter()
                .find(|(_, row)| key.matches(row))
                .map(|(pk, _)| pk.clone())
            else {
                return Err(SyncError::NotFound(format!("{table} row")));
            };
            let old = rows.remove(&pk).unwrap_or_default();
            let deliveries = inner.announce(ChangeEvent {
                op: ChangeOp::Delete,
                table,
                row: old.clone(),
            });
            (deliveries, old)
        };
        deliver(deliveries);
        Ok(old)
    }

    /// Pushes an arbitrary event to matching subscribers, bypassing the store.
    pub fn broadcast_raw(&self, event: ChangeEvent) {
        let deliveries = {
            let inner = self.lock();
            inner
                .subscribers
                .iter()
                .filter(|sub| sub.table == event.table)
                .map(|sub| (sub.sink.clone(), ChannelSignal::Event(event.clone())))
                .collect::<Deliveries>()
        };
        deliver(deliveries);
    }
}

impl Inner {
    /// Sinks to call once the lock is released; empty while events are held.
    fn announce(&mut self, event: ChangeEvent) -> Deliveries {
        let deliveries: Deliveries = self
            .subscribers
            .iter()
            .filter(|sub| sub.table == event.table && sub.filter.matches(&event.row))
            .map(|sub| (sub.sink.clone(), ChannelSignal::Event(event.clone())))
            .collect();
        match &mut self.held {
            Some(held) => {
                held.extend(deliveries);
                Vec::new()
            }
            None => deliveries,
        }
    }

    fn take_write_failure(&mut self) -> SyncResult<()> {
        match self.write_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn deliver(deliveries: Deliveries) {
    for (sink, signal) in deliveries {
        sink(signal);
    }
}

#[async_trait]
impl StoreGateway for MemoryGateway {
    async fn select(&self, table: EntityKind, filter: &Filter) -> SyncResult<Vec<Value>> {
        Ok(self
            .lock()
            .tables
            .get(&table)
            .map(|rows| rows.values().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: EntityKind, row: Value) -> SyncResult<Value> {
        let (deliveries, row) = {
            let mut inner = self.lock();
            inner.take_write_failure()?;
            let (pk, row) = prepare_insert(table, row)?;
            let rows = inner.tables.entry(table).or_default();
            if rows.contains_key(&pk) {
                return Err(SyncError::Conflict(format!("{table} row {pk} already exists")));
            }
            rows.insert(pk, row.clone());
            let deliveries = inner.announce(ChangeEvent {
                op: ChangeOp::Insert,
                table,
                row: row.clone(),
            });
            (deliveries, row)
        };
        deliver(deliveries);
        Ok(row)
    }

    async fn update(&self, table: EntityKind, key: &Filter, patch: Value) -> SyncResult<Value> {
        let (deliveries, row) = {
            let mut inner = self.lock();
            inner.take_write_failure()?;
            let rows = inner.tables.entry(table).or_default();
            let Some(row) = rows.values_mut().find(|row| key.matches(row)) else {
                return Err(SyncError::NotFound(format!("{table} row")));
            };
            apply_patch(table, row, patch)?;
            let row = row.clone();
            let deliveries = inner.announce(ChangeEvent {
                op: ChangeOp::Update,
                table,
                row: row.clone(),
            });
            (deliveries, row)
        };
        deliver(deliveries);
        Ok(row)
    }

    async fn subscribe(
        &self,
        table: EntityKind,
        filter: Filter,
        on_event: EventSink,
    ) -> SyncResult<UnsubscribeHandle> {
        let mut inner = self.lock();
        if let Some(err) = inner.subscribe_failures.pop_front() {
            return Err(err);
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber {
            id,
            table,
            filter,
            sink: on_event,
        });

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Ok(UnsubscribeHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .retain(|sub| sub.id != id);
            }
        }))
    }
}

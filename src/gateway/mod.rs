//! Contract with the backing store: CRUD plus row-level change notifications.

pub mod memory;
pub mod sqlite;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{
    GetField, SyncError, SyncResult,
    model::{EntityKind, rfc3339},
};

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

/// Conjunction of column equalities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: &str, id: Uuid) -> Self {
        Self::all().and(column, id)
    }

    pub fn and(self, column: &str, id: Uuid) -> Self {
        self.and_value(column, Value::String(id.to_string()))
    }

    pub fn and_value(mut self, column: &str, value: Value) -> Self {
        self.conditions.push((column.to_owned(), value));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Raw row change as the store reports it. For deletes `row` is the old record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub table: EntityKind,
    pub row: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Event(ChangeEvent),
    /// The channel broke; events after this point are lost until resubscribed.
    Dropped { reason: String },
}

/// Callback a subscription delivers into. Must not block.
pub type EventSink = Arc<dyn Fn(ChannelSignal) + Send + Sync>;

/// Tears the subscription down when dropped.
pub struct UnsubscribeHandle(Option<Box<dyn FnOnce() + Send>>);

impl UnsubscribeHandle {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(teardown)))
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for UnsubscribeHandle {
    fn drop(&mut self) {
        if let Some(teardown) = self.0.take() {
            teardown();
        }
    }
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UnsubscribeHandle")
            .field(&self.0.is_some())
            .finish()
    }
}

#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn select(&self, table: EntityKind, filter: &Filter) -> SyncResult<Vec<Value>>;

    /// Returns the row as stored, with store-assigned fields filled in.
    async fn insert(&self, table: EntityKind, row: Value) -> SyncResult<Value>;

    async fn update(&self, table: EntityKind, key: &Filter, patch: Value) -> SyncResult<Value>;

    async fn subscribe(
        &self,
        table: EntityKind,
        filter: Filter,
        on_event: EventSink,
    ) -> SyncResult<UnsubscribeHandle>;
}

/// Store key of a row: its key columns joined with `:`.
pub(crate) fn primary_key(table: EntityKind, row: &Value) -> SyncResult<String> {
    let parts = table
        .key_columns()
        .iter()
        .map(|column| row.get_str_field(column))
        .collect::<SyncResult<Vec<_>>>()?;
    Ok(parts.join(":"))
}

/// Fills in what the store assigns on insert: `id` and `created_at`.
pub(crate) fn prepare_insert(table: EntityKind, mut row: Value) -> SyncResult<(String, Value)> {
    let fields = row
        .as_object_mut()
        .ok_or_else(|| SyncError::MalformedRow(format!("{table} row must be an object")))?;
    if table.assigns_id() && fields.get("id").is_none_or(Value::is_null) {
        fields.insert("id".into(), Value::String(Uuid::now_v7().to_string()));
    }
    if table != EntityKind::TaskAssignment && !fields.contains_key("created_at") {
        fields.insert("created_at".into(), Value::String(now()?));
    }
    let pk = primary_key(table, &row)?;
    Ok((pk, row))
}

/// Shallow-merges `patch` into `row`. `updated_at` only ever moves forward,
/// so a late write lands with a stamp newer than everything it overwrote.
pub(crate) fn apply_patch(table: EntityKind, row: &mut Value, patch: Value) -> SyncResult<()> {
    let Value::Object(mut patch) = patch else {
        return Err(SyncError::MalformedRow(format!("{table} patch must be an object")));
    };
    let fields: &mut Map<String, Value> = row
        .as_object_mut()
        .ok_or_else(|| SyncError::MalformedRow(format!("{table} row must be an object")))?;

    let requested = patch.remove("updated_at");
    let stamp = if carries_updated_at(table) {
        let requested = match requested.as_ref().filter(|stamp| !stamp.is_null()) {
            Some(stamp) => parse_stamp(stamp)?,
            None => OffsetDateTime::now_utc(),
        };
        let previous = ["updated_at", "created_at"]
            .iter()
            .filter_map(|column| fields.get(*column).filter(|stamp| !stamp.is_null()))
            .next();
        let previous = match previous {
            Some(stamp) => Some(parse_stamp(stamp)?),
            None => None,
        };
        let stamp = match previous {
            Some(previous) => requested.max(previous + Duration::microseconds(1)),
            None => requested,
        };
        Some(Value::String(rfc3339(stamp)?))
    } else {
        requested
    };

    for (column, value) in patch {
        if table.key_columns().contains(&column.as_str()) {
            continue;
        }
        fields.insert(column, value);
    }
    if let Some(stamp) = stamp {
        fields.insert("updated_at".into(), stamp);
    }
    Ok(())
}

fn parse_stamp(stamp: &Value) -> SyncResult<OffsetDateTime> {
    let text = stamp
        .as_str()
        .ok_or_else(|| SyncError::MalformedRow(format!("stamp {stamp} is not a string")))?;
    Ok(OffsetDateTime::parse(text, &Rfc3339)?)
}

fn carries_updated_at(table: EntityKind) -> bool {
    matches!(table, EntityKind::Room | EntityKind::Task | EntityKind::Message)
}

fn now() -> SyncResult<String> {
    rfc3339(OffsetDateTime::now_utc())
}

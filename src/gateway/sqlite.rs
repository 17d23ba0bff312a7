use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, sqlite::SqlitePoolOptions};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{
    ChangeEvent, ChangeOp, ChannelSignal, EventSink, Filter, StoreGateway, UnsubscribeHandle,
    apply_patch, prepare_insert,
};
use crate::{SyncError, SyncResult, model::EntityKind};

const CHANNEL_CAPACITY: usize = 256;
const UPDATE_ATTEMPTS: usize = 8;

/// Rows persisted as JSON documents in SQLite, with change notifications
/// fanned out to subscribers over a broadcast channel.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
    tx: broadcast::Sender<ChangeEvent>,
}

impl SqliteGateway {
    pub async fn connect(url: &str, max_connections: u32) -> SyncResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> SyncResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS store_rows (
                tbl TEXT NOT NULL,
                pk TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (tbl, pk)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        })
    }

    async fn load(&self, table: EntityKind, filter: &Filter) -> SyncResult<Vec<(String, String)>> {
        let mut query = matching(table, filter);
        let rows = query
            .build_query_as::<(String, String)>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    fn announce(&self, op: ChangeOp, table: EntityKind, row: &Value) {
        // No receivers just means nobody is watching.
        let _ = self.tx.send(ChangeEvent {
            op,
            table,
            row: row.clone(),
        });
    }
}

/// `SELECT pk,body` for the rows of `table` that satisfy `filter`.
fn matching(table: EntityKind, filter: &Filter) -> QueryBuilder<'static, Sqlite> {
    let mut query = QueryBuilder::new("SELECT pk,body FROM store_rows WHERE tbl=");
    query.push_bind(table.table_name());
    for (column, value) in filter.conditions() {
        query
            .push(" AND json_extract(body,")
            .push_bind(format!("$.{column}"))
            .push(")=json_extract(")
            .push_bind(value.to_string())
            .push(",'$')");
    }
    query.push(" ORDER BY rowid");
    query
}

#[async_trait]
impl StoreGateway for SqliteGateway {
    async fn select(&self, table: EntityKind, filter: &Filter) -> SyncResult<Vec<Value>> {
        self.load(table, filter)
            .await?
            .into_iter()
            .map(|(_, body)| Ok(serde_json::from_str(&body)?))
            .collect()
    }

    async fn insert(&self, table: EntityKind, row: Value) -> SyncResult<Value> {
        let (pk, row) = prepare_insert(table, row)?;
        sqlx::query("INSERT INTO store_rows (tbl,pk,body) VALUES (?,?,?)")
            .bind(table.table_name())
            .bind(&pk)
            .bind(row.to_string())
            .execute(&self.pool)
            .await?;

        self.announce(ChangeOp::Insert, table, &row);
        Ok(row)
    }

    async fn update(&self, table: EntityKind, key: &Filter, patch: Value) -> SyncResult<Value> {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some((pk, body)) = self.load(table, key).await?.into_iter().next() else {
                return Err(SyncError::NotFound(format!("{table} row")));
            };
            let mut row: Value = serde_json::from_str(&body)?;
            apply_patch(table, &mut row, patch.clone())?;

            // Only lands if nobody rewrote the row since it was read.
            let written = sqlx::query("UPDATE store_rows SET body=? WHERE tbl=? AND pk=? AND body=?")
                .bind(row.to_string())
                .bind(table.table_name())
                .bind(&pk)
                .bind(&body)
                .execute(&self.pool)
                .await?;
            if written.rows_affected() == 1 {
                self.announce(ChangeOp::Update, table, &row);
                return Ok(row);
            }
            tracing::debug!(%table, %pk, "row changed underneath update, retrying");
        }
        Err(SyncError::TransientIo(format!(
            "{table} row kept changing during update"
        )))
    }

    async fn subscribe(
        &self,
        table: EntityKind,
        filter: Filter,
        on_event: EventSink,
    ) -> SyncResult<UnsubscribeHandle> {
        let mut rx = self.tx.subscribe();

        let forward = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.table == table && filter.matches(&event.row) {
                            on_event(ChannelSignal::Event(event));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%table, skipped, "subscriber lagged, dropping channel");
                        on_event(ChannelSignal::Dropped {
                            reason: format!("lagged by {skipped} events"),
                        });
                        break;
                    }
                    Err(RecvError::Closed) => {
                        on_event(ChannelSignal::Dropped {
                            reason: "store closed".into(),
                        });
                        break;
                    }
                }
            }
        });

        Ok(UnsubscribeHandle::new(move || forward.abort()))
    }
}

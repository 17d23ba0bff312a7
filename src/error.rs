pub type SyncResult<T> = Result<T, SyncError>;

/// Everything that can go wrong inside the sync core. None of it is fatal;
/// callers recover by retrying or navigating away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Network or store call failed. Optimistic effects are rolled back.
    #[error("store request failed: {0}")]
    TransientIo(String),

    /// Rejected before any write reached the store.
    #[error("{field} must not be empty")]
    Validation { field: &'static str },

    #[error("session expired")]
    AuthExpired,

    /// Only surfaced once reconnecting has failed repeatedly.
    #[error("subscription for {scope} dropped after {attempts} reconnect attempts")]
    SubscriptionDropped { scope: String, attempts: u32 },

    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} is not open")]
    ScopeClosed(String),
}

impl SyncError {
    /// Stable label used on the wire.
    pub fn kind(&self) -> &'static str {
        use SyncError::*;
        match self {
            TransientIo(_) => "transient_io",
            Validation { .. } => "validation",
            AuthExpired => "auth_expired",
            SubscriptionDropped { .. } => "subscription_dropped",
            MalformedRow(_) => "malformed_row",
            NotFound(_) => "not_found",
            Conflict(_) => "conflict",
            ScopeClosed(_) => "scope_closed",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SyncError::Conflict(db.message().to_owned())
            }
            sqlx::Error::RowNotFound => SyncError::NotFound(err.to_string()),
            _ => SyncError::TransientIo(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedRow(err.to_string())
    }
}

impl From<time::error::Format> for SyncError {
    fn from(err: time::error::Format) -> Self {
        SyncError::MalformedRow(err.to_string())
    }
}

impl From<time::error::Parse> for SyncError {
    fn from(err: time::error::Parse) -> Self {
        SyncError::MalformedRow(err.to_string())
    }
}

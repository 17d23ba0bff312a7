pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod projections;
pub mod rooms;
pub mod session;
pub mod sync;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};
use serde_json::Value;
use uuid::Uuid;

pub use config::{ServerConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use gateway::StoreGateway;
pub use sync::{Scope, ScopeHandle, ScopeState, SyncController, Update};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub gateway: Arc<dyn StoreGateway>,
    pub sync: SyncConfig,
}

/// Typed field access on raw store rows.
pub trait GetField {
    fn get_str_field(&self, field: &str) -> SyncResult<&str>;
    fn get_obj_field(&self, field: &str) -> SyncResult<&Value>;
    fn get_uuid_field(&self, field: &str) -> SyncResult<Uuid>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> SyncResult<&str> {
        self.get_obj_field(field)?
            .as_str()
            .ok_or_else(|| SyncError::MalformedRow(format!("expected {field} in {self} to be string")))
    }

    fn get_obj_field(&self, field: &str) -> SyncResult<&Value> {
        self.get(field)
            .ok_or_else(|| SyncError::MalformedRow(format!("expected {field} in {self}")))
    }

    fn get_uuid_field(&self, field: &str) -> SyncResult<Uuid> {
        let raw = self.get_str_field(field)?;
        Uuid::parse_str(raw)
            .map_err(|err| SyncError::MalformedRow(format!("{field} = {raw:?}: {err}")))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<SyncError>() {
            Some(SyncError::AuthExpired) => StatusCode::UNAUTHORIZED,
            Some(SyncError::Validation { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(SyncError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
            (status, format!("{}\n\n{}", self.0, self.0.backtrace())).into_response()
        } else {
            (status, self.0.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

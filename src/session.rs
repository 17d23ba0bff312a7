//! Identity of the signed-in user, as handed to us by the auth layer.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, SyncError, SyncResult};

pub const USER_ID: &str = "x-user-id";
pub const EMAIL: &str = "x-user-email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
}

/// Source of the active session. Asked again every time a view opens.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_identity(&self) -> SyncResult<Identity>;
}

/// A session fixed up front; signing out makes every later lookup fail.
#[derive(Debug, Default)]
pub struct StaticAuth {
    identity: Mutex<Option<Identity>>,
}

impl StaticAuth {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_out(&self) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_identity(&self) -> SyncResult<Identity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SyncError::AuthExpired)
    }
}

/// Reads the identity the upstream auth proxy attached to the request.
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let user_id = header(USER_ID)
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .ok_or(SyncError::AuthExpired)?;
        let email = header(EMAIL).unwrap_or_default();
        Ok(Identity { user_id, email })
    }
}

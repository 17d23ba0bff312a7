//! Subscription lifecycle and optimistic writes, driven from one event loop.

mod controller;
mod optimistic;

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::{SyncError, gateway::Filter, model::EntityKind};

pub use controller::SyncController;
pub use optimistic::{NewTask, TaskPatch};

/// One subscription: a table filtered down to a single room or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Scope {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl Scope {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn filter(&self) -> Filter {
        Filter::eq(self.kind.scope_column(), self.id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Proof of having opened a scope. Closing with a handle from an earlier
/// open of the same scope does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeHandle {
    pub scope: Scope,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Closed,
    Opening,
    Open,
    Reconnecting,
}

/// What changed since the caller last looked.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Opened(Scope),
    Reconnected(Scope),
    /// Cache contents of the scope changed; re-derive projections.
    Changed(Scope),
    ActionConfirmed { token: Uuid },
    ActionFailed { token: Uuid, error: SyncError },
    /// Reconnecting gave up; the scope is closed.
    ScopeFailed { scope: Scope, error: SyncError },
    AuthExpired,
}

impl Update {
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Update::Opened(scope)
            | Update::Reconnected(scope)
            | Update::Changed(scope)
            | Update::ScopeFailed { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}

//! Event store - canonical lifecycle state for threats and actions
//!
//! The store owns every status transition and the per-resource execution
//! lane. Two interchangeable backends implement the same contract: a
//! PostgreSQL backend and an in-process backend used when no database is
//! configured or reachable. The backend is selected once at process start.

mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ActionFilter, ActionStatus, RemediationAction, ThreatEvent, ThreatFilter, ThreatStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Rejected transition. The original state is preserved and no side
    /// effects are applied.
    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

// ============================================================================
// EVENT STORE
// ============================================================================

/// Authoritative store with a backend chosen at startup.
pub enum EventStore {
    Memory(MemoryStore),
    Postgres(PgStore),
}

macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            EventStore::Memory(s) => s.$method($($arg),*),
            EventStore::Postgres(s) => s.$method($($arg),*).await,
        }
    };
}

impl EventStore {
    pub fn in_memory() -> Self {
        EventStore::Memory(MemoryStore::new())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            EventStore::Memory(_) => "memory",
            EventStore::Postgres(_) => "postgres",
        }
    }

    pub async fn insert_threat(&self, threat: &ThreatEvent) -> Result<(), StoreError> {
        delegate!(self, insert_threat, threat)
    }

    pub async fn get_threat(&self, id: Uuid) -> Result<Option<ThreatEvent>, StoreError> {
        delegate!(self, get_threat, id)
    }

    pub async fn list_threats(&self, filter: &ThreatFilter) -> Result<Vec<ThreatEvent>, StoreError> {
        delegate!(self, list_threats, filter)
    }

    /// Validated status transition for a threat. Sets `resolved_at` when the
    /// target status is terminal.
    pub async fn transition_threat(
        &self,
        id: Uuid,
        to: ThreatStatus,
    ) -> Result<ThreatEvent, StoreError> {
        delegate!(self, transition_threat, id, to)
    }

    /// Attach a scoring result. The anomaly score may only be written while
    /// the threat is still `Received` or `Scored`; later passes are rejected.
    pub async fn record_scoring(
        &self,
        id: Uuid,
        anomaly_score: Option<f64>,
        degraded: bool,
    ) -> Result<ThreatEvent, StoreError> {
        delegate!(self, record_scoring, id, anomaly_score, degraded)
    }

    /// Insert an action and link it to its threat. Rejects with `Conflict`
    /// when the threat already has a non-terminal action.
    pub async fn insert_action(&self, action: &RemediationAction) -> Result<(), StoreError> {
        delegate!(self, insert_action, action)
    }

    pub async fn get_action(&self, id: Uuid) -> Result<Option<RemediationAction>, StoreError> {
        delegate!(self, get_action, id)
    }

    pub async fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        delegate!(self, list_actions, filter)
    }

    /// Validated status transition for an action. Transitions into
    /// `Executing` additionally require the resource lane to be free and
    /// occupy it; transitions out of `Executing` release it.
    pub async fn transition_action(
        &self,
        id: Uuid,
        to: ActionStatus,
    ) -> Result<RemediationAction, StoreError> {
        delegate!(self, transition_action, id, to)
    }

    /// Park an action awaiting human confirmation, with a deadline.
    pub async fn hold_action(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<RemediationAction, StoreError> {
        delegate!(self, hold_action, id, deadline)
    }

    /// Finish an executing action with `Succeeded` or `Failed`, recording
    /// the executor note and releasing the resource lane.
    pub async fn complete_action(
        &self,
        id: Uuid,
        to: ActionStatus,
        note: Option<String>,
    ) -> Result<RemediationAction, StoreError> {
        delegate!(self, complete_action, id, to, note)
    }

    pub async fn increment_attempts(&self, id: Uuid) -> Result<u32, StoreError> {
        delegate!(self, increment_attempts, id)
    }

    /// Atomically claim the next eligible action for a resource. Returns
    /// `None` when the lane is busy or nothing is pending. On success the
    /// action and its threat are both moved to `Executing`.
    pub async fn claim_next_action(
        &self,
        resource: &str,
    ) -> Result<Option<RemediationAction>, StoreError> {
        delegate!(self, claim_next_action, resource)
    }

    /// Expire the action if it is awaiting confirmation past its deadline.
    /// Returns the expired action, or `None` when nothing changed.
    pub async fn expire_if_overdue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RemediationAction>, StoreError> {
        delegate!(self, expire_if_overdue, id, now)
    }

    /// Expire every overdue `AwaitingConfirmation` action. Each expired
    /// action's threat is moved to `Suppressed`.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        delegate!(self, sweep_expired, now)
    }
}

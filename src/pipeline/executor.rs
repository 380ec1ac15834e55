//! Action execution
//!
//! Drains per-resource execution lanes. At most one action executes at a
//! time against any given resource; actions for distinct resources run
//! independently. Transient faults are retried with doubling backoff,
//! everything else fails the action terminally. Executing an already
//! finished action is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppResult, PipelineError};
use crate::models::{ActionStatus, ActionType, RemediationAction, ThreatStatus};
use crate::store::EventStore;
use crate::stream::{Broadcaster, LifecycleUpdate};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution timed out")]
    Timeout,

    /// The target resource is busy or locked by an external controller.
    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    Failed(String),
}

impl ExecError {
    /// Only timeouts and conflicts are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Timeout | ExecError::Conflict(_))
    }
}

/// Execution collaborator: performs the actual remediation side effect.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, action: &RemediationAction) -> Result<String, ExecError>;
}

// ============================================================================
// EXECUTOR
// ============================================================================

pub struct ActionExecutor {
    store: Arc<EventStore>,
    broadcaster: Broadcaster,
    runner: Arc<dyn ActionRunner>,
    config: Config,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<EventStore>,
        broadcaster: Broadcaster,
        runner: Arc<dyn ActionRunner>,
        config: Config,
    ) -> Self {
        Self {
            store,
            broadcaster,
            runner,
            config,
        }
    }

    /// Drain the execution lane for one resource: claim and run queued
    /// actions one at a time until the lane is empty or claimed by another
    /// caller. Returns how many actions this call ran to completion.
    pub async fn dispatch(&self, resource: &str) -> AppResult<usize> {
        let mut completed = 0;
        while let Some(action) = self.store.claim_next_action(resource).await? {
            self.broadcaster.publish(LifecycleUpdate::action(&action));
            if let Some(threat) = self.store.get_threat(action.threat_id).await? {
                self.broadcaster.publish(LifecycleUpdate::threat(&threat));
            }
            self.run_to_completion(action).await?;
            completed += 1;
        }
        Ok(completed)
    }

    /// Execute one specific action. Finished actions are returned untouched;
    /// a queued action triggers a lane drain for its resource.
    pub async fn execute(&self, action_id: Uuid) -> AppResult<RemediationAction> {
        let action = self
            .store
            .get_action(action_id)
            .await?
            .ok_or(PipelineError::NotFound("action"))?;
        if action.status.is_terminal() {
            return Ok(action);
        }
        self.dispatch(&action.target_resource).await?;
        let refreshed = self
            .store
            .get_action(action_id)
            .await?
            .ok_or(PipelineError::NotFound("action"))?;
        Ok(refreshed)
    }

    /// Run a claimed (already `Executing`) action through the retry loop and
    /// record the terminal outcome on both the action and its threat.
    async fn run_to_completion(&self, action: RemediationAction) -> AppResult<()> {
        let mut backoff = self.config.execution_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.config.execution_max_attempts {
            self.store.increment_attempts(action.id).await?;

            let result =
                tokio::time::timeout(self.config.execution_timeout, self.runner.run(&action))
                    .await
                    .unwrap_or(Err(ExecError::Timeout));

            match result {
                Ok(note) => {
                    tracing::info!(
                        action_id = %action.id,
                        action_type = action.action_type.as_str(),
                        resource = %action.target_resource,
                        attempt,
                        "action succeeded"
                    );
                    return self
                        .finish(&action, ActionStatus::Succeeded, Some(note))
                        .await;
                }
                Err(err) if err.is_transient() && attempt < self.config.execution_max_attempts => {
                    tracing::warn!(
                        action_id = %action.id,
                        attempt,
                        error = %err,
                        "transient execution fault, retrying"
                    );
                    last_error = err.to_string();
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    tracing::warn!(
                        action_id = %action.id,
                        action_type = action.action_type.as_str(),
                        attempt,
                        error = %err,
                        "action failed"
                    );
                    return self
                        .finish(&action, ActionStatus::Failed, Some(err.to_string()))
                        .await;
                }
            }
        }

        // Attempts exhausted on transient faults.
        self.finish(&action, ActionStatus::Failed, Some(last_error))
            .await
    }

    async fn finish(
        &self,
        action: &RemediationAction,
        status: ActionStatus,
        note: Option<String>,
    ) -> AppResult<()> {
        let finished = self.store.complete_action(action.id, status, note).await?;
        self.broadcaster.publish(LifecycleUpdate::action(&finished));

        let threat_status = match status {
            ActionStatus::Succeeded => ThreatStatus::Resolved,
            _ => ThreatStatus::Failed,
        };
        let threat = self
            .store
            .transition_threat(action.threat_id, threat_status)
            .await?;
        self.broadcaster.publish(LifecycleUpdate::threat(&threat));
        Ok(())
    }
}

// ============================================================================
// SIMULATED RUNNER
// ============================================================================

/// Recorded side effect of one simulated execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedIntent {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub target_resource: String,
}

/// Default runner: records what it would have done instead of touching
/// infrastructure. Stands in for a kubectl/cloud-API runner behind the same
/// contract.
#[derive(Default)]
pub struct SimulatedRunner {
    intents: Mutex<Vec<ExecutedIntent>>,
}

impl SimulatedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intents(&self) -> Vec<ExecutedIntent> {
        self.intents.lock().clone()
    }
}

#[async_trait]
impl ActionRunner for SimulatedRunner {
    async fn run(&self, action: &RemediationAction) -> Result<String, ExecError> {
        self.intents.lock().push(ExecutedIntent {
            action_id: action.id,
            action_type: action.action_type,
            target_resource: action.target_resource.clone(),
        });
        Ok(format!(
            "simulated {} on {}",
            action.action_type, action.target_resource
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

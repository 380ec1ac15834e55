//! Threat-response pipeline
//!
//! One event travels: intake -> scoring -> confirmation gate -> execution.
//! Each stage records its transition in the store and publishes it on the
//! lifecycle stream before the next stage runs.

pub mod executor;
pub mod gate;
pub mod ingest;
pub mod scoring;

use std::sync::Arc;

use serde::Serialize;

use crate::error::{AppResult, PipelineError};
use crate::models::{RemediationAction, ThreatEvent, ThreatStatus};
use crate::store::EventStore;
use crate::stream::{Broadcaster, LifecycleUpdate};

pub use executor::{ActionExecutor, ActionRunner, ExecError, SimulatedRunner};
pub use gate::{ConfirmDecision, ConfirmationGate, GateDecision};
pub use ingest::{EventIngestor, IngestReport};
pub use scoring::{AnomalyScorer, HeuristicScorer, PolicyAgent, RulePolicy, ScoringAdapter};

/// What one processed event produced: the stored threat and its linked
/// action, both refreshed after the pipeline ran to quiescence.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEvent {
    pub threat: ThreatEvent,
    pub action: RemediationAction,
}

pub struct Pipeline {
    store: Arc<EventStore>,
    ingestor: EventIngestor,
    scoring: ScoringAdapter,
    gate: Arc<ConfirmationGate>,
    executor: Arc<ActionExecutor>,
    broadcaster: Broadcaster,
}

impl Pipeline {
    pub fn new(
        store: Arc<EventStore>,
        ingestor: EventIngestor,
        scoring: ScoringAdapter,
        gate: Arc<ConfirmationGate>,
        executor: Arc<ActionExecutor>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            store,
            ingestor,
            scoring,
            gate,
            executor,
            broadcaster,
        }
    }

    /// Run one raw report through the full pipeline. Returns once the event
    /// has reached a stable state: terminal, queued behind a busy lane, or
    /// parked awaiting confirmation.
    pub async fn process(&self, report: IngestReport) -> AppResult<ProcessedEvent> {
        let threat = self.ingestor.ingest(report).await?;

        let outcome = self.scoring.evaluate(&threat).await;
        self.store
            .record_scoring(threat.id, outcome.anomaly_score, outcome.degraded)
            .await?;
        let threat = self
            .store
            .transition_threat(threat.id, ThreatStatus::Scored)
            .await?;
        self.broadcaster.publish(LifecycleUpdate::threat(&threat));

        let action = RemediationAction::new(
            threat.id,
            threat.target_resource.clone(),
            outcome.action_type,
            outcome.confidence,
            outcome.degraded,
        );
        self.store.insert_action(&action).await?;
        self.broadcaster.publish(LifecycleUpdate::action(&action));

        tracing::info!(
            threat_id = %threat.id,
            action_id = %action.id,
            action_type = action.action_type.as_str(),
            risk_tier = action.risk_tier.as_str(),
            confidence = action.confidence,
            degraded = action.degraded,
            "threat scored"
        );

        match self.gate.decide(&action) {
            GateDecision::Proceed => {
                self.executor.dispatch(&action.target_resource).await?;
            }
            GateDecision::Hold => {
                self.gate.hold(&action).await?;
            }
        }

        let threat = self
            .store
            .get_threat(threat.id)
            .await?
            .ok_or(PipelineError::NotFound("threat"))?;
        let action = self
            .store
            .get_action(action.id)
            .await?
            .ok_or(PipelineError::NotFound("action"))?;
        Ok(ProcessedEvent { threat, action })
    }

    /// Apply an operator decision to a parked action, then drain the
    /// resource lane if the action was approved.
    pub async fn confirm(
        &self,
        action_id: uuid::Uuid,
        decision: ConfirmDecision,
    ) -> AppResult<RemediationAction> {
        let action = self.gate.confirm(action_id, decision).await?;
        if decision == ConfirmDecision::Confirm {
            self.executor.dispatch(&action.target_resource).await?;
            return Ok(self
                .store
                .get_action(action_id)
                .await?
                .ok_or(PipelineError::NotFound("action"))?);
        }
        Ok(action)
    }
}

//! Confirmation gate
//!
//! Confidence-gated autonomy: low-risk actions run unattended, higher
//! blast-radius actions need either very high certainty or an explicit
//! human decision, and degraded-mode suggestions are never trusted with a
//! high-risk action. Parked actions carry a deadline enforced lazily on
//! access and by a periodic sweep.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppResult, PipelineError};
use crate::models::{ActionStatus, RemediationAction, RiskTier, ThreatStatus};
use crate::store::{EventStore, StoreError};
use crate::stream::{Broadcaster, LifecycleUpdate};

/// Outcome of the gate decision for a freshly scored action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Execute without human involvement.
    Proceed,
    /// Park the action until a human confirms or the deadline passes.
    Hold,
}

/// Operator verdict on a parked action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmDecision {
    Confirm,
    Reject,
}

/// Pure decision rule, evaluated once per action immediately after scoring.
pub fn evaluate(
    risk_tier: RiskTier,
    confidence: f64,
    degraded: bool,
    config: &Config,
) -> GateDecision {
    match risk_tier {
        RiskTier::Low => GateDecision::Proceed,
        RiskTier::Medium => {
            if confidence >= config.medium_confidence {
                GateDecision::Proceed
            } else {
                GateDecision::Hold
            }
        }
        // Fallback-mode decisions are never trusted for irreversible
        // actions, regardless of the reported confidence.
        RiskTier::High => {
            if confidence >= config.high_confidence && !degraded {
                GateDecision::Proceed
            } else {
                GateDecision::Hold
            }
        }
    }
}

pub struct ConfirmationGate {
    store: Arc<EventStore>,
    broadcaster: Broadcaster,
    config: Config,
}

impl ConfirmationGate {
    pub fn new(store: Arc<EventStore>, broadcaster: Broadcaster, config: Config) -> Self {
        Self {
            store,
            broadcaster,
            config,
        }
    }

    pub fn decide(&self, action: &RemediationAction) -> GateDecision {
        evaluate(
            action.risk_tier,
            action.confidence,
            action.degraded,
            &self.config,
        )
    }

    /// Park an action awaiting confirmation, moving its threat alongside.
    pub async fn hold(&self, action: &RemediationAction) -> AppResult<RemediationAction> {
        let threat = self
            .store
            .transition_threat(action.threat_id, ThreatStatus::AwaitingConfirmation)
            .await?;
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.confirmation_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let held = self.store.hold_action(action.id, deadline).await?;
        self.broadcaster.publish(LifecycleUpdate::threat(&threat));
        self.broadcaster.publish(LifecycleUpdate::action(&held));
        tracing::info!(
            action_id = %held.id,
            risk_tier = held.risk_tier.as_str(),
            confidence = held.confidence,
            degraded = held.degraded,
            deadline = %deadline,
            "action awaiting confirmation"
        );
        Ok(held)
    }

    /// Apply an operator decision to a parked action.
    ///
    /// A confirmed action re-enters the execution queue; the caller is
    /// responsible for dispatching its resource lane afterwards. Races with
    /// the expiry sweep resolve to exactly one winner; the loser receives
    /// `NotAwaitingConfirmation`.
    pub async fn confirm(
        &self,
        action_id: Uuid,
        decision: ConfirmDecision,
    ) -> AppResult<RemediationAction> {
        let action = self
            .store
            .get_action(action_id)
            .await?
            .ok_or(PipelineError::NotFound("action"))?;

        // Lazy expiry: an overdue action is expired on access, and the
        // confirmation attempt loses.
        if let Some(expired) = self.store.expire_if_overdue(action_id, Utc::now()).await? {
            self.publish_suppressed(&expired).await?;
            return Err(PipelineError::NotAwaitingConfirmation);
        }

        if action.status != ActionStatus::AwaitingConfirmation {
            return Err(PipelineError::NotAwaitingConfirmation);
        }

        match decision {
            ConfirmDecision::Confirm => {
                let confirmed = self
                    .store
                    .transition_action(action_id, ActionStatus::Pending)
                    .await
                    .map_err(Self::race_to_conflict)?;
                self.broadcaster.publish(LifecycleUpdate::action(&confirmed));
                tracing::info!(action_id = %action_id, "action confirmed by operator");
                Ok(confirmed)
            }
            ConfirmDecision::Reject => {
                let rejected = self
                    .store
                    .transition_action(action_id, ActionStatus::Expired)
                    .await
                    .map_err(Self::race_to_conflict)?;
                self.publish_suppressed(&rejected).await?;
                tracing::info!(action_id = %action_id, "action rejected by operator");
                Ok(rejected)
            }
        }
    }

    /// Expire every overdue parked action. Runs on a timer, independent of
    /// the ingestion path.
    pub async fn sweep(&self) -> AppResult<usize> {
        let expired = self.store.sweep_expired(Utc::now()).await?;
        for action in &expired {
            self.broadcaster.publish(LifecycleUpdate::action(action));
            if let Some(threat) = self.store.get_threat(action.threat_id).await? {
                self.broadcaster.publish(LifecycleUpdate::threat(&threat));
            }
            tracing::info!(action_id = %action.id, "confirmation deadline elapsed, action expired");
        }
        Ok(expired.len())
    }

    async fn publish_suppressed(&self, action: &RemediationAction) -> AppResult<()> {
        self.broadcaster.publish(LifecycleUpdate::action(action));
        // Rejection suppresses the owning threat; the sweep path has
        // already done this inside the store.
        match self
            .store
            .transition_threat(action.threat_id, ThreatStatus::Suppressed)
            .await
        {
            Ok(threat) => self.broadcaster.publish(LifecycleUpdate::threat(&threat)),
            Err(StoreError::InvalidTransition { .. }) => {
                if let Some(threat) = self.store.get_threat(action.threat_id).await? {
                    self.broadcaster.publish(LifecycleUpdate::threat(&threat));
                }
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// A lost transition race means the action left `AwaitingConfirmation`
    /// between our read and our write.
    fn race_to_conflict(err: StoreError) -> PipelineError {
        match err {
            StoreError::InvalidTransition { .. } => PipelineError::NotAwaitingConfirmation,
            other => other.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Scoring adapter
//!
//! Obtains `(anomaly_score, suggested_action, confidence)` for a threat by
//! calling the anomaly-scoring collaborator and then the policy
//! collaborator. Any collaborator being absent, erroring, or timing out
//! takes the same deterministic fallback and flags the pass as degraded;
//! scoring is never fatal to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ActionType, Priority, ThreatEvent, ThreatType};

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// COLLABORATOR CONTRACTS
// ============================================================================

/// Anomaly-scoring collaborator: returns a normalized score in 0.0..=1.0.
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    async fn score(&self, threat: &ThreatEvent) -> Result<f64, ScoringError>;
}

/// Policy collaborator: suggests an action and a confidence in 0.0..=1.0.
#[async_trait]
pub trait PolicyAgent: Send + Sync {
    async fn decide(
        &self,
        threat: &ThreatEvent,
        anomaly_score: Option<f64>,
    ) -> Result<(ActionType, f64), ScoringError>;
}

/// Result of one scoring pass.
#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    pub anomaly_score: Option<f64>,
    pub action_type: ActionType,
    pub confidence: f64,
    /// True when any collaborator failed and the deterministic fallback
    /// produced the suggestion.
    pub degraded: bool,
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct ScoringAdapter {
    scorer: Option<Arc<dyn AnomalyScorer>>,
    policy: Option<Arc<dyn PolicyAgent>>,
    call_timeout: Duration,
    fallback_confidence: f64,
}

impl ScoringAdapter {
    pub fn new(
        scorer: Option<Arc<dyn AnomalyScorer>>,
        policy: Option<Arc<dyn PolicyAgent>>,
        call_timeout: Duration,
        fallback_confidence: f64,
    ) -> Self {
        Self {
            scorer,
            policy,
            call_timeout,
            fallback_confidence,
        }
    }

    /// Score a threat. Infallible by contract: collaborator faults downgrade
    /// to the fallback rule instead of propagating.
    pub async fn evaluate(&self, threat: &ThreatEvent) -> ScoringOutcome {
        let mut degraded = false;

        let anomaly_score = match &self.scorer {
            Some(scorer) => {
                match tokio::time::timeout(self.call_timeout, scorer.score(threat)).await {
                    Ok(Ok(score)) => Some(score.clamp(0.0, 1.0)),
                    Ok(Err(err)) => {
                        tracing::warn!(threat_id = %threat.id, error = %err, "anomaly scorer failed");
                        degraded = true;
                        None
                    }
                    Err(_) => {
                        tracing::warn!(threat_id = %threat.id, "anomaly scorer timed out");
                        degraded = true;
                        None
                    }
                }
            }
            None => {
                degraded = true;
                None
            }
        };

        let decision = if degraded {
            None
        } else {
            match &self.policy {
                Some(policy) => {
                    match tokio::time::timeout(
                        self.call_timeout,
                        policy.decide(threat, anomaly_score),
                    )
                    .await
                    {
                        Ok(Ok((action, confidence))) => Some((action, confidence.clamp(0.0, 1.0))),
                        Ok(Err(err)) => {
                            tracing::warn!(threat_id = %threat.id, error = %err, "policy agent failed");
                            None
                        }
                        Err(_) => {
                            tracing::warn!(threat_id = %threat.id, "policy agent timed out");
                            None
                        }
                    }
                }
                None => None,
            }
        };

        match decision {
            Some((action_type, confidence)) => ScoringOutcome {
                anomaly_score,
                action_type,
                confidence,
                degraded: false,
            },
            None => ScoringOutcome {
                anomaly_score,
                action_type: fallback_action(threat.priority),
                confidence: self.fallback_confidence,
                degraded: true,
            },
        }
    }
}

/// Deterministic fallback: priority mapped to a baseline action. High-risk
/// fallback suggestions never auto-execute because the degraded flag blocks
/// them at the confirmation gate.
pub fn fallback_action(priority: Priority) -> ActionType {
    match priority {
        Priority::Debug | Priority::Informational | Priority::Notice => ActionType::Log,
        Priority::Warning => ActionType::Alert,
        Priority::Error => ActionType::Isolate,
        Priority::Critical | Priority::Alert => ActionType::QuarantineResource,
        Priority::Emergency => ActionType::Terminate,
    }
}

// ============================================================================
// DEFAULT COLLABORATORS
// ============================================================================

/// Built-in heuristic scorer: priority rank plus threat-type weight. Stands
/// in for a trained anomaly model behind the same contract.
pub struct HeuristicScorer;

#[async_trait]
impl AnomalyScorer for HeuristicScorer {
    async fn score(&self, threat: &ThreatEvent) -> Result<f64, ScoringError> {
        let base = threat.priority.rank() * 0.6;
        let type_weight = match threat.threat_type {
            ThreatType::ReverseShell
            | ThreatType::ContainerEscape
            | ThreatType::PrivilegeEscalation => 0.3,
            ThreatType::MaliciousProcess => 0.25,
            ThreatType::Unknown => 0.0,
            _ => 0.15,
        };
        let user_bump = threat
            .raw_fields
            .get("user.name")
            .and_then(|v| v.as_str())
            .filter(|u| *u == "root")
            .map(|_| 0.1)
            .unwrap_or(0.0);
        Ok((base + type_weight + user_bump).min(1.0))
    }
}

/// Built-in rule-based policy agent. Confidence is boosted by the anomaly
/// score when one is available.
pub struct RulePolicy;

#[async_trait]
impl PolicyAgent for RulePolicy {
    async fn decide(
        &self,
        threat: &ThreatEvent,
        anomaly_score: Option<f64>,
    ) -> Result<(ActionType, f64), ScoringError> {
        let escalating_type = matches!(
            threat.threat_type,
            ThreatType::ReverseShell | ThreatType::ContainerEscape
        );
        let (action, confidence) = match threat.priority {
            Priority::Emergency | Priority::Alert | Priority::Critical => {
                if escalating_type {
                    (ActionType::Terminate, 0.9)
                } else {
                    (ActionType::QuarantineResource, 0.8)
                }
            }
            Priority::Error => {
                if escalating_type {
                    (ActionType::Isolate, 0.75)
                } else {
                    (ActionType::Alert, 0.7)
                }
            }
            Priority::Warning => (ActionType::Alert, 0.6),
            Priority::Notice | Priority::Informational | Priority::Debug => {
                (ActionType::Log, 0.5)
            }
        };
        let confidence = (confidence + anomaly_score.unwrap_or(0.0) * 0.2).min(1.0);
        Ok((action, confidence))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    use crate::models::ThreatStatus;

    struct FailingScorer;

    #[async_trait]
    impl AnomalyScorer for FailingScorer {
        async fn score(&self, _threat: &ThreatEvent) -> Result<f64, ScoringError> {
            Err(ScoringError::Unavailable("model not loaded".to_string()))
        }
    }

    struct HangingScorer;

    #[async_trait]
    impl AnomalyScorer for HangingScorer {
        async fn score(&self, _threat: &ThreatEvent) -> Result<f64, ScoringError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0.9)
        }
    }

    fn threat(priority: Priority, threat_type: ThreatType) -> ThreatEvent {
        ThreatEvent {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            source_rule: "rule".to_string(),
            priority,
            threat_type,
            description: String::new(),
            raw_fields: BTreeMap::new(),
            target_resource: "pod-1".to_string(),
            anomaly_score: None,
            degraded_scoring: false,
            status: ThreatStatus::Received,
            linked_action_id: None,
            resolved_at: None,
        }
    }

    fn adapter_with(scorer: Option<Arc<dyn AnomalyScorer>>) -> ScoringAdapter {
        ScoringAdapter::new(
            scorer,
            Some(Arc::new(RulePolicy)),
            Duration::from_millis(50),
            0.5,
        )
    }

    #[test]
    fn test_fallback_action_map() {
        assert_eq!(fallback_action(Priority::Debug), ActionType::Log);
        assert_eq!(fallback_action(Priority::Informational), ActionType::Log);
        assert_eq!(fallback_action(Priority::Notice), ActionType::Log);
        assert_eq!(fallback_action(Priority::Warning), ActionType::Alert);
        assert_eq!(fallback_action(Priority::Error), ActionType::Isolate);
        assert_eq!(
            fallback_action(Priority::Critical),
            ActionType::QuarantineResource
        );
        assert_eq!(
            fallback_action(Priority::Alert),
            ActionType::QuarantineResource
        );
        assert_eq!(fallback_action(Priority::Emergency), ActionType::Terminate);
    }

    #[tokio::test]
    async fn test_absent_scorer_degrades_to_fallback() {
        let adapter = adapter_with(None);
        let outcome = adapter
            .evaluate(&threat(Priority::Warning, ThreatType::Unknown))
            .await;
        assert!(outcome.degraded);
        assert!(outcome.anomaly_score.is_none());
        assert_eq!(outcome.action_type, ActionType::Alert);
        assert_eq!(outcome.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_erroring_scorer_degrades_identically() {
        let adapter = adapter_with(Some(Arc::new(FailingScorer)));
        let outcome = adapter
            .evaluate(&threat(Priority::Emergency, ThreatType::ReverseShell))
            .await;
        assert!(outcome.degraded);
        assert_eq!(outcome.action_type, ActionType::Terminate);
        assert_eq!(outcome.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_timed_out_scorer_degrades_identically() {
        let adapter = adapter_with(Some(Arc::new(HangingScorer)));
        let outcome = adapter
            .evaluate(&threat(Priority::Error, ThreatType::Unknown))
            .await;
        assert!(outcome.degraded);
        assert_eq!(outcome.action_type, ActionType::Isolate);
        assert_eq!(outcome.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_live_collaborators_not_degraded() {
        let adapter = adapter_with(Some(Arc::new(HeuristicScorer)));
        let outcome = adapter
            .evaluate(&threat(Priority::Critical, ThreatType::ReverseShell))
            .await;
        assert!(!outcome.degraded);
        assert!(outcome.anomaly_score.is_some());
        assert_eq!(outcome.action_type, ActionType::Terminate);
        assert!(outcome.confidence >= 0.9);
    }

    #[tokio::test]
    async fn test_missing_policy_agent_degrades() {
        let adapter = ScoringAdapter::new(
            Some(Arc::new(HeuristicScorer)),
            None,
            Duration::from_millis(50),
            0.5,
        );
        let outcome = adapter
            .evaluate(&threat(Priority::Warning, ThreatType::Unknown))
            .await;
        assert!(outcome.degraded);
        // Anomaly score from the healthy scorer is still attached.
        assert!(outcome.anomaly_score.is_some());
        assert_eq!(outcome.action_type, ActionType::Alert);
    }
}

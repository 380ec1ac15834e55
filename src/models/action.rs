//! Remediation action model

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ACTION TYPES
// ============================================================================

/// Remediation action applied to a target resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Log,
    Alert,
    Isolate,
    RateLimit,
    RestartWorkload,
    QuarantineResource,
    Terminate,
    Escalate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Log => "log",
            ActionType::Alert => "alert",
            ActionType::Isolate => "isolate",
            ActionType::RateLimit => "rate_limit",
            ActionType::RestartWorkload => "restart_workload",
            ActionType::QuarantineResource => "quarantine_resource",
            ActionType::Terminate => "terminate",
            ActionType::Escalate => "escalate",
        }
    }

    /// Blast-radius classification. A pure function of the action type,
    /// never overridden per instance.
    pub fn risk_tier(&self) -> RiskTier {
        match self {
            ActionType::Log | ActionType::Alert | ActionType::Escalate => RiskTier::Low,
            ActionType::Isolate | ActionType::RateLimit | ActionType::RestartWorkload => {
                RiskTier::Medium
            }
            ActionType::QuarantineResource | ActionType::Terminate => RiskTier::High,
        }
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(ActionType::Log),
            "alert" => Ok(ActionType::Alert),
            "isolate" => Ok(ActionType::Isolate),
            "rate_limit" => Ok(ActionType::RateLimit),
            "restart_workload" => Ok(ActionType::RestartWorkload),
            "quarantine_resource" => Ok(ActionType::QuarantineResource),
            "terminate" => Ok(ActionType::Terminate),
            "escalate" => Ok(ActionType::Escalate),
            other => Err(format!("unknown action type: {}", other)),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk tier of an action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            other => Err(format!("unknown risk tier: {}", other)),
        }
    }
}

// ============================================================================
// ACTION STATUS
// ============================================================================

/// Execution lifecycle of a remediation action.
///
/// `Pending` means approved and waiting for its resource lane. A held action
/// moves to `Executing` only when the lane is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    AwaitingConfirmation,
    Executing,
    Succeeded,
    Failed,
    Expired,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::AwaitingConfirmation => "awaiting_confirmation",
            ActionStatus::Executing => "executing",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Expired
        )
    }

    /// Allowed status transitions. `AwaitingConfirmation -> Pending` is the
    /// human-confirmed path back into the execution queue.
    pub fn can_transition_to(&self, to: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, to),
            (Pending, AwaitingConfirmation)
                | (Pending, Executing)
                | (AwaitingConfirmation, Pending)
                | (AwaitingConfirmation, Expired)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "awaiting_confirmation" => Ok(ActionStatus::AwaitingConfirmation),
            "executing" => Ok(ActionStatus::Executing),
            "succeeded" => Ok(ActionStatus::Succeeded),
            "failed" => Ok(ActionStatus::Failed),
            "expired" => Ok(ActionStatus::Expired),
            other => Err(format!("unknown action status: {}", other)),
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// REMEDIATION ACTION
// ============================================================================

/// The chosen response to a threat event, tracked through its own lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub threat_id: Uuid,
    /// Denormalized from the owning threat; the serialization lane key.
    pub target_resource: String,
    pub action_type: ActionType,
    pub confidence: f64,
    pub risk_tier: RiskTier,
    pub status: ActionStatus,
    /// True when the scoring pass that produced this action was degraded.
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    /// Confirmation deadline, set while `AwaitingConfirmation`.
    pub deadline: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub executor_note: Option<String>,
    pub attempts: u32,
}

impl RemediationAction {
    pub fn new(
        threat_id: Uuid,
        target_resource: String,
        action_type: ActionType,
        confidence: f64,
        degraded: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            threat_id,
            target_resource,
            action_type,
            confidence,
            risk_tier: action_type.risk_tier(),
            status: ActionStatus::Pending,
            degraded,
            created_at: Utc::now(),
            deadline: None,
            resolved_at: None,
            executor_note: None,
            attempts: 0,
        }
    }
}

/// Query filter for the actions boundary.
#[derive(Debug, Deserialize, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub action_type: Option<ActionType>,
    pub resource: Option<String>,
    pub threat_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ActionFilter {
    pub fn matches(&self, action: &RemediationAction) -> bool {
        if let Some(status) = self.status {
            if action.status != status {
                return false;
            }
        }
        if let Some(action_type) = self.action_type {
            if action.action_type != action_type {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if &action.target_resource != resource {
                return false;
            }
        }
        if let Some(threat_id) = self.threat_id {
            if action.threat_id != threat_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if action.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if action.created_at > until {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

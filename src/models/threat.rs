//! Threat event model and lifecycle state machine

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// PRIORITY
// ============================================================================

/// Sensor priority levels, ordered from least to most severe.
///
/// Matches the eight syslog-style levels emitted by the runtime sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Debug,
    Informational,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Debug => "debug",
            Priority::Informational => "informational",
            Priority::Notice => "notice",
            Priority::Warning => "warning",
            Priority::Error => "error",
            Priority::Critical => "critical",
            Priority::Alert => "alert",
            Priority::Emergency => "emergency",
        }
    }

    /// Normalized rank in 0.0..=1.0, used by the heuristic scorer.
    pub fn rank(&self) -> f64 {
        *self as u8 as f64 / 7.0
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Priority::Debug),
            "informational" | "info" => Ok(Priority::Informational),
            "notice" => Ok(Priority::Notice),
            "warning" => Ok(Priority::Warning),
            "error" => Ok(Priority::Error),
            "critical" => Ok(Priority::Critical),
            "alert" => Ok(Priority::Alert),
            "emergency" => Ok(Priority::Emergency),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// THREAT TYPE
// ============================================================================

/// Classified threat category, derived from rule text and output keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    ReverseShell,
    PrivilegeEscalation,
    UnauthorizedAccess,
    MaliciousProcess,
    NetworkAnomaly,
    FileAnomaly,
    ContainerEscape,
    Unknown,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::ReverseShell => "reverse_shell",
            ThreatType::PrivilegeEscalation => "privilege_escalation",
            ThreatType::UnauthorizedAccess => "unauthorized_access",
            ThreatType::MaliciousProcess => "malicious_process",
            ThreatType::NetworkAnomaly => "network_anomaly",
            ThreatType::FileAnomaly => "file_anomaly",
            ThreatType::ContainerEscape => "container_escape",
            ThreatType::Unknown => "unknown",
        }
    }

    /// Keyword table checked against the lowercased `output + rule` text.
    /// First match wins, declaration order is the precedence.
    const KEYWORDS: &'static [(ThreatType, &'static [&'static str])] = &[
        (
            ThreatType::ReverseShell,
            &["reverse shell", "nc ", "netcat", "bash -i", "/bin/sh", "shell"],
        ),
        (
            ThreatType::PrivilegeEscalation,
            &["sudo", "su ", "setuid", "setgid", "capabilities"],
        ),
        (
            ThreatType::UnauthorizedAccess,
            &["unauthorized", "forbidden", "access denied"],
        ),
        (
            ThreatType::MaliciousProcess,
            &["malware", "virus", "trojan", "backdoor"],
        ),
        (
            ThreatType::NetworkAnomaly,
            &["port scan", "brute force", "ddos"],
        ),
        (
            ThreatType::FileAnomaly,
            &["sensitive file", "password", "secret", "credential"],
        ),
        (
            ThreatType::ContainerEscape,
            &["container escape", "host mount", "privileged"],
        ),
    ];

    /// Classify from the raw output and rule name.
    pub fn classify(output: &str, rule: &str) -> Self {
        let combined = format!("{} {}", output.to_lowercase(), rule.to_lowercase());
        for (threat_type, keywords) in Self::KEYWORDS {
            if keywords.iter().any(|k| combined.contains(k)) {
                return *threat_type;
            }
        }
        ThreatType::Unknown
    }
}

impl FromStr for ThreatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reverse_shell" => Ok(ThreatType::ReverseShell),
            "privilege_escalation" => Ok(ThreatType::PrivilegeEscalation),
            "unauthorized_access" => Ok(ThreatType::UnauthorizedAccess),
            "malicious_process" => Ok(ThreatType::MaliciousProcess),
            "network_anomaly" => Ok(ThreatType::NetworkAnomaly),
            "file_anomaly" => Ok(ThreatType::FileAnomaly),
            "container_escape" => Ok(ThreatType::ContainerEscape),
            "unknown" => Ok(ThreatType::Unknown),
            other => Err(format!("unknown threat type: {}", other)),
        }
    }
}

// ============================================================================
// LIFECYCLE STATE MACHINE
// ============================================================================

/// Lifecycle status of a threat event.
///
/// Received -> Scored -> {Executing | AwaitingConfirmation}
///                    -> {Resolved | Suppressed | Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatStatus {
    Received,
    Scored,
    AwaitingConfirmation,
    Executing,
    Resolved,
    Suppressed,
    Failed,
}

impl ThreatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatStatus::Received => "received",
            ThreatStatus::Scored => "scored",
            ThreatStatus::AwaitingConfirmation => "awaiting_confirmation",
            ThreatStatus::Executing => "executing",
            ThreatStatus::Resolved => "resolved",
            ThreatStatus::Suppressed => "suppressed",
            ThreatStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThreatStatus::Resolved | ThreatStatus::Suppressed | ThreatStatus::Failed
        )
    }

    /// Whether a transition from `self` to `to` is allowed. Terminal states
    /// absorb; every mutation path must go through this check.
    pub fn can_transition_to(&self, to: ThreatStatus) -> bool {
        use ThreatStatus::*;
        matches!(
            (self, to),
            (Received, Scored)
                | (Scored, Executing)
                | (Scored, AwaitingConfirmation)
                | (AwaitingConfirmation, Executing)
                | (AwaitingConfirmation, Suppressed)
                | (Executing, Resolved)
                | (Executing, Failed)
        )
    }
}

impl FromStr for ThreatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ThreatStatus::Received),
            "scored" => Ok(ThreatStatus::Scored),
            "awaiting_confirmation" => Ok(ThreatStatus::AwaitingConfirmation),
            "executing" => Ok(ThreatStatus::Executing),
            "resolved" => Ok(ThreatStatus::Resolved),
            "suppressed" => Ok(ThreatStatus::Suppressed),
            "failed" => Ok(ThreatStatus::Failed),
            other => Err(format!("unknown threat status: {}", other)),
        }
    }
}

impl std::fmt::Display for ThreatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// THREAT EVENT
// ============================================================================

/// A normalized record of one detected security-relevant occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub source_rule: String,
    pub priority: Priority,
    pub threat_type: ThreatType,
    /// Truncated sensor output, for display and keyword scoring.
    pub description: String,
    /// Raw sensor fields, keyed by field name.
    pub raw_fields: BTreeMap<String, serde_json::Value>,
    /// Identifier of the workload the event applies to. Immutable once set;
    /// the unit of execution serialization.
    pub target_resource: String,
    /// Anomaly score from the scoring collaborator, absent when the scorer
    /// was unavailable for this pass.
    pub anomaly_score: Option<f64>,
    /// True when scoring fell back to the deterministic rule.
    pub degraded_scoring: bool,
    pub status: ThreatStatus,
    pub linked_action_id: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Query filter for the threats boundary.
#[derive(Debug, Deserialize, Default)]
pub struct ThreatFilter {
    pub status: Option<ThreatStatus>,
    pub priority: Option<Priority>,
    pub resource: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ThreatFilter {
    pub fn matches(&self, threat: &ThreatEvent) -> bool {
        if let Some(status) = self.status {
            if threat.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if threat.priority != priority {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if &threat.target_resource != resource {
                return false;
            }
        }
        if let Some(since) = self.since {
            if threat.received_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if threat.received_at > until {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

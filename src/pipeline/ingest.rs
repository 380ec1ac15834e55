//! Event intake and normalization
//!
//! Accepts raw sensor reports, validates them, and produces canonical
//! `ThreatEvent` records in state `Received`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppResult, PipelineError};
use crate::models::{ThreatEvent, ThreatStatus, ThreatType};
use crate::store::EventStore;
use crate::stream::{Broadcaster, LifecycleUpdate};

/// Events with no workload identifier all share this serialization lane.
pub const UNSCOPED_RESOURCE: &str = "unscoped";

/// Raw event report as delivered by the sensor webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestReport {
    #[serde(default)]
    pub output: String,
    pub priority: Option<String>,
    pub rule: Option<String>,
    #[serde(default)]
    pub output_fields: BTreeMap<String, serde_json::Value>,
}

/// Field keys consulted for the target resource, in precedence order.
const RESOURCE_FIELDS: &[&str] = &[
    "k8s.pod.name",
    "pod",
    "container.id",
    "container.name",
    "host.id",
    "host.name",
];

pub struct EventIngestor {
    store: Arc<EventStore>,
    broadcaster: Broadcaster,
}

impl EventIngestor {
    pub fn new(store: Arc<EventStore>, broadcaster: Broadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Normalize and register a raw report. Rejects reports missing
    /// `priority` or `rule` without creating anything.
    pub async fn ingest(&self, report: IngestReport) -> AppResult<ThreatEvent> {
        let priority_raw = report
            .priority
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PipelineError::MalformedEvent("missing field: priority".to_string()))?;
        let rule = report
            .rule
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| PipelineError::MalformedEvent("missing field: rule".to_string()))?;

        let priority = priority_raw
            .parse()
            .map_err(PipelineError::MalformedEvent)?;

        let threat = ThreatEvent {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            source_rule: rule.to_string(),
            priority,
            threat_type: ThreatType::classify(&report.output, rule),
            description: truncate(&report.output, 500),
            target_resource: extract_target_resource(&report.output_fields),
            raw_fields: report.output_fields,
            anomaly_score: None,
            degraded_scoring: false,
            status: ThreatStatus::Received,
            linked_action_id: None,
            resolved_at: None,
        };

        self.store.insert_threat(&threat).await?;
        self.broadcaster.publish(LifecycleUpdate::threat(&threat));

        tracing::info!(
            threat_id = %threat.id,
            rule = %threat.source_rule,
            priority = %threat.priority,
            resource = %threat.target_resource,
            threat_type = threat.threat_type.as_str(),
            "threat received"
        );

        Ok(threat)
    }
}

/// Pick the target resource by field precedence; unscoped events share one
/// synthetic lane.
fn extract_target_resource(fields: &BTreeMap<String, serde_json::Value>) -> String {
    for key in RESOURCE_FIELDS {
        if let Some(value) = fields.get(*key).and_then(|v| v.as_str()) {
            if !value.trim().is_empty() {
                return value.to_string();
            }
        }
    }
    UNSCOPED_RESOURCE.to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use serde_json::json;

    fn ingestor() -> EventIngestor {
        EventIngestor::new(Arc::new(EventStore::in_memory()), Broadcaster::new(8))
    }

    fn report(priority: Option<&str>, rule: Option<&str>) -> IngestReport {
        IngestReport {
            output: "A shell was spawned in a container".to_string(),
            priority: priority.map(String::from),
            rule: rule.map(String::from),
            output_fields: BTreeMap::from([(
                "k8s.pod.name".to_string(),
                json!("evil-pod"),
            )]),
        }
    }

    #[tokio::test]
    async fn test_missing_priority_rejected() {
        let err = ingestor()
            .ingest(report(None, Some("Terminal shell in container")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_missing_rule_rejected_and_nothing_stored() {
        let store = Arc::new(EventStore::in_memory());
        let ingestor = EventIngestor::new(store.clone(), Broadcaster::new(8));
        let err = ingestor.ingest(report(Some("Warning"), None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedEvent(_)));

        let threats = store.list_threats(&Default::default()).await.unwrap();
        assert!(threats.is_empty());
    }

    #[tokio::test]
    async fn test_normalizes_valid_report() {
        let threat = ingestor()
            .ingest(report(Some("WARNING"), Some("Terminal shell in container")))
            .await
            .unwrap();
        assert_eq!(threat.priority, Priority::Warning);
        assert_eq!(threat.status, ThreatStatus::Received);
        assert_eq!(threat.target_resource, "evil-pod");
        assert_eq!(threat.threat_type, ThreatType::ReverseShell);
    }

    #[tokio::test]
    async fn test_unscoped_events_share_a_lane() {
        let mut r = report(Some("Notice"), Some("Some rule"));
        r.output_fields.clear();
        let threat = ingestor().ingest(r).await.unwrap();
        assert_eq!(threat.target_resource, UNSCOPED_RESOURCE);
    }

    #[test]
    fn test_resource_precedence_prefers_pod() {
        let fields = BTreeMap::from([
            ("host.id".to_string(), json!("node-9")),
            ("container.id".to_string(), json!("c-123")),
            ("k8s.pod.name".to_string(), json!("pod-7")),
        ]);
        assert_eq!(extract_target_resource(&fields), "pod-7");
    }

    #[test]
    fn test_resource_precedence_falls_back_to_container_then_host() {
        let fields = BTreeMap::from([
            ("host.id".to_string(), json!("node-9")),
            ("container.id".to_string(), json!("c-123")),
        ]);
        assert_eq!(extract_target_resource(&fields), "c-123");

        let fields = BTreeMap::from([("host.id".to_string(), json!("node-9"))]);
        assert_eq!(extract_target_resource(&fields), "node-9");
    }
}

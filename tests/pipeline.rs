//! End-to-end pipeline tests against the in-memory store: one raw report
//! in, lifecycle transitions and simulated side effects out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use sentinelforge::models::{
    ActionStatus, ActionType, Priority, RemediationAction, RiskTier, ThreatEvent, ThreatStatus,
    ThreatType,
};
use sentinelforge::pipeline::{
    ActionRunner, ConfirmDecision, ExecError, HeuristicScorer, IngestReport, RulePolicy,
    SimulatedRunner,
};
use sentinelforge::store::EventStore;
use sentinelforge::stream::{EntityKind, LifecycleUpdate};
use sentinelforge::{AppState, Config, PipelineError};

fn fast_config() -> Config {
    let mut config = Config::from_env();
    config.execution_backoff = Duration::from_millis(1);
    config.scoring_timeout = Duration::from_millis(100);
    config
}

fn state_with(scorer: bool, config: Config) -> (AppState, Arc<SimulatedRunner>) {
    let runner = Arc::new(SimulatedRunner::new());
    let state = AppState::build(
        Arc::new(EventStore::in_memory()),
        scorer.then(|| Arc::new(HeuristicScorer) as _),
        scorer.then(|| Arc::new(RulePolicy) as _),
        runner.clone(),
        config,
    );
    (state, runner)
}

fn report(priority: &str, rule: &str, pod: &str) -> IngestReport {
    IngestReport {
        output: format!("{} observed on {}", rule, pod),
        priority: Some(priority.to_string()),
        rule: Some(rule.to_string()),
        output_fields: BTreeMap::from([("k8s.pod.name".to_string(), json!(pod))]),
    }
}

#[tokio::test]
async fn malformed_report_is_rejected_without_side_effects() {
    let (state, runner) = state_with(true, fast_config());

    let mut bad = report("Warning", "Suspicious outbound connection", "pod-a");
    bad.priority = None;
    let err = state.pipeline.process(bad).await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedEvent(_)));

    let mut nonsense = report("SHOUTING", "Suspicious outbound connection", "pod-a");
    nonsense.priority = Some("not-a-priority".to_string());
    assert!(state.pipeline.process(nonsense).await.is_err());

    assert!(state
        .store
        .list_threats(&Default::default())
        .await
        .unwrap()
        .is_empty());
    assert!(runner.intents().is_empty());
}

#[tokio::test]
async fn low_risk_event_auto_resolves() {
    let (state, runner) = state_with(true, fast_config());

    let processed = state
        .pipeline
        .process(report("Warning", "Unexpected config read", "pod-b"))
        .await
        .unwrap();

    assert_eq!(processed.action.action_type, ActionType::Alert);
    assert_eq!(processed.action.risk_tier, RiskTier::Low);
    assert_eq!(processed.action.status, ActionStatus::Succeeded);
    assert_eq!(processed.threat.status, ThreatStatus::Resolved);
    assert!(processed.threat.resolved_at.is_some());
    assert_eq!(processed.threat.linked_action_id, Some(processed.action.id));
    assert_eq!(runner.intents().len(), 1);
}

#[tokio::test]
async fn confident_high_risk_event_auto_executes() {
    let (state, runner) = state_with(true, fast_config());

    let processed = state
        .pipeline
        .process(report(
            "Emergency",
            "Reverse shell spawned in container",
            "pod-c",
        ))
        .await
        .unwrap();

    assert_eq!(processed.action.action_type, ActionType::Terminate);
    assert_eq!(processed.action.risk_tier, RiskTier::High);
    assert!(processed.action.confidence >= 0.9);
    assert!(!processed.action.degraded);
    assert_eq!(processed.action.status, ActionStatus::Succeeded);
    assert_eq!(processed.threat.status, ThreatStatus::Resolved);
    assert_eq!(runner.intents()[0].action_type, ActionType::Terminate);
}

#[tokio::test]
async fn degraded_scoring_never_auto_executes_high_risk() {
    // No collaborators: the deterministic fallback suggests Terminate for an
    // emergency but flags the pass as degraded.
    let (state, runner) = state_with(false, fast_config());

    let processed = state
        .pipeline
        .process(report("Emergency", "Kernel module loaded", "pod-d"))
        .await
        .unwrap();

    assert_eq!(processed.action.action_type, ActionType::Terminate);
    assert!(processed.action.degraded);
    assert_eq!(processed.action.confidence, 0.5);
    assert_eq!(processed.action.status, ActionStatus::AwaitingConfirmation);
    assert!(processed.action.deadline.is_some());
    assert_eq!(processed.threat.status, ThreatStatus::AwaitingConfirmation);
    assert!(processed.threat.degraded_scoring);
    assert!(runner.intents().is_empty());
}

#[tokio::test]
async fn degraded_low_risk_event_still_auto_resolves() {
    let (state, runner) = state_with(false, fast_config());

    let processed = state
        .pipeline
        .process(report("Warning", "World-writable file created", "pod-e"))
        .await
        .unwrap();

    // Warning falls back to Alert: low risk runs unattended even degraded.
    assert_eq!(processed.action.action_type, ActionType::Alert);
    assert!(processed.action.degraded);
    assert_eq!(processed.action.status, ActionStatus::Succeeded);
    assert_eq!(processed.threat.status, ThreatStatus::Resolved);
    assert_eq!(runner.intents().len(), 1);
}

#[tokio::test]
async fn confirmed_action_executes_and_resolves() {
    let (state, runner) = state_with(false, fast_config());

    let processed = state
        .pipeline
        .process(report("Emergency", "Container escape attempt", "pod-f"))
        .await
        .unwrap();
    assert_eq!(processed.action.status, ActionStatus::AwaitingConfirmation);

    let confirmed = state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Confirm)
        .await
        .unwrap();
    assert_eq!(confirmed.status, ActionStatus::Succeeded);
    assert_eq!(runner.intents().len(), 1);

    let threat = state
        .store
        .get_threat(processed.threat.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(threat.status, ThreatStatus::Resolved);
}

#[tokio::test]
async fn rejected_action_suppresses_threat() {
    let (state, runner) = state_with(false, fast_config());

    let processed = state
        .pipeline
        .process(report("Critical", "Crypto miner detected", "pod-g"))
        .await
        .unwrap();
    assert_eq!(processed.action.status, ActionStatus::AwaitingConfirmation);

    let rejected = state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Reject)
        .await
        .unwrap();
    assert_eq!(rejected.status, ActionStatus::Expired);
    assert!(runner.intents().is_empty());

    let threat = state
        .store
        .get_threat(processed.threat.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(threat.status, ThreatStatus::Suppressed);
    assert!(threat.resolved_at.is_some());
}

#[tokio::test]
async fn overdue_confirmation_loses_to_lazy_expiry() {
    let mut config = fast_config();
    config.confirmation_timeout = Duration::from_secs(0);
    let (state, runner) = state_with(false, config);

    let processed = state
        .pipeline
        .process(report("Emergency", "Sensitive mount by container", "pod-h"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Confirm)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAwaitingConfirmation));

    let action = state
        .store
        .get_action(processed.action.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Expired);
    let threat = state
        .store
        .get_threat(processed.threat.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(threat.status, ThreatStatus::Suppressed);
    assert!(runner.intents().is_empty());
}

#[tokio::test]
async fn sweep_expires_overdue_actions_once() {
    let mut config = fast_config();
    config.confirmation_timeout = Duration::from_secs(0);
    let (state, _runner) = state_with(false, config);

    state
        .pipeline
        .process(report("Alert", "Privilege escalation via setuid", "pod-i"))
        .await
        .unwrap();
    state
        .pipeline
        .process(report("Emergency", "Reverse shell spawned", "pod-j"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(state.gate.sweep().await.unwrap(), 2);
    // Nothing left to expire on the next pass.
    assert_eq!(state.gate.sweep().await.unwrap(), 0);

    for threat in state.store.list_threats(&Default::default()).await.unwrap() {
        assert_eq!(threat.status, ThreatStatus::Suppressed);
    }
}

#[tokio::test]
async fn same_resource_actions_execute_in_arrival_order() {
    let (state, runner) = state_with(true, fast_config());

    let first = state
        .pipeline
        .process(report("Warning", "Unexpected process spawned", "pod-k"))
        .await
        .unwrap();
    let second = state
        .pipeline
        .process(report("Warning", "Outbound connection to tor node", "pod-k"))
        .await
        .unwrap();

    assert_eq!(first.threat.status, ThreatStatus::Resolved);
    assert_eq!(second.threat.status, ThreatStatus::Resolved);

    let intents = runner.intents();
    assert_eq!(intents.len(), 2);
    assert_eq!(intents[0].action_id, first.action.id);
    assert_eq!(intents[1].action_id, second.action.id);
    assert_eq!(intents[0].target_resource, "pod-k");
}

#[tokio::test]
async fn distinct_resources_do_not_share_a_lane() {
    let (state, runner) = state_with(true, fast_config());

    for pod in ["pod-l", "pod-m", "pod-n"] {
        let processed = state
            .pipeline
            .process(report("Warning", "Unexpected process spawned", pod))
            .await
            .unwrap();
        assert_eq!(processed.threat.status, ThreatStatus::Resolved);
    }
    assert_eq!(runner.intents().len(), 3);
}

#[tokio::test]
async fn events_without_workload_share_the_unscoped_lane() {
    let (state, _runner) = state_with(true, fast_config());

    let mut orphan = report("Notice", "Clock skew detected", "ignored");
    orphan.output_fields.clear();
    let processed = state.pipeline.process(orphan).await.unwrap();

    assert_eq!(processed.threat.target_resource, "unscoped");
    assert_eq!(processed.action.target_resource, "unscoped");
    assert_eq!(processed.threat.status, ThreatStatus::Resolved);
}

#[tokio::test]
async fn confirming_twice_conflicts_on_the_second_attempt() {
    let (state, _runner) = state_with(false, fast_config());

    let processed = state
        .pipeline
        .process(report("Emergency", "Container escape attempt", "pod-o"))
        .await
        .unwrap();

    state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Confirm)
        .await
        .unwrap();
    let err = state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Confirm)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAwaitingConfirmation));
}

/// Runner that tracks how many executions overlap in time.
#[derive(Default)]
struct OverlapTrackingRunner {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl ActionRunner for OverlapTrackingRunner {
    async fn run(&self, action: &RemediationAction) -> Result<String, ExecError> {
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("handled {}", action.target_resource))
    }
}

#[tokio::test]
async fn concurrent_ingest_on_one_resource_never_overlaps_execution() {
    let runner = Arc::new(OverlapTrackingRunner::default());
    let state = AppState::build(
        Arc::new(EventStore::in_memory()),
        Some(Arc::new(HeuristicScorer) as _),
        Some(Arc::new(RulePolicy) as _),
        runner.clone(),
        fast_config(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            state
                .pipeline
                .process(report("Warning", "Unexpected process spawned", "pod-race"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Every event executed, one at a time: the lane admits no overlap.
    assert_eq!(runner.runs.load(Ordering::SeqCst), 8);
    assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
    let threats = state.store.list_threats(&Default::default()).await.unwrap();
    assert_eq!(threats.len(), 8);
    for threat in threats {
        assert_eq!(threat.status, ThreatStatus::Resolved);
    }
}

#[tokio::test]
async fn concurrent_sweep_and_confirm_expire_exactly_once() {
    let mut config = fast_config();
    config.confirmation_timeout = Duration::from_secs(0);
    let (state, runner) = state_with(false, config);

    let processed = state
        .pipeline
        .process(report("Emergency", "Container escape attempt", "pod-p"))
        .await
        .unwrap();
    assert_eq!(processed.action.status, ActionStatus::AwaitingConfirmation);

    // Sweep and operator confirmation race for the same overdue action.
    let sweeper = tokio::spawn({
        let state = state.clone();
        async move { state.gate.sweep().await }
    });
    let confirmer = tokio::spawn({
        let state = state.clone();
        let id = processed.action.id;
        async move { state.pipeline.confirm(id, ConfirmDecision::Confirm).await }
    });

    let swept = sweeper.await.unwrap().unwrap();
    let confirm = confirmer.await.unwrap();

    // One winner: whichever path expired it first; the confirmation is
    // rejected either way and the side effect never runs.
    assert!(swept <= 1);
    assert!(matches!(
        confirm.unwrap_err(),
        PipelineError::NotAwaitingConfirmation
    ));
    let action = state
        .store
        .get_action(processed.action.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Expired);
    let threat = state
        .store
        .get_threat(processed.threat.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(threat.status, ThreatStatus::Suppressed);
    assert!(runner.intents().is_empty());
    // Nothing left for a later pass.
    assert_eq!(state.gate.sweep().await.unwrap(), 0);
}

fn drain_updates(rx: &mut broadcast::Receiver<LifecycleUpdate>) -> Vec<LifecycleUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

fn statuses_of(updates: &[LifecycleUpdate], entity: EntityKind, id: Uuid) -> Vec<String> {
    updates
        .iter()
        .filter(|u| u.entity == entity && u.id == id)
        .map(|u| u.status.clone())
        .collect()
}

async fn replay_threat(statuses: &[String], resource: &str) -> ThreatStatus {
    let store = EventStore::in_memory();
    let threat = ThreatEvent {
        id: Uuid::new_v4(),
        received_at: Utc::now(),
        source_rule: "rule".to_string(),
        priority: Priority::Warning,
        threat_type: ThreatType::Unknown,
        description: String::new(),
        raw_fields: BTreeMap::new(),
        target_resource: resource.to_string(),
        anomaly_score: None,
        degraded_scoring: false,
        status: ThreatStatus::Received,
        linked_action_id: None,
        resolved_at: None,
    };
    store.insert_threat(&threat).await.unwrap();

    let mut current = ThreatStatus::Received;
    assert_eq!(statuses[0], current.as_str());
    for raw in &statuses[1..] {
        let next: ThreatStatus = raw.parse().unwrap();
        assert!(current.can_transition_to(next));
        current = store.transition_threat(threat.id, next).await.unwrap().status;
    }
    current
}

async fn replay_action(statuses: &[String], resource: &str) -> ActionStatus {
    let store = EventStore::in_memory();
    let threat = ThreatEvent {
        id: Uuid::new_v4(),
        received_at: Utc::now(),
        source_rule: "rule".to_string(),
        priority: Priority::Warning,
        threat_type: ThreatType::Unknown,
        description: String::new(),
        raw_fields: BTreeMap::new(),
        target_resource: resource.to_string(),
        anomaly_score: None,
        degraded_scoring: false,
        status: ThreatStatus::Received,
        linked_action_id: None,
        resolved_at: None,
    };
    store.insert_threat(&threat).await.unwrap();
    let action = RemediationAction::new(
        threat.id,
        resource.to_string(),
        ActionType::Terminate,
        0.5,
        true,
    );
    store.insert_action(&action).await.unwrap();

    let mut current = ActionStatus::Pending;
    assert_eq!(statuses[0], current.as_str());
    for raw in &statuses[1..] {
        let next: ActionStatus = raw.parse().unwrap();
        assert!(current.can_transition_to(next));
        current = store.transition_action(action.id, next).await.unwrap().status;
    }
    current
}

#[tokio::test]
async fn recorded_transitions_replay_to_the_same_terminal_status() {
    // Auto-executed path: Received -> Scored -> Executing -> Resolved.
    let (state, _runner) = state_with(true, fast_config());
    let mut rx = state.broadcaster.subscribe();
    let processed = state
        .pipeline
        .process(report("Warning", "Unexpected config read", "pod-q"))
        .await
        .unwrap();
    let updates = drain_updates(&mut rx);
    let recorded = statuses_of(&updates, EntityKind::Threat, processed.threat.id);
    assert_eq!(recorded.last().unwrap(), processed.threat.status.as_str());
    let replayed = replay_threat(&recorded, "pod-q").await;
    assert_eq!(replayed, processed.threat.status);
    assert!(replayed.is_terminal());

    // Held-then-rejected path: Received -> Scored -> AwaitingConfirmation
    // -> Suppressed, with the action going Pending ->
    // AwaitingConfirmation -> Expired.
    let (state, _runner) = state_with(false, fast_config());
    let mut rx = state.broadcaster.subscribe();
    let processed = state
        .pipeline
        .process(report("Emergency", "Kernel module loaded", "pod-r"))
        .await
        .unwrap();
    state
        .pipeline
        .confirm(processed.action.id, ConfirmDecision::Reject)
        .await
        .unwrap();
    let updates = drain_updates(&mut rx);

    let recorded = statuses_of(&updates, EntityKind::Threat, processed.threat.id);
    let replayed = replay_threat(&recorded, "pod-r").await;
    assert_eq!(replayed, ThreatStatus::Suppressed);

    let recorded = statuses_of(&updates, EntityKind::Action, processed.action.id);
    let replayed = replay_action(&recorded, "pod-r").await;
    assert_eq!(replayed, ActionStatus::Expired);
}

#[tokio::test]
async fn confirming_unknown_action_is_not_found() {
    let (state, _runner) = state_with(false, fast_config());
    let err = state
        .pipeline
        .confirm(uuid::Uuid::new_v4(), ConfirmDecision::Confirm)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

//! In-process store backend
//!
//! Authoritative fallback when no database is configured or reachable.
//! Preserves every store invariant; only persistence across restarts is
//! lost. All state lives behind one mutex; the lock is held only for the
//! claim/transition step, never across collaborator calls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{
    ActionFilter, ActionStatus, RemediationAction, ThreatEvent, ThreatFilter, ThreatStatus,
};

use super::StoreError;

#[derive(Default)]
struct State {
    threats: HashMap<Uuid, ThreatEvent>,
    threat_order: Vec<Uuid>,
    actions: HashMap<Uuid, RemediationAction>,
    action_order: Vec<Uuid>,
    /// Per-resource execution lane: resource id -> currently executing action.
    lanes: HashMap<String, Uuid>,
}

pub struct MemoryStore {
    inner: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    pub fn insert_threat(&self, threat: &ThreatEvent) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if state.threats.contains_key(&threat.id) {
            return Err(StoreError::Conflict(format!(
                "threat {} already exists",
                threat.id
            )));
        }
        state.threat_order.push(threat.id);
        state.threats.insert(threat.id, threat.clone());
        Ok(())
    }

    pub fn get_threat(&self, id: Uuid) -> Result<Option<ThreatEvent>, StoreError> {
        Ok(self.inner.lock().threats.get(&id).cloned())
    }

    pub fn list_threats(&self, filter: &ThreatFilter) -> Result<Vec<ThreatEvent>, StoreError> {
        let state = self.inner.lock();
        let limit = filter.limit.unwrap_or(100);
        // Newest first
        let matched = state
            .threat_order
            .iter()
            .rev()
            .filter_map(|id| state.threats.get(id))
            .filter(|t| filter.matches(t))
            .take(limit)
            .cloned()
            .collect();
        Ok(matched)
    }

    pub fn transition_threat(
        &self,
        id: Uuid,
        to: ThreatStatus,
    ) -> Result<ThreatEvent, StoreError> {
        let mut state = self.inner.lock();
        let threat = state
            .threats
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "threat", id })?;
        Self::apply_threat_transition(threat, to)?;
        Ok(threat.clone())
    }

    pub fn record_scoring(
        &self,
        id: Uuid,
        anomaly_score: Option<f64>,
        degraded: bool,
    ) -> Result<ThreatEvent, StoreError> {
        let mut state = self.inner.lock();
        let threat = state
            .threats
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "threat", id })?;
        // Scores may be overwritten only before the event leaves Scored.
        if !matches!(threat.status, ThreatStatus::Received | ThreatStatus::Scored) {
            return Err(StoreError::Conflict(format!(
                "threat {} is {} and can no longer be re-scored",
                id, threat.status
            )));
        }
        threat.anomaly_score = anomaly_score;
        threat.degraded_scoring = degraded;
        Ok(threat.clone())
    }

    pub fn insert_action(&self, action: &RemediationAction) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        let threat = state
            .threats
            .get(&action.threat_id)
            .ok_or(StoreError::NotFound {
                entity: "threat",
                id: action.threat_id,
            })?;
        if let Some(existing_id) = threat.linked_action_id {
            if let Some(existing) = state.actions.get(&existing_id) {
                if !existing.status.is_terminal() {
                    return Err(StoreError::Conflict(format!(
                        "threat {} already has non-terminal action {}",
                        action.threat_id, existing_id
                    )));
                }
            }
        }
        state.action_order.push(action.id);
        state.actions.insert(action.id, action.clone());
        if let Some(threat) = state.threats.get_mut(&action.threat_id) {
            threat.linked_action_id = Some(action.id);
        }
        Ok(())
    }

    pub fn get_action(&self, id: Uuid) -> Result<Option<RemediationAction>, StoreError> {
        Ok(self.inner.lock().actions.get(&id).cloned())
    }

    pub fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        let state = self.inner.lock();
        let limit = filter.limit.unwrap_or(100);
        let matched = state
            .action_order
            .iter()
            .rev()
            .filter_map(|id| state.actions.get(id))
            .filter(|a| filter.matches(a))
            .take(limit)
            .cloned()
            .collect();
        Ok(matched)
    }

    pub fn transition_action(
        &self,
        id: Uuid,
        to: ActionStatus,
    ) -> Result<RemediationAction, StoreError> {
        let mut state = self.inner.lock();
        Self::apply_action_transition(&mut state, id, to)?;
        Ok(state.actions[&id].clone())
    }

    pub fn hold_action(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<RemediationAction, StoreError> {
        let mut state = self.inner.lock();
        Self::apply_action_transition(&mut state, id, ActionStatus::AwaitingConfirmation)?;
        let action = state.actions.get_mut(&id).expect("validated above");
        action.deadline = Some(deadline);
        Ok(action.clone())
    }

    pub fn complete_action(
        &self,
        id: Uuid,
        to: ActionStatus,
        note: Option<String>,
    ) -> Result<RemediationAction, StoreError> {
        if !matches!(to, ActionStatus::Succeeded | ActionStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                entity: "action",
                from: ActionStatus::Executing.to_string(),
                to: to.to_string(),
            });
        }
        let mut state = self.inner.lock();
        Self::apply_action_transition(&mut state, id, to)?;
        let action = state.actions.get_mut(&id).expect("validated above");
        action.executor_note = note;
        Ok(action.clone())
    }

    pub fn increment_attempts(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut state = self.inner.lock();
        let action = state
            .actions
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "action", id })?;
        action.attempts += 1;
        Ok(action.attempts)
    }

    pub fn claim_next_action(
        &self,
        resource: &str,
    ) -> Result<Option<RemediationAction>, StoreError> {
        let mut state = self.inner.lock();
        if state.lanes.contains_key(resource) {
            return Ok(None);
        }
        let candidate = state
            .action_order
            .iter()
            .filter_map(|id| state.actions.get(id))
            .find(|a| a.status == ActionStatus::Pending && a.target_resource == resource)
            .map(|a| a.id);
        let Some(action_id) = candidate else {
            return Ok(None);
        };
        // Validate the threat side first so a rejection leaves nothing changed.
        let threat_id = state.actions[&action_id].threat_id;
        let threat_status = state
            .threats
            .get(&threat_id)
            .ok_or(StoreError::NotFound {
                entity: "threat",
                id: threat_id,
            })?
            .status;
        if !threat_status.can_transition_to(ThreatStatus::Executing) {
            return Err(StoreError::InvalidTransition {
                entity: "threat",
                from: threat_status.to_string(),
                to: ThreatStatus::Executing.to_string(),
            });
        }
        Self::apply_action_transition(&mut state, action_id, ActionStatus::Executing)?;
        let threat = state.threats.get_mut(&threat_id).expect("checked above");
        Self::apply_threat_transition(threat, ThreatStatus::Executing)?;
        Ok(Some(state.actions[&action_id].clone()))
    }

    pub fn expire_if_overdue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RemediationAction>, StoreError> {
        let mut state = self.inner.lock();
        let overdue = match state.actions.get(&id) {
            Some(a) => {
                a.status == ActionStatus::AwaitingConfirmation
                    && a.deadline.map(|d| d <= now).unwrap_or(false)
            }
            None => return Err(StoreError::NotFound { entity: "action", id }),
        };
        if !overdue {
            return Ok(None);
        }
        Self::expire_locked(&mut state, id)?;
        Ok(Some(state.actions[&id].clone()))
    }

    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        let mut state = self.inner.lock();
        let overdue: Vec<Uuid> = state
            .actions
            .values()
            .filter(|a| {
                a.status == ActionStatus::AwaitingConfirmation
                    && a.deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            Self::expire_locked(&mut state, id)?;
            expired.push(state.actions[&id].clone());
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Internal transition helpers, called with the state lock held.
    // ------------------------------------------------------------------

    fn apply_threat_transition(
        threat: &mut ThreatEvent,
        to: ThreatStatus,
    ) -> Result<(), StoreError> {
        if !threat.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: "threat",
                from: threat.status.to_string(),
                to: to.to_string(),
            });
        }
        threat.status = to;
        if to.is_terminal() {
            threat.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    fn apply_action_transition(
        state: &mut State,
        id: Uuid,
        to: ActionStatus,
    ) -> Result<(), StoreError> {
        let action = state
            .actions
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "action", id })?;
        let from = action.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: "action",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let resource = action.target_resource.clone();
        if to == ActionStatus::Executing {
            if let Some(occupant) = state.lanes.get(&resource) {
                return Err(StoreError::Conflict(format!(
                    "resource lane {} busy with action {}",
                    resource, occupant
                )));
            }
            state.lanes.insert(resource.clone(), id);
        }
        if from == ActionStatus::Executing {
            if state.lanes.get(&resource) == Some(&id) {
                state.lanes.remove(&resource);
            }
        }
        let action = state.actions.get_mut(&id).expect("checked above");
        action.status = to;
        if from == ActionStatus::AwaitingConfirmation && to == ActionStatus::Pending {
            action.deadline = None;
        }
        if to.is_terminal() {
            action.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    fn expire_locked(state: &mut State, id: Uuid) -> Result<(), StoreError> {
        Self::apply_action_transition(state, id, ActionStatus::Expired)?;
        let threat_id = state.actions[&id].threat_id;
        if let Some(threat) = state.threats.get_mut(&threat_id) {
            Self::apply_threat_transition(threat, ThreatStatus::Suppressed)?;
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::models::{ActionType, Priority, ThreatType};

    fn make_threat(resource: &str) -> ThreatEvent {
        ThreatEvent {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            source_rule: "Terminal shell in container".to_string(),
            priority: Priority::Warning,
            threat_type: ThreatType::ReverseShell,
            description: "shell spawned".to_string(),
            raw_fields: BTreeMap::new(),
            target_resource: resource.to_string(),
            anomaly_score: None,
            degraded_scoring: false,
            status: ThreatStatus::Received,
            linked_action_id: None,
            resolved_at: None,
        }
    }

    fn scored_with_action(
        store: &MemoryStore,
        resource: &str,
        action_type: ActionType,
    ) -> (ThreatEvent, RemediationAction) {
        let threat = make_threat(resource);
        store.insert_threat(&threat).unwrap();
        store.transition_threat(threat.id, ThreatStatus::Scored).unwrap();
        let action = RemediationAction::new(
            threat.id,
            resource.to_string(),
            action_type,
            0.8,
            false,
        );
        store.insert_action(&action).unwrap();
        (threat, action)
    }

    #[test]
    fn test_invalid_transition_preserves_state() {
        let store = MemoryStore::new();
        let threat = make_threat("pod-1");
        store.insert_threat(&threat).unwrap();

        let err = store
            .transition_threat(threat.id, ThreatStatus::Resolved)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let unchanged = store.get_threat(threat.id).unwrap().unwrap();
        assert_eq!(unchanged.status, ThreatStatus::Received);
        assert!(unchanged.resolved_at.is_none());
    }

    #[test]
    fn test_one_non_terminal_action_per_threat() {
        let store = MemoryStore::new();
        let (threat, _action) = scored_with_action(&store, "pod-1", ActionType::Alert);

        let second = RemediationAction::new(
            threat.id,
            "pod-1".to_string(),
            ActionType::Log,
            0.5,
            false,
        );
        let err = store.insert_action(&second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_lane_admits_one_executing_action() {
        let store = MemoryStore::new();
        let (_t1, a1) = scored_with_action(&store, "pod-3", ActionType::Alert);
        let (_t2, a2) = scored_with_action(&store, "pod-3", ActionType::Alert);

        let claimed = store.claim_next_action("pod-3").unwrap().unwrap();
        assert_eq!(claimed.id, a1.id);
        assert_eq!(claimed.status, ActionStatus::Executing);

        // Lane busy: second claim returns nothing, second action stays Pending
        assert!(store.claim_next_action("pod-3").unwrap().is_none());
        let held = store.get_action(a2.id).unwrap().unwrap();
        assert_eq!(held.status, ActionStatus::Pending);

        store
            .complete_action(a1.id, ActionStatus::Succeeded, Some("done".to_string()))
            .unwrap();

        let next = store.claim_next_action("pod-3").unwrap().unwrap();
        assert_eq!(next.id, a2.id);
    }

    #[test]
    fn test_distinct_resources_claim_in_parallel() {
        let store = MemoryStore::new();
        let (_t1, a1) = scored_with_action(&store, "pod-a", ActionType::Alert);
        let (_t2, a2) = scored_with_action(&store, "pod-b", ActionType::Alert);

        assert_eq!(store.claim_next_action("pod-a").unwrap().unwrap().id, a1.id);
        assert_eq!(store.claim_next_action("pod-b").unwrap().unwrap().id, a2.id);
    }

    #[test]
    fn test_claim_moves_threat_to_executing() {
        let store = MemoryStore::new();
        let (threat, _action) = scored_with_action(&store, "pod-1", ActionType::Alert);
        store.claim_next_action("pod-1").unwrap().unwrap();
        let threat = store.get_threat(threat.id).unwrap().unwrap();
        assert_eq!(threat.status, ThreatStatus::Executing);
    }

    #[test]
    fn test_rescoring_rejected_after_executing() {
        let store = MemoryStore::new();
        let (threat, _action) = scored_with_action(&store, "pod-1", ActionType::Alert);

        // Re-scoring while Scored is allowed
        store.record_scoring(threat.id, Some(0.4), false).unwrap();

        store.claim_next_action("pod-1").unwrap().unwrap();
        let err = store
            .record_scoring(threat.id, Some(0.9), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_sweep_expires_overdue_actions_once() {
        let store = MemoryStore::new();
        let (threat, action) = scored_with_action(&store, "pod-1", ActionType::Terminate);
        store.transition_threat(threat.id, ThreatStatus::AwaitingConfirmation).unwrap();
        store
            .hold_action(action.id, Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let expired = store.sweep_expired(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ActionStatus::Expired);

        let threat = store.get_threat(threat.id).unwrap().unwrap();
        assert_eq!(threat.status, ThreatStatus::Suppressed);

        // Second sweep finds nothing; late confirmation path sees a
        // terminal action.
        assert!(store.sweep_expired(Utc::now()).unwrap().is_empty());
        let err = store
            .transition_action(action.id, ActionStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_filters() {
        let store = MemoryStore::new();
        let (t1, _a1) = scored_with_action(&store, "pod-1", ActionType::Alert);
        let (_t2, _a2) = scored_with_action(&store, "pod-2", ActionType::Terminate);

        let filter = ThreatFilter {
            resource: Some("pod-1".to_string()),
            ..Default::default()
        };
        let threats = store.list_threats(&filter).unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].id, t1.id);

        let filter = ActionFilter {
            action_type: Some(ActionType::Terminate),
            ..Default::default()
        };
        let actions = store.list_actions(&filter).unwrap();
        assert_eq!(actions.len(), 1);
    }
}

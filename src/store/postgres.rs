//! PostgreSQL store backend
//!
//! Same contract as the in-process backend. Status transitions are applied
//! inside a transaction with the row locked, validated by the shared state
//! machine before the update, so an invalid transition never touches the
//! database. The per-resource lane is derived from the set of `executing`
//! rows for that resource.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{
    ActionFilter, ActionStatus, ActionType, Priority, RemediationAction, RiskTier, ThreatEvent,
    ThreatFilter, ThreatStatus, ThreatType,
};

use super::StoreError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS threats (
    id UUID PRIMARY KEY,
    received_at TIMESTAMPTZ NOT NULL,
    source_rule TEXT NOT NULL,
    priority VARCHAR(20) NOT NULL,
    threat_type VARCHAR(40) NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    raw_fields JSONB NOT NULL DEFAULT '{}'::jsonb,
    target_resource TEXT NOT NULL,
    anomaly_score DOUBLE PRECISION,
    degraded_scoring BOOLEAN NOT NULL DEFAULT false,
    status VARCHAR(30) NOT NULL,
    linked_action_id UUID,
    resolved_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS actions (
    id UUID PRIMARY KEY,
    threat_id UUID NOT NULL REFERENCES threats(id) ON DELETE CASCADE,
    target_resource TEXT NOT NULL,
    action_type VARCHAR(30) NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    risk_tier VARCHAR(10) NOT NULL,
    status VARCHAR(30) NOT NULL,
    degraded BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL,
    deadline TIMESTAMPTZ,
    resolved_at TIMESTAMPTZ,
    executor_note TEXT,
    attempts INT NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_threats_status ON threats(status);
CREATE INDEX IF NOT EXISTS idx_threats_resource ON threats(target_resource);
CREATE INDEX IF NOT EXISTS idx_threats_received ON threats(received_at);
CREATE INDEX IF NOT EXISTS idx_actions_threat ON actions(threat_id);
CREATE INDEX IF NOT EXISTS idx_actions_resource_status ON actions(target_resource, status);
CREATE INDEX IF NOT EXISTS idx_actions_deadline ON actions(deadline) WHERE deadline IS NOT NULL;
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply the schema. Errors here cause the caller to fall
    /// back to the in-process store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        tracing::info!("Database schema applied");
        Ok(Self { pool })
    }

    pub async fn insert_threat(&self, threat: &ThreatEvent) -> Result<(), StoreError> {
        let raw_fields = serde_json::to_value(&threat.raw_fields)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO threats (id, received_at, source_rule, priority, threat_type,
                                 description, raw_fields, target_resource, anomaly_score,
                                 degraded_scoring, status, linked_action_id, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(threat.id)
        .bind(threat.received_at)
        .bind(&threat.source_rule)
        .bind(threat.priority.as_str())
        .bind(threat.threat_type.as_str())
        .bind(&threat.description)
        .bind(raw_fields)
        .bind(&threat.target_resource)
        .bind(threat.anomaly_score)
        .bind(threat.degraded_scoring)
        .bind(threat.status.as_str())
        .bind(threat.linked_action_id)
        .bind(threat.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_threat(&self, id: Uuid) -> Result<Option<ThreatEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM threats WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| threat_from_row(&r)).transpose()
    }

    pub async fn list_threats(
        &self,
        filter: &ThreatFilter,
    ) -> Result<Vec<ThreatEvent>, StoreError> {
        // Filters are applied in-process after a bounded scan; volumes at
        // this boundary are modest.
        let rows = sqlx::query("SELECT * FROM threats ORDER BY received_at DESC LIMIT 1000")
            .fetch_all(&self.pool)
            .await?;
        let limit = filter.limit.unwrap_or(100);
        let mut threats = Vec::new();
        for row in rows {
            let threat = threat_from_row(&row)?;
            if filter.matches(&threat) {
                threats.push(threat);
                if threats.len() >= limit {
                    break;
                }
            }
        }
        Ok(threats)
    }

    pub async fn transition_threat(
        &self,
        id: Uuid,
        to: ThreatStatus,
    ) -> Result<ThreatEvent, StoreError> {
        let mut tx = self.pool.begin().await?;
        let threat = Self::transition_threat_tx(&mut tx, id, to).await?;
        tx.commit().await?;
        Ok(threat)
    }

    pub async fn record_scoring(
        &self,
        id: Uuid,
        anomaly_score: Option<f64>,
        degraded: bool,
    ) -> Result<ThreatEvent, StoreError> {
        let mut tx = self.pool.begin().await?;
        let threat = Self::lock_threat(&mut tx, id).await?;
        if !matches!(threat.status, ThreatStatus::Received | ThreatStatus::Scored) {
            return Err(StoreError::Conflict(format!(
                "threat {} is {} and can no longer be re-scored",
                id, threat.status
            )));
        }
        let row = sqlx::query(
            r#"
            UPDATE threats SET anomaly_score = $2, degraded_scoring = $3
            WHERE id = $1 RETURNING *
            "#,
        )
        .bind(id)
        .bind(anomaly_score)
        .bind(degraded)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        threat_from_row(&row)
    }

    pub async fn insert_action(&self, action: &RemediationAction) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let threat = Self::lock_threat(&mut tx, action.threat_id).await?;
        if let Some(existing_id) = threat.linked_action_id {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT status FROM actions WHERE id = $1")
                    .bind(existing_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(status) = existing {
                let status = parse_enum::<ActionStatus>(&status)?;
                if !status.is_terminal() {
                    return Err(StoreError::Conflict(format!(
                        "threat {} already has non-terminal action {}",
                        action.threat_id, existing_id
                    )));
                }
            }
        }
        sqlx::query(
            r#"
            INSERT INTO actions (id, threat_id, target_resource, action_type, confidence,
                                 risk_tier, status, degraded, created_at, deadline,
                                 resolved_at, executor_note, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(action.id)
        .bind(action.threat_id)
        .bind(&action.target_resource)
        .bind(action.action_type.as_str())
        .bind(action.confidence)
        .bind(action.risk_tier.as_str())
        .bind(action.status.as_str())
        .bind(action.degraded)
        .bind(action.created_at)
        .bind(action.deadline)
        .bind(action.resolved_at)
        .bind(&action.executor_note)
        .bind(action.attempts as i32)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE threats SET linked_action_id = $2 WHERE id = $1")
            .bind(action.threat_id)
            .bind(action.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_action(&self, id: Uuid) -> Result<Option<RemediationAction>, StoreError> {
        let row = sqlx::query("SELECT * FROM actions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| action_from_row(&r)).transpose()
    }

    pub async fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        let rows = sqlx::query("SELECT * FROM actions ORDER BY created_at DESC LIMIT 1000")
            .fetch_all(&self.pool)
            .await?;
        let limit = filter.limit.unwrap_or(100);
        let mut actions = Vec::new();
        for row in rows {
            let action = action_from_row(&row)?;
            if filter.matches(&action) {
                actions.push(action);
                if actions.len() >= limit {
                    break;
                }
            }
        }
        Ok(actions)
    }

    pub async fn transition_action(
        &self,
        id: Uuid,
        to: ActionStatus,
    ) -> Result<RemediationAction, StoreError> {
        let mut tx = self.pool.begin().await?;
        let action = Self::transition_action_tx(&mut tx, id, to).await?;
        tx.commit().await?;
        Ok(action)
    }

    pub async fn hold_action(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<RemediationAction, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::transition_action_tx(&mut tx, id, ActionStatus::AwaitingConfirmation).await?;
        let row = sqlx::query("UPDATE actions SET deadline = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(deadline)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        action_from_row(&row)
    }

    pub async fn complete_action(
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
        let mut tx = self.pool.begin().await?;
        Self::transition_action_tx(&mut tx, id, to).await?;
        let row = sqlx::query("UPDATE actions SET executor_note = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(&note)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        action_from_row(&row)
    }

    pub async fn increment_attempts(&self, id: Uuid) -> Result<u32, StoreError> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE actions SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "action", id })?;
        Ok(attempts as u32)
    }

    pub async fn claim_next_action(
        &self,
        resource: &str,
    ) -> Result<Option<RemediationAction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Lane busy when any action for the resource is executing.
        let busy: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM actions WHERE target_resource = $1 AND status = 'executing' FOR UPDATE",
        )
        .bind(resource)
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Ok(None);
        }
        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM actions
            WHERE target_resource = $1 AND status = 'pending'
            ORDER BY created_at ASC LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(resource)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(action_id) = candidate else {
            return Ok(None);
        };
        let action = Self::transition_action_tx(&mut tx, action_id, ActionStatus::Executing).await?;
        Self::transition_threat_tx(&mut tx, action.threat_id, ThreatStatus::Executing).await?;
        tx.commit().await?;
        Ok(Some(action))
    }

    pub async fn expire_if_overdue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RemediationAction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let action = Self::lock_action(&mut tx, id).await?;
        let overdue = action.status == ActionStatus::AwaitingConfirmation
            && action.deadline.map(|d| d <= now).unwrap_or(false);
        if !overdue {
            return Ok(None);
        }
        let action = Self::transition_action_tx(&mut tx, id, ActionStatus::Expired).await?;
        Self::transition_threat_tx(&mut tx, action.threat_id, ThreatStatus::Suppressed).await?;
        tx.commit().await?;
        Ok(Some(action))
    }

    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemediationAction>, StoreError> {
        let overdue: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM actions WHERE status = 'awaiting_confirmation' AND deadline <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let mut expired = Vec::new();
        for id in overdue {
            // Each expiry re-checks under its own transaction; a concurrent
            // confirmation wins cleanly.
            if let Some(action) = self.expire_if_overdue(id, now).await? {
                expired.push(action);
            }
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Transaction helpers
    // ------------------------------------------------------------------

    async fn lock_threat(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<ThreatEvent, StoreError> {
        let row = sqlx::query("SELECT * FROM threats WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound { entity: "threat", id })?;
        threat_from_row(&row)
    }

    async fn lock_action(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<RemediationAction, StoreError> {
        let row = sqlx::query("SELECT * FROM actions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound { entity: "action", id })?;
        action_from_row(&row)
    }

    async fn transition_threat_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        to: ThreatStatus,
    ) -> Result<ThreatEvent, StoreError> {
        let threat = Self::lock_threat(tx, id).await?;
        if !threat.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: "threat",
                from: threat.status.to_string(),
                to: to.to_string(),
            });
        }
        let resolved_at = to.is_terminal().then(Utc::now);
        let row = sqlx::query(
            r#"
            UPDATE threats SET status = $2, resolved_at = COALESCE($3, resolved_at)
            WHERE id = $1 RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(resolved_at)
        .fetch_one(&mut **tx)
        .await?;
        threat_from_row(&row)
    }

    async fn transition_action_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        to: ActionStatus,
    ) -> Result<RemediationAction, StoreError> {
        let action = Self::lock_action(tx, id).await?;
        let from = action.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: "action",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if to == ActionStatus::Executing {
            let occupant: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM actions WHERE target_resource = $1 AND status = 'executing' AND id <> $2",
            )
            .bind(&action.target_resource)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
            if let Some(occupant) = occupant {
                return Err(StoreError::Conflict(format!(
                    "resource lane {} busy with action {}",
                    action.target_resource, occupant
                )));
            }
        }
        let clear_deadline = from == ActionStatus::AwaitingConfirmation && to == ActionStatus::Pending;
        let resolved_at = to.is_terminal().then(Utc::now);
        let row = sqlx::query(
            r#"
            UPDATE actions
            SET status = $2,
                deadline = CASE WHEN $3 THEN NULL ELSE deadline END,
                resolved_at = COALESCE($4, resolved_at)
            WHERE id = $1 RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(clear_deadline)
        .bind(resolved_at)
        .fetch_one(&mut **tx)
        .await?;
        action_from_row(&row)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(StoreError::Backend)
}

fn threat_from_row(row: &PgRow) -> Result<ThreatEvent, StoreError> {
    let raw_fields: serde_json::Value = row.try_get("raw_fields")?;
    let raw_fields = serde_json::from_value(raw_fields)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(ThreatEvent {
        id: row.try_get("id")?,
        received_at: row.try_get("received_at")?,
        source_rule: row.try_get("source_rule")?,
        priority: parse_enum::<Priority>(row.try_get("priority")?)?,
        threat_type: parse_enum::<ThreatType>(row.try_get("threat_type")?)?,
        description: row.try_get("description")?,
        raw_fields,
        target_resource: row.try_get("target_resource")?,
        anomaly_score: row.try_get("anomaly_score")?,
        degraded_scoring: row.try_get("degraded_scoring")?,
        status: parse_enum::<ThreatStatus>(row.try_get("status")?)?,
        linked_action_id: row.try_get("linked_action_id")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn action_from_row(row: &PgRow) -> Result<RemediationAction, StoreError> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(RemediationAction {
        id: row.try_get("id")?,
        threat_id: row.try_get("threat_id")?,
        target_resource: row.try_get("target_resource")?,
        action_type: parse_enum::<ActionType>(row.try_get("action_type")?)?,
        confidence: row.try_get("confidence")?,
        risk_tier: parse_enum::<RiskTier>(row.try_get("risk_tier")?)?,
        status: parse_enum::<ActionStatus>(row.try_get("status")?)?,
        degraded: row.try_get("degraded")?,
        created_at: row.try_get("created_at")?,
        deadline: row.try_get("deadline")?,
        resolved_at: row.try_get("resolved_at")?,
        executor_note: row.try_get("executor_note")?,
        attempts: attempts as u32,
    })
}

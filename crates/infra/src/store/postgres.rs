//! Postgres-backed engine store.
//!
//! ## Claim safety
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! schedulers never wait on each other and never see the same candidate twice.
//! Every run insert happens inside its own savepoint: a uniqueness violation on
//! one candidate rolls back that candidate only and the pass continues.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (check constraint violation) | `23514` | `Domain(Validation)` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / other | N/A | `Storage` |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use forgejobs_core::{
    AuditAction, AuditLogEntry, CustomJob, DomainError, JobId, JobTrigger, MAX_RETENTION_DAYS, NewRun, NewTriggerEvent, Run, RunId,
    RunStatus, RunStep, StepStatus, TenantId, TriggerEvent, TriggerEventId, TriggerEventStatus, TriggerState,
    TriggerType, UserId,
};
use forgejobs_workflow::StepOutput;

use super::schema::SCHEMA_SQL;
use super::{EngineStore, RunCompletion, RunQuery, RunSort, StepUpdate, StoreError, StoreResult, settled_event_status};
use crate::manual::{ManualRun, check_cooldown, normalize_idempotency_key};
use crate::scheduler::{AdmissionTracker, DUPLICATE_TRIGGER_MESSAGE, STALE_RUN_MESSAGE};

const JOB_COLUMNS: &str = "id, tenant_id, name, description, workflow_key, enabled, trigger_type, day_of_week, \
     hour, minute, timezone, next_run_at, last_scheduled_at, trigger_source_type, trigger_source_config, \
     job_config, retention_days, created_by, created_at, updated_at";

const RUN_COLUMNS: &str = "id, custom_job_id, status, scheduled_for, trigger_event_id, idempotency_key, \
     created_at, started_at, finished_at, error_message, output_preview, metrics_json";

const STEP_COLUMNS: &str =
    "run_id, step_index, step_id, step_key, status, started_at, finished_at, error_message, output_json";

const EVENT_COLUMNS: &str = "id, custom_job_id, source_type, source_event_id, dedupe_key, dedupe_key_prefix, \
     event_time, payload_json, status, error_message, created_at, updated_at";

/// Postgres-backed engine store.
///
/// `Send + Sync`; share it behind an `Arc`. Every query that spans jobs filters
/// on `tenant_id`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Transaction<'_, Postgres>) -> StoreResult<()> {
    tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Insert a run inside a savepoint. `Ok(false)` when a uniqueness index rejected it.
async fn insert_run_in_savepoint(tx: &mut Transaction<'_, Postgres>, run: &Run) -> StoreResult<bool> {
    let mut savepoint = Acquire::begin(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin_savepoint", e))?;
    match insert_run_row(&mut savepoint, run).await {
        Ok(()) => {
            savepoint
                .commit()
                .await
                .map_err(|e| map_sqlx_error("release_savepoint", e))?;
            Ok(true)
        }
        Err(err) if is_unique_violation(&err) => {
            savepoint
                .rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_savepoint", e))?;
            Ok(false)
        }
        Err(err) => Err(map_sqlx_error("insert_run", err)),
    }
}

/// How one claimed slot ended inside its savepoint.
enum SlotOutcome {
    Claimed,
    Duplicate,
    /// Rolled back to the savepoint; the rest of the batch is unaffected.
    Failed(StoreError),
}

async fn rollback_savepoint(savepoint: Transaction<'_, Postgres>) -> StoreResult<()> {
    savepoint
        .rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback_savepoint", e))
}

async fn release_savepoint(savepoint: Transaction<'_, Postgres>) -> StoreResult<()> {
    savepoint
        .commit()
        .await
        .map_err(|e| map_sqlx_error("release_savepoint", e))
}

/// Insert the scheduled run and advance its job as one unit.
async fn claim_due_slot(
    tx: &mut Transaction<'_, Postgres>,
    job: &CustomJob,
    run: &Run,
    now: DateTime<Utc>,
) -> StoreResult<SlotOutcome> {
    let mut savepoint = Acquire::begin(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin_savepoint", e))?;
    match insert_run_in_savepoint(&mut savepoint, run).await {
        Ok(true) => {}
        Ok(false) => {
            rollback_savepoint(savepoint).await?;
            return Ok(SlotOutcome::Duplicate);
        }
        Err(err) => {
            rollback_savepoint(savepoint).await?;
            return Ok(SlotOutcome::Failed(err));
        }
    }
    let advanced = sqlx::query(
        "UPDATE custom_job SET last_scheduled_at = $2, next_run_at = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(job.id.as_uuid())
    .bind(job.last_scheduled_at)
    .bind(job.next_run_at)
    .bind(now)
    .execute(&mut *savepoint)
    .await;
    if let Err(err) = advanced {
        rollback_savepoint(savepoint).await?;
        return Ok(SlotOutcome::Failed(map_sqlx_error("advance_schedule", err)));
    }
    release_savepoint(savepoint).await?;
    Ok(SlotOutcome::Claimed)
}

/// Insert the event's run and settle the event as one unit. A duplicate run
/// drops the event.
async fn claim_event_slot(
    tx: &mut Transaction<'_, Postgres>,
    event_id: TriggerEventId,
    run: &Run,
    now: DateTime<Utc>,
) -> StoreResult<SlotOutcome> {
    let mut savepoint = Acquire::begin(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin_savepoint", e))?;
    let (outcome, status, error) = match insert_run_in_savepoint(&mut savepoint, run).await {
        Ok(true) => (SlotOutcome::Claimed, TriggerEventStatus::Enqueued, None),
        Ok(false) => (
            SlotOutcome::Duplicate,
            TriggerEventStatus::Dropped,
            Some(DUPLICATE_TRIGGER_MESSAGE),
        ),
        Err(err) => {
            rollback_savepoint(savepoint).await?;
            return Ok(SlotOutcome::Failed(err));
        }
    };
    let settled = sqlx::query(
        r#"
        UPDATE custom_job_trigger_event
        SET status = $2, error_message = COALESCE($3, error_message), updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(event_id.as_uuid())
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .execute(&mut *savepoint)
    .await;
    if let Err(err) = settled {
        rollback_savepoint(savepoint).await?;
        return Ok(SlotOutcome::Failed(map_sqlx_error("update_trigger_event", err)));
    }
    release_savepoint(savepoint).await?;
    Ok(outcome)
}

async fn insert_run_row(conn: &mut sqlx::PgConnection, run: &Run) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO custom_job_run (
            id, custom_job_id, status, scheduled_for, trigger_event_id, idempotency_key,
            created_at, started_at, finished_at, error_message, output_preview, metrics_json
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(run.id.as_uuid())
    .bind(run.job_id.as_uuid())
    .bind(run.status.as_str())
    .bind(run.scheduled_for)
    .bind(run.trigger_event_id.map(Uuid::from))
    .bind(&run.idempotency_key)
    .bind(run.created_at)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(&run.error_message)
    .bind(&run.output_preview)
    .bind(&run.metrics)
    .execute(conn)
    .await?;
    Ok(())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn order_clause(sort: RunSort) -> &'static str {
    match sort {
        RunSort::StartedAtDesc => "started_at DESC NULLS LAST, created_at DESC",
        RunSort::StartedAtAsc => "started_at ASC NULLS FIRST, created_at DESC",
        RunSort::CreatedAtDesc => "created_at DESC",
        RunSort::CreatedAtAsc => "created_at ASC",
    }
}

#[async_trait]
impl EngineStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn insert_job(&self, job: &CustomJob) -> StoreResult<()> {
        let cols = JobColumns::from(job);
        sqlx::query(
            r#"
            INSERT INTO custom_job (
                id, tenant_id, name, description, workflow_key, enabled, trigger_type, day_of_week,
                hour, minute, timezone, next_run_at, last_scheduled_at, trigger_source_type,
                trigger_source_config, job_config, retention_days, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.workflow_key)
        .bind(job.enabled)
        .bind(cols.trigger_type)
        .bind(cols.day_of_week)
        .bind(cols.hour)
        .bind(cols.minute)
        .bind(cols.timezone)
        .bind(job.next_run_at)
        .bind(job.last_scheduled_at)
        .bind(cols.source_type)
        .bind(cols.source_config)
        .bind(&job.job_config)
        .bind(cols.retention_days)
        .bind(job.created_by.map(Uuid::from))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn update_job(&self, job: &CustomJob) -> StoreResult<()> {
        let cols = JobColumns::from(job);
        let result = sqlx::query(
            r#"
            UPDATE custom_job SET
                name = $2, description = $3, workflow_key = $4, enabled = $5, trigger_type = $6,
                day_of_week = $7, hour = $8, minute = $9, timezone = $10, next_run_at = $11,
                last_scheduled_at = $12, trigger_source_type = $13, trigger_source_config = $14,
                job_config = $15, retention_days = $16, updated_at = $17
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.workflow_key)
        .bind(job.enabled)
        .bind(cols.trigger_type)
        .bind(cols.day_of_week)
        .bind(cols.hour)
        .bind(cols.minute)
        .bind(cols.timezone)
        .bind(job.next_run_at)
        .bind(job.last_scheduled_at)
        .bind(cols.source_type)
        .bind(cols.source_config)
        .bind(&job.job_config)
        .bind(cols.retention_days)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("custom job {}", job.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_job(&self, job_id: JobId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM custom_job WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<CustomJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM custom_job WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(CustomJob::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, tenant_id: TenantId, enabled: Option<bool>) -> StoreResult<Vec<CustomJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM custom_job \
             WHERE tenant_id = $1 AND ($2::boolean IS NULL OR enabled = $2) \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(enabled)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.into_iter().map(CustomJob::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_enabled_triggered_jobs(&self, tenant_id: TenantId) -> StoreResult<Vec<CustomJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM custom_job \
             WHERE tenant_id = $1 AND enabled = true AND trigger_type = 'TRIGGERED'"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_enabled_triggered_jobs", e))?;
        rows.into_iter().map(CustomJob::try_from).collect()
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, action = %entry.action), err)]
    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO custom_job_audit_log (id, custom_job_id, user_id, action, details_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id.as_uuid())
        .bind(entry.actor.map(Uuid::from))
        .bind(entry.action.as_str())
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_audit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_audit(&self, job_id: JobId) -> StoreResult<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, custom_job_id, user_id, action, details_json, created_at
            FROM custom_job_audit_log
            WHERE custom_job_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_audit", e))?;
        rows.into_iter().map(AuditLogEntry::try_from).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, claimed = tracing::field::Empty), err)]
    async fn claim_due_jobs(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>> {
        let mut tx = self.begin().await?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM custom_job \
             WHERE tenant_id = $1 AND enabled = true AND trigger_type IN ('DAILY', 'WEEKLY') \
               AND next_run_at IS NOT NULL AND next_run_at <= $2 \
             ORDER BY next_run_at ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(now)
            .bind(limit_param(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_due_jobs", e))?;

        let mut created = Vec::new();
        for row in rows {
            let job_id = row.id;
            let mut job = match CustomJob::try_from(row) {
                Ok(job) => job,
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "undecodable due job; skipping");
                    continue;
                }
            };
            let Some(scheduled_for) = job.next_run_at else {
                continue;
            };
            if let Err(e) = job.advance_schedule(scheduled_for) {
                warn!(job_id = %job.id, error = %e, "could not compute next run; leaving job unclaimed");
                continue;
            }

            let run = NewRun::scheduled(job.id, scheduled_for).into_run(now);
            match claim_due_slot(&mut tx, &job, &run, now).await? {
                SlotOutcome::Claimed => created.push(run),
                SlotOutcome::Duplicate => {}
                SlotOutcome::Failed(err) => {
                    warn!(job_id = %job.id, error = %err, "could not claim due slot; leaving job unclaimed");
                }
            }
        }

        commit(tx).await?;
        Span::current().record("claimed", created.len());
        Ok(created)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn claim_trigger_events(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>> {
        let mut tx = self.begin().await?;
        let candidates = sqlx::query(
            r#"
            SELECT e.id, e.custom_job_id
            FROM custom_job_trigger_event e
            JOIN custom_job j ON j.id = e.custom_job_id
            WHERE j.tenant_id = $1 AND j.enabled = true AND e.status = 'RECEIVED'
            ORDER BY e.event_time ASC NULLS FIRST
            LIMIT $2
            FOR UPDATE OF e SKIP LOCKED
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(limit_param(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_trigger_events", e))?;
        if candidates.is_empty() {
            commit(tx).await?;
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(candidates.len());
        for row in &candidates {
            let event_id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("decode_event", e))?;
            let job_id: Uuid = row.try_get("custom_job_id").map_err(|e| map_sqlx_error("decode_event", e))?;
            events.push((TriggerEventId::from(event_id), JobId::from(job_id)));
        }
        let mut job_ids: Vec<Uuid> = events.iter().map(|(_, j)| Uuid::from(*j)).collect();
        job_ids.sort();
        job_ids.dedup();

        let sql = format!("SELECT {JOB_COLUMNS} FROM custom_job WHERE id = ANY($1)");
        let jobs = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&job_ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_trigger_jobs", e))?
            .into_iter()
            .filter_map(|row| {
                let job_id = row.id;
                CustomJob::try_from(row)
                    .inspect_err(|err| warn!(job_id = %job_id, error = %err, "undecodable triggered job; skipping its events"))
                    .ok()
            })
            .collect::<Vec<_>>();
        let configs: HashMap<JobId, _> = jobs
            .iter()
            .map(|j| (j.id, j.trigger_source_config().cloned()))
            .collect();

        let active_rows = sqlx::query(
            r#"
            SELECT custom_job_id, COUNT(*) AS active
            FROM custom_job_run
            WHERE custom_job_id = ANY($1) AND status IN ('PENDING', 'STARTED')
            GROUP BY custom_job_id
            "#,
        )
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_active_runs", e))?;
        let mut active = HashMap::new();
        for row in active_rows {
            let job_id: Uuid = row.try_get("custom_job_id").map_err(|e| map_sqlx_error("decode_active", e))?;
            let count: i64 = row.try_get("active").map_err(|e| map_sqlx_error("decode_active", e))?;
            active.insert(JobId::from(job_id), u64::try_from(count).unwrap_or(0));
        }
        let mut tracker = AdmissionTracker::new(active);

        let mut created = Vec::new();
        for (event_id, job_id) in events {
            let Some(config) = configs.get(&job_id).cloned() else {
                continue;
            };
            if !tracker.admits(job_id, config.as_ref()) {
                continue;
            }
            let run = NewRun::for_event(job_id, event_id).into_run(now);
            match claim_event_slot(&mut tx, event_id, &run, now).await? {
                SlotOutcome::Claimed => {
                    tracker.record(job_id);
                    created.push(run);
                }
                SlotOutcome::Duplicate => {}
                SlotOutcome::Failed(err) => {
                    warn!(event_id = %event_id, error = %err, "could not claim trigger event; leaving it received");
                }
            }
        }

        commit(tx).await?;
        Ok(created)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn mark_stale_runs_failed(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE custom_job_run r
            SET status = 'FAILURE', finished_at = $3, error_message = $4
            FROM custom_job j
            WHERE j.id = r.custom_job_id AND j.tenant_id = $1
              AND r.status = 'STARTED' AND r.started_at < $2
            RETURNING r.trigger_event_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(started_before)
        .bind(now)
        .bind(STALE_RUN_MESSAGE)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_stale_runs_failed", e))?;

        let mut event_ids = Vec::new();
        for row in &rows {
            let event_id: Option<Uuid> = row
                .try_get("trigger_event_id")
                .map_err(|e| map_sqlx_error("decode_stale_run", e))?;
            event_ids.extend(event_id);
        }
        if !event_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE custom_job_trigger_event
                SET status = 'FAILED', error_message = $2, updated_at = $3
                WHERE id = ANY($1)
                "#,
            )
            .bind(&event_ids)
            .bind(STALE_RUN_MESSAGE)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("fail_stale_events", e))?;
        }

        commit(tx).await?;
        Ok(rows.len() as u64)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn delete_expired_history(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.begin().await?;
        let runs = sqlx::query(
            r#"
            DELETE FROM custom_job_run r
            USING custom_job j
            WHERE j.id = r.custom_job_id AND j.tenant_id = $1
              AND r.status IN ('SUCCESS', 'FAILURE', 'SKIPPED', 'TIMEOUT')
              AND j.retention_days BETWEEN 1 AND $3
              AND r.created_at < $2 - make_interval(days => j.retention_days)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(now)
        .bind(MAX_RETENTION_DAYS as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_expired_runs", e))?;

        let events = sqlx::query(
            r#"
            DELETE FROM custom_job_trigger_event e
            USING custom_job j
            WHERE j.id = e.custom_job_id AND j.tenant_id = $1
              AND e.status IN ('CONSUMED', 'DROPPED', 'FAILED')
              AND j.retention_days BETWEEN 1 AND $3
              AND e.created_at < $2 - make_interval(days => j.retention_days)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(now)
        .bind(MAX_RETENTION_DAYS as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_expired_events", e))?;

        commit(tx).await?;
        Ok(runs.rows_affected() + events.rows_affected())
    }

    #[instrument(skip(self, idempotency_key), fields(job_id = %job_id), err)]
    async fn create_manual_run(
        &self,
        job_id: JobId,
        idempotency_key: Option<&str>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ManualRun> {
        let key = normalize_idempotency_key(idempotency_key);
        let mut tx = self.begin().await?;

        // Serializes manual triggers per job so the cooldown check cannot race.
        let locked = sqlx::query("SELECT id FROM custom_job WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("custom job {job_id}")));
        }

        if let Some(key) = key.as_deref() {
            if let Some(run) = find_run_by_key(&mut tx, job_id, key).await? {
                commit(tx).await?;
                return Ok(ManualRun { run, created: false });
            }
        }

        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM custom_job_run WHERE custom_job_id = $1")
                .bind(job_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("latest_run", e))?;
        check_cooldown(latest, now, cooldown)?;

        let run = NewRun::manual(job_id, key.clone()).into_run(now);
        if insert_run_in_savepoint(&mut tx, &run).await? {
            commit(tx).await?;
            return Ok(ManualRun { run, created: true });
        }
        let existing = match key.as_deref() {
            Some(key) => find_run_by_key(&mut tx, job_id, key).await?,
            None => None,
        };
        commit(tx).await?;
        existing
            .map(|run| ManualRun { run, created: false })
            .ok_or_else(|| StoreError::Conflict(format!("duplicate manual run for job {job_id}")))
    }

    #[instrument(skip(self, event), fields(job_id = %event.job_id, dedupe_key = %event.dedupe_key), err)]
    async fn create_trigger_event(&self, event: NewTriggerEvent, now: DateTime<Utc>) -> StoreResult<Option<TriggerEvent>> {
        let event = event.into_event(now);
        let sql = format!(
            "INSERT INTO custom_job_trigger_event ( \
                 id, custom_job_id, source_type, source_event_id, dedupe_key, dedupe_key_prefix, \
                 event_time, payload_json, status, error_message, created_at, updated_at \
             ) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, $10, $10) \
             ON CONFLICT (custom_job_id, dedupe_key) DO NOTHING \
             RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event.id.as_uuid())
            .bind(event.job_id.as_uuid())
            .bind(&event.source_type)
            .bind(&event.source_event_id)
            .bind(&event.dedupe_key)
            .bind(&event.dedupe_key_prefix)
            .bind(event.event_time)
            .bind(&event.payload)
            .bind(event.status.as_str())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_trigger_event", e))?;
        row.map(TriggerEvent::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get_trigger_event(&self, event_id: TriggerEventId) -> StoreResult<Option<TriggerEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM custom_job_trigger_event WHERE id = $1");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_trigger_event", e))?;
        row.map(TriggerEvent::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_or_create_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState> {
        sqlx::query(
            r#"
            INSERT INTO custom_job_trigger_state (custom_job_id, source_key, cursor_json, updated_at)
            VALUES ($1, $2, NULL, $3)
            ON CONFLICT (custom_job_id, source_key) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(source_key)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_trigger_state", e))?;

        let row = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT custom_job_id, source_key, cursor_json, updated_at
            FROM custom_job_trigger_state
            WHERE custom_job_id = $1 AND source_key = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(source_key)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_trigger_state", e))?;
        Ok(row.into())
    }

    #[instrument(skip(self, cursor), err)]
    async fn save_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        cursor: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState> {
        let row = sqlx::query_as::<_, StateRow>(
            r#"
            INSERT INTO custom_job_trigger_state (custom_job_id, source_key, cursor_json, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (custom_job_id, source_key)
            DO UPDATE SET cursor_json = EXCLUDED.cursor_json, updated_at = EXCLUDED.updated_at
            RETURNING custom_job_id, source_key, cursor_json, updated_at
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(source_key)
        .bind(&cursor)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_trigger_state", e))?;
        Ok(row.into())
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, job_id = %run.job_id), err)]
    async fn insert_run(&self, run: &Run) -> StoreResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        insert_run_row(&mut conn, run)
            .await
            .map_err(|e| map_sqlx_error("insert_run", e))
    }

    #[instrument(skip(self), err)]
    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM custom_job_run WHERE id = $1");
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_run", e))?;
        row.map(Run::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn transition_run_to_started(&self, run_id: RunId, now: DateTime<Utc>) -> StoreResult<Option<Run>> {
        let sql = format!(
            "UPDATE custom_job_run SET status = 'STARTED', started_at = $2 \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition_run_to_started", e))?;
        row.map(Run::try_from).transpose()
    }

    #[instrument(skip(self, completion), fields(status = %completion.status), err)]
    async fn finish_run(&self, run_id: RunId, completion: RunCompletion, now: DateTime<Utc>) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE custom_job_run
            SET status = $2, finished_at = $3, error_message = $4, output_preview = $5, metrics_json = $6
            WHERE id = $1
            RETURNING trigger_event_id
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(completion.status.as_str())
        .bind(now)
        .bind(&completion.error_message)
        .bind(&completion.output_preview)
        .bind(&completion.metrics)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finish_run", e))?
        .ok_or_else(|| StoreError::NotFound(format!("custom job run {run_id}")))?;

        let event_id: Option<Uuid> = row
            .try_get("trigger_event_id")
            .map_err(|e| map_sqlx_error("decode_finished_run", e))?;
        if let (Some(event_id), Some(status)) = (event_id, settled_event_status(completion.status)) {
            let error = (status == TriggerEventStatus::Failed)
                .then_some(completion.error_message.as_deref())
                .flatten();
            sqlx::query(
                r#"
                UPDATE custom_job_trigger_event
                SET status = $2,
                    error_message = CASE WHEN $2 = 'FAILED' THEN $3 ELSE error_message END,
                    updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(event_id)
            .bind(status.as_str())
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("settle_trigger_event", e))?;
        }

        commit(tx).await
    }

    #[instrument(skip(self, update), fields(run_id = %update.run_id, step_id = %update.step_id, status = %update.status), err)]
    async fn upsert_run_step(&self, update: StepUpdate, now: DateTime<Utc>) -> StoreResult<RunStep> {
        let started_at = update.mark_started.then_some(now);
        let finished_at = update.status.is_terminal().then_some(now);
        let sql = format!(
            "INSERT INTO custom_job_run_step ( \
                 id, run_id, step_index, step_id, step_key, status, started_at, finished_at, error_message, output_json \
             ) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (run_id, step_id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 started_at = COALESCE(custom_job_run_step.started_at, EXCLUDED.started_at), \
                 finished_at = COALESCE(EXCLUDED.finished_at, custom_job_run_step.finished_at), \
                 error_message = EXCLUDED.error_message, \
                 output_json = EXCLUDED.output_json \
             RETURNING {STEP_COLUMNS}"
        );
        let row = sqlx::query_as::<_, StepRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(update.run_id.as_uuid())
            .bind(i32::try_from(update.step_index).unwrap_or(i32::MAX))
            .bind(&update.step_id)
            .bind(&update.step_key)
            .bind(update.status.as_str())
            .bind(started_at)
            .bind(finished_at)
            .bind(&update.error_message)
            .bind(&update.output)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_run_step", e))?;
        RunStep::try_from(row)
    }

    #[instrument(skip(self), err)]
    async fn completed_step_outputs(&self, run_id: RunId) -> StoreResult<BTreeMap<String, StepOutput>> {
        let rows = sqlx::query(
            r#"
            SELECT step_id, output_json
            FROM custom_job_run_step
            WHERE run_id = $1 AND status = 'SUCCESS' AND output_json IS NOT NULL
            ORDER BY step_index ASC
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("completed_step_outputs", e))?;

        let mut outputs = BTreeMap::new();
        for row in rows {
            let step_id: String = row.try_get("step_id").map_err(|e| map_sqlx_error("decode_step", e))?;
            let output: JsonValue = row.try_get("output_json").map_err(|e| map_sqlx_error("decode_step", e))?;
            if let JsonValue::Object(map) = output {
                outputs.insert(step_id, map);
            }
        }
        Ok(outputs)
    }

    #[instrument(skip(self, query), fields(page = query.page, sort = query.sort.as_str()), err)]
    async fn list_runs(&self, job_id: JobId, query: &RunQuery) -> StoreResult<(Vec<Run>, u64)> {
        const FILTER: &str = "custom_job_id = $1 \
             AND ($2::text IS NULL OR status = $2) \
             AND ($3::timestamptz IS NULL OR started_at >= $3) \
             AND ($4::timestamptz IS NULL OR started_at <= $4)";
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM custom_job_run WHERE {FILTER}"))
            .bind(job_id.as_uuid())
            .bind(status)
            .bind(query.started_after)
            .bind(query.started_before)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_runs", e))?;

        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM custom_job_run WHERE {FILTER} ORDER BY {} LIMIT $5 OFFSET $6",
            order_clause(query.sort)
        );
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(status)
            .bind(query.started_after)
            .bind(query.started_before)
            .bind(i64::from(query.page_size))
            .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_runs", e))?;
        let runs = rows.into_iter().map(Run::try_from).collect::<StoreResult<Vec<_>>>()?;
        Ok((runs, u64::try_from(total).unwrap_or(0)))
    }

    #[instrument(skip(self), err)]
    async fn list_run_steps(&self, run_id: RunId, page: u32, page_size: u32) -> StoreResult<(Vec<RunStep>, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM custom_job_run_step WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_run_steps", e))?;

        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM custom_job_run_step WHERE run_id = $1 \
             ORDER BY step_index ASC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, StepRow>(&sql)
            .bind(run_id.as_uuid())
            .bind(i64::from(page_size))
            .bind(i64::from(page) * i64::from(page_size))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_run_steps", e))?;
        let steps = rows.into_iter().map(RunStep::try_from).collect::<StoreResult<Vec<_>>>()?;
        Ok((steps, u64::try_from(total).unwrap_or(0)))
    }
}

async fn find_run_by_key(tx: &mut Transaction<'_, Postgres>, job_id: JobId, key: &str) -> StoreResult<Option<Run>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM custom_job_run WHERE custom_job_id = $1 AND idempotency_key = $2");
    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(job_id.as_uuid())
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("find_run_by_key", e))?;
    row.map(Run::try_from).transpose()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("23514") => StoreError::Domain(DomainError::validation(msg)),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::RowNotFound => StoreError::Storage(format!("unexpected row not found in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_error(what: &str, err: DomainError) -> StoreError {
    StoreError::Storage(format!("failed to decode {what} row: {}", err.message()))
}

// SQLx row types

/// Trigger columns flattened for binding.
struct JobColumns {
    trigger_type: &'static str,
    day_of_week: Option<i32>,
    hour: Option<i32>,
    minute: Option<i32>,
    timezone: Option<&'static str>,
    source_type: Option<String>,
    source_config: Option<JsonValue>,
    retention_days: i32,
}

impl From<&CustomJob> for JobColumns {
    fn from(job: &CustomJob) -> Self {
        let retention_days = i32::try_from(job.retention_days).unwrap_or(i32::MAX);
        match &job.trigger {
            JobTrigger::Scheduled(spec) => Self {
                trigger_type: spec.trigger_type().as_str(),
                day_of_week: spec.day_of_week_index(),
                hour: i32::try_from(spec.hour).ok(),
                minute: i32::try_from(spec.minute).ok(),
                timezone: Some(spec.timezone.name()),
                source_type: None,
                source_config: None,
                retention_days,
            },
            JobTrigger::Triggered {
                source_type,
                source_config,
            } => Self {
                trigger_type: TriggerType::Triggered.as_str(),
                day_of_week: None,
                hour: None,
                minute: None,
                timezone: None,
                source_type: source_type.clone(),
                source_config: Some(source_config.to_value()),
                retention_days,
            },
        }
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
    workflow_key: String,
    enabled: bool,
    trigger_type: String,
    day_of_week: Option<i32>,
    hour: Option<i32>,
    minute: Option<i32>,
    timezone: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    last_scheduled_at: Option<DateTime<Utc>>,
    trigger_source_type: Option<String>,
    trigger_source_config: Option<JsonValue>,
    job_config: JsonValue,
    retention_days: i32,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            workflow_key: row.try_get("workflow_key")?,
            enabled: row.try_get("enabled")?,
            trigger_type: row.try_get("trigger_type")?,
            day_of_week: row.try_get("day_of_week")?,
            hour: row.try_get("hour")?,
            minute: row.try_get("minute")?,
            timezone: row.try_get("timezone")?,
            next_run_at: row.try_get("next_run_at")?,
            last_scheduled_at: row.try_get("last_scheduled_at")?,
            trigger_source_type: row.try_get("trigger_source_type")?,
            trigger_source_config: row.try_get("trigger_source_config")?,
            job_config: row.try_get("job_config")?,
            retention_days: row.try_get("retention_days")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for CustomJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let trigger_type: TriggerType = row.trigger_type.parse().map_err(|e| decode_error("custom_job", e))?;
        let trigger = JobTrigger::from_fields(
            trigger_type,
            row.timezone.as_deref(),
            row.hour,
            row.minute,
            row.day_of_week,
            row.trigger_source_type,
            row.trigger_source_config.as_ref(),
        )
        .map_err(|e| decode_error("custom_job", e))?;
        Ok(CustomJob {
            id: JobId::from(row.id),
            tenant_id: TenantId::from(row.tenant_id),
            name: row.name,
            description: row.description,
            workflow_key: row.workflow_key,
            job_config: row.job_config,
            enabled: row.enabled,
            trigger,
            next_run_at: row.next_run_at,
            last_scheduled_at: row.last_scheduled_at,
            retention_days: u32::try_from(row.retention_days).unwrap_or(1),
            created_by: row.created_by.map(UserId::from),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct RunRow {
    id: Uuid,
    custom_job_id: Uuid,
    status: String,
    scheduled_for: Option<DateTime<Utc>>,
    trigger_event_id: Option<Uuid>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    output_preview: Option<String>,
    metrics_json: Option<JsonValue>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RunRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            id: row.try_get("id")?,
            custom_job_id: row.try_get("custom_job_id")?,
            status: row.try_get("status")?,
            scheduled_for: row.try_get("scheduled_for")?,
            trigger_event_id: row.try_get("trigger_event_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error_message: row.try_get("error_message")?,
            output_preview: row.try_get("output_preview")?,
            metrics_json: row.try_get("metrics_json")?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row.status.parse().map_err(|e| decode_error("custom_job_run", e))?;
        Ok(Run {
            id: RunId::from(row.id),
            job_id: JobId::from(row.custom_job_id),
            status,
            scheduled_for: row.scheduled_for,
            trigger_event_id: row.trigger_event_id.map(TriggerEventId::from),
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            output_preview: row.output_preview,
            metrics: row.metrics_json,
        })
    }
}

#[derive(Debug)]
struct StepRow {
    run_id: Uuid,
    step_index: i32,
    step_id: String,
    step_key: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    output_json: Option<JsonValue>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StepRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StepRow {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            step_id: row.try_get("step_id")?,
            step_key: row.try_get("step_key")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error_message: row.try_get("error_message")?,
            output_json: row.try_get("output_json")?,
        })
    }
}

impl TryFrom<StepRow> for RunStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status: StepStatus = row.status.parse().map_err(|e| decode_error("custom_job_run_step", e))?;
        Ok(RunStep {
            run_id: RunId::from(row.run_id),
            step_index: u32::try_from(row.step_index).unwrap_or(0),
            step_id: row.step_id,
            step_key: row.step_key,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            output: row.output_json,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    custom_job_id: Uuid,
    source_type: String,
    source_event_id: Option<String>,
    dedupe_key: String,
    dedupe_key_prefix: Option<String>,
    event_time: Option<DateTime<Utc>>,
    payload_json: Option<JsonValue>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            custom_job_id: row.try_get("custom_job_id")?,
            source_type: row.try_get("source_type")?,
            source_event_id: row.try_get("source_event_id")?,
            dedupe_key: row.try_get("dedupe_key")?,
            dedupe_key_prefix: row.try_get("dedupe_key_prefix")?,
            event_time: row.try_get("event_time")?,
            payload_json: row.try_get("payload_json")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<EventRow> for TriggerEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let status: TriggerEventStatus = row
            .status
            .parse()
            .map_err(|e| decode_error("custom_job_trigger_event", e))?;
        Ok(TriggerEvent {
            id: TriggerEventId::from(row.id),
            job_id: JobId::from(row.custom_job_id),
            source_type: row.source_type,
            source_event_id: row.source_event_id,
            dedupe_key: row.dedupe_key,
            dedupe_key_prefix: row.dedupe_key_prefix,
            event_time: row.event_time,
            payload: row.payload_json,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct StateRow {
    custom_job_id: Uuid,
    source_key: String,
    cursor_json: Option<JsonValue>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StateRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StateRow {
            custom_job_id: row.try_get("custom_job_id")?,
            source_key: row.try_get("source_key")?,
            cursor_json: row.try_get("cursor_json")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<StateRow> for TriggerState {
    fn from(row: StateRow) -> Self {
        TriggerState {
            job_id: JobId::from(row.custom_job_id),
            source_key: row.source_key,
            cursor: row.cursor_json,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct AuditRow {
    id: Uuid,
    custom_job_id: Uuid,
    user_id: Option<Uuid>,
    action: String,
    details_json: Option<JsonValue>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AuditRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuditRow {
            id: row.try_get("id")?,
            custom_job_id: row.try_get("custom_job_id")?,
            user_id: row.try_get("user_id")?,
            action: row.try_get("action")?,
            details_json: row.try_get("details_json")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action: AuditAction = row.action.parse().map_err(|e| decode_error("custom_job_audit_log", e))?;
        Ok(AuditLogEntry {
            id: row.id,
            job_id: JobId::from(row.custom_job_id),
            actor: row.user_id.map(UserId::from),
            action,
            details: row.details_json,
            created_at: row.created_at,
        })
    }
}

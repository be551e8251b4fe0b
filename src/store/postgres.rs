//! PostgreSQL [`EngineStore`] backed by a sqlx pool.
//!
//! Each [`EngineStore::commit`] runs in one SQL transaction. Row updates are
//! read `FOR UPDATE`, applied in Rust and written back whole, so the memory
//! and PostgreSQL stores share the same update semantics.

use super::traits::EngineStore;
use super::transaction::StoreWrite;
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    BatchItemOutcome, BatchTaskRun, BatchTaskRunItem, BlockingWaitpoint, CompletedWaitpointRef,
    ExecutionSnapshot, TaskRun, TaskRunStatus, TaskRunWaitpoint, Waitpoint,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, friendly_id, task_identifier, queue, concurrency_key, master_queue, \
    status, attempt_number, max_attempts, retry_options, machine_preset, payload, payload_type, \
    output, output_type, error, metadata, runtime_environment_id, environment_type, project_id, \
    organization_id, parent_task_run_id, root_task_run_id, depth, batch_id, batch_index, \
    resume_parent_on_completion, associated_waitpoint_id, ttl_ms, delay_until, debounce_key, \
    priority_ms, queue_timestamp, latest_snapshot_id, created_at, updated_at, started_at, \
    executed_at, completed_at, expired_at";

const SNAPSHOT_COLUMNS: &str = "id, run_id, execution_status, description, run_status, \
    attempt_number, previous_snapshot_id, environment_id, environment_type, project_id, \
    organization_id, completed_waitpoints, batch_id, worker_id, runner_id, error, created_at";

const WAITPOINT_COLUMNS: &str = "id, friendly_id, kind, status, idempotency_key, \
    user_provided_idempotency_key, output, output_type, output_is_error, completed_by_task_run_id, \
    completed_by_batch_id, completed_after, completed_at, project_id, environment_id, created_at";

const BATCH_COLUMNS: &str = "id, friendly_id, status, run_count, processed_count, \
    successful_run_count, failed_run_count, run_ids, parent_run_id, resume_parent_on_completion, \
    waitpoint_id, runtime_environment_id, project_id, organization_id, sealed_at, completed_at, \
    created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgEngineStore {
    pool: PgPool,
}

impl PgEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> EngineResult<Self> {
        let url = config.database_url().ok_or_else(|| {
            EngineError::Configuration(
                "database.url or DATABASE_URL must be set for the PostgreSQL store".to_string(),
            )
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&url)
            .await?;

        info!(max_connections = config.max_connections, "Connected PostgreSQL engine store");
        Ok(Self { pool })
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply(&self, tx: &mut Transaction<'_, Postgres>, write: StoreWrite) -> EngineResult<()> {
        let now = Utc::now();
        match write {
            StoreWrite::InsertRun(run) => insert_run(tx, &run).await,
            StoreWrite::UpdateRun { run_id, update } => {
                let sql = format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = $1 FOR UPDATE");
                let row = sqlx::query(&sql)
                    .bind(run_id)
                    .fetch_optional(&mut **tx)
                    .await?
                    .ok_or(EngineError::RunNotFound { run_id })?;
                let mut run = run_from_row(&row)?;
                update.apply_to(&mut run, now);
                write_run(tx, &run).await
            }
            StoreWrite::InsertSnapshot(snapshot) => {
                let row = sqlx::query("SELECT latest_snapshot_id FROM task_runs WHERE id = $1 FOR UPDATE")
                    .bind(snapshot.run_id)
                    .fetch_optional(&mut **tx)
                    .await?
                    .ok_or(EngineError::RunNotFound {
                        run_id: snapshot.run_id,
                    })?;
                let latest: Option<Uuid> = row.try_get("latest_snapshot_id")?;
                if latest != snapshot.previous_snapshot_id {
                    return Err(EngineError::snapshot_conflict(
                        snapshot.run_id,
                        snapshot.previous_snapshot_id.unwrap_or(Uuid::nil()),
                        latest.unwrap_or(Uuid::nil()),
                    ));
                }
                insert_snapshot(tx, &snapshot).await?;
                sqlx::query("UPDATE task_runs SET latest_snapshot_id = $2, updated_at = $3 WHERE id = $1")
                    .bind(snapshot.run_id)
                    .bind(snapshot.id)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;
                Ok(())
            }
            StoreWrite::InsertWaitpoint(waitpoint) => insert_waitpoint(tx, &waitpoint).await,
            StoreWrite::CompleteWaitpoint {
                waitpoint_id,
                output,
                completed_at,
            } => {
                let result = sqlx::query(
                    "UPDATE waitpoints SET status = 'COMPLETED', output = $2, \
                     output_type = COALESCE($3, output_type), output_is_error = $4, completed_at = $5 \
                     WHERE id = $1 AND status = 'PENDING'",
                )
                .bind(waitpoint_id)
                .bind(&output.value)
                .bind(&output.output_type)
                .bind(output.is_error)
                .bind(completed_at)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    let exists = sqlx::query("SELECT 1 FROM waitpoints WHERE id = $1")
                        .bind(waitpoint_id)
                        .fetch_optional(&mut **tx)
                        .await?;
                    if exists.is_none() {
                        return Err(EngineError::WaitpointNotFound { waitpoint_id });
                    }
                }
                Ok(())
            }
            StoreWrite::InsertBlockers(relations) => {
                for relation in relations {
                    sqlx::query(
                        "INSERT INTO task_run_waitpoints \
                         (id, task_run_id, waitpoint_id, project_id, batch_id, batch_index, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) \
                         ON CONFLICT (task_run_id, waitpoint_id, (COALESCE(batch_index, -1))) DO NOTHING",
                    )
                    .bind(relation.id)
                    .bind(relation.task_run_id)
                    .bind(relation.waitpoint_id)
                    .bind(relation.project_id)
                    .bind(relation.batch_id)
                    .bind(relation.batch_index.map(|i| i as i32))
                    .bind(relation.created_at)
                    .execute(&mut **tx)
                    .await?;
                }
                Ok(())
            }
            StoreWrite::DeleteBlockers { run_id } => {
                sqlx::query("DELETE FROM task_run_waitpoints WHERE task_run_id = $1")
                    .bind(run_id)
                    .execute(&mut **tx)
                    .await?;
                Ok(())
            }
            StoreWrite::InsertBatch(batch) => insert_batch(tx, &batch).await,
            StoreWrite::UpdateBatch { batch_id, update } => {
                let sql = format!("SELECT {BATCH_COLUMNS} FROM batch_task_runs WHERE id = $1 FOR UPDATE");
                let row = sqlx::query(&sql)
                    .bind(batch_id)
                    .fetch_optional(&mut **tx)
                    .await?
                    .ok_or(EngineError::BatchNotFound { batch_id })?;
                let mut batch = batch_from_row(&row)?;
                update.apply_to(&mut batch, now);
                sqlx::query(
                    "UPDATE batch_task_runs SET status = $2, successful_run_count = $3, \
                     failed_run_count = $4, sealed_at = $5, completed_at = $6, updated_at = $7 \
                     WHERE id = $1",
                )
                .bind(batch.id)
                .bind(batch.status.as_str())
                .bind(batch.successful_run_count as i32)
                .bind(batch.failed_run_count as i32)
                .bind(batch.sealed_at)
                .bind(batch.completed_at)
                .bind(batch.updated_at)
                .execute(&mut **tx)
                .await?;
                Ok(())
            }
            StoreWrite::RecordBatchItem(item) => {
                let exists = sqlx::query("SELECT 1 FROM batch_task_runs WHERE id = $1 FOR UPDATE")
                    .bind(item.batch_id)
                    .fetch_optional(&mut **tx)
                    .await?;
                if exists.is_none() {
                    return Err(EngineError::BatchNotFound {
                        batch_id: item.batch_id,
                    });
                }

                let inserted = sqlx::query(
                    "INSERT INTO batch_task_run_items (batch_id, item_index, outcome, created_at) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT (batch_id, item_index) DO NOTHING",
                )
                .bind(item.batch_id)
                .bind(item.index as i32)
                .bind(serde_json::to_value(&item.outcome)?)
                .bind(item.created_at)
                .execute(&mut **tx)
                .await?;
                if inserted.rows_affected() == 0 {
                    return Ok(());
                }

                let (succeeded, failed) = match item.outcome {
                    BatchItemOutcome::Triggered { .. } => (1, 0),
                    BatchItemOutcome::Failed { .. } => (0, 1),
                };
                sqlx::query(
                    "UPDATE batch_task_runs SET processed_count = processed_count + 1, \
                     successful_run_count = successful_run_count + $2, \
                     failed_run_count = failed_run_count + $3, \
                     run_ids = CASE WHEN $4::uuid IS NULL THEN run_ids ELSE array_append(run_ids, $4::uuid) END, \
                     updated_at = $5 WHERE id = $1",
                )
                .bind(item.batch_id)
                .bind(succeeded)
                .bind(failed)
                .bind(item.run_id())
                .bind(now)
                .execute(&mut **tx)
                .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EngineStore for PgEngineStore {
    async fn find_run(&self, run_id: Uuid) -> EngineResult<Option<TaskRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn find_latest_snapshot(&self, run_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        let sql = format!(
            "SELECT s.{} FROM execution_snapshots s \
             JOIN task_runs r ON r.latest_snapshot_id = s.id WHERE r.id = $1",
            SNAPSHOT_COLUMNS.replace(", ", ", s.")
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, run_id: Uuid) -> EngineResult<Vec<ExecutionSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM execution_snapshots WHERE run_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn find_waitpoint(&self, waitpoint_id: Uuid) -> EngineResult<Option<Waitpoint>> {
        let sql = format!("SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(waitpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(waitpoint_from_row).transpose()
    }

    async fn find_waitpoints(&self, waitpoint_ids: &[Uuid]) -> EngineResult<Vec<Waitpoint>> {
        let sql = format!("SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(waitpoint_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(waitpoint_from_row).collect()
    }

    async fn find_waitpoint_by_idempotency_key(
        &self,
        environment_id: Uuid,
        idempotency_key: &str,
    ) -> EngineResult<Option<Waitpoint>> {
        let sql = format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE environment_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(environment_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(waitpoint_from_row).transpose()
    }

    async fn find_blocking_waitpoints(&self, run_id: Uuid) -> EngineResult<Vec<BlockingWaitpoint>> {
        let rows = sqlx::query(
            "SELECT id, task_run_id, waitpoint_id, project_id, batch_id, batch_index, created_at \
             FROM task_run_waitpoints WHERE task_run_id = $1 ORDER BY created_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let relations = rows
            .iter()
            .map(relation_from_row)
            .collect::<EngineResult<Vec<_>>>()?;

        let ids: Vec<Uuid> = relations.iter().map(|r| r.waitpoint_id).collect();
        let waitpoints = self.find_waitpoints(&ids).await?;
        Ok(relations
            .into_iter()
            .filter_map(|relation| {
                waitpoints
                    .iter()
                    .find(|w| w.id == relation.waitpoint_id)
                    .cloned()
                    .map(|waitpoint| BlockingWaitpoint {
                        relation,
                        waitpoint,
                    })
            })
            .collect())
    }

    async fn find_runs_blocked_by(&self, waitpoint_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT task_run_id FROM task_run_waitpoints WHERE waitpoint_id = $1",
        )
        .bind(waitpoint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("task_run_id").map_err(EngineError::from))
            .collect()
    }

    async fn find_child_runs(&self, parent_run_id: Uuid) -> EngineResult<Vec<TaskRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE parent_task_run_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn find_batch(&self, batch_id: Uuid) -> EngineResult<Option<BatchTaskRun>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batch_task_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batch_items(&self, batch_id: Uuid) -> EngineResult<Vec<BatchTaskRunItem>> {
        let rows = sqlx::query(
            "SELECT batch_id, item_index, outcome, created_at FROM batch_task_run_items \
             WHERE batch_id = $1 ORDER BY item_index",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> EngineResult<BatchTaskRunItem> {
                Ok(BatchTaskRunItem {
                    batch_id: row.try_get("batch_id")?,
                    index: row.try_get::<i32, _>("item_index")? as u32,
                    outcome: serde_json::from_value(row.try_get("outcome")?)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn find_debounced_run(
        &self,
        environment_id: Uuid,
        task_identifier: &str,
        debounce_key: &str,
    ) -> EngineResult<Option<TaskRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE runtime_environment_id = $1 \
             AND task_identifier = $2 AND debounce_key = $3 AND status = $4 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(environment_id)
            .bind(task_identifier)
            .bind(debounce_key)
            .bind(TaskRunStatus::Delayed.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> EngineResult<()> {
        let count = writes.len();
        let mut tx = self.pool.begin().await?;
        for write in writes {
            // Dropping the transaction on error rolls it back.
            self.apply(&mut tx, write).await?;
        }
        tx.commit().await?;
        debug!(writes = count, "Committed PostgreSQL store transaction");
        Ok(())
    }
}

fn parse_column<T: FromStr<Err = String>>(value: &str) -> EngineResult<T> {
    T::from_str(value).map_err(EngineError::Database)
}

fn opt_u32(value: Option<i32>) -> Option<u32> {
    value.map(|v| v as u32)
}

fn opt_json<T: serde::de::DeserializeOwned>(value: Option<serde_json::Value>) -> EngineResult<Option<T>> {
    value.map(serde_json::from_value).transpose().map_err(EngineError::from)
}

fn run_from_row(row: &PgRow) -> EngineResult<TaskRun> {
    Ok(TaskRun {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        task_identifier: row.try_get("task_identifier")?,
        queue: row.try_get("queue")?,
        concurrency_key: row.try_get("concurrency_key")?,
        master_queue: row.try_get("master_queue")?,
        status: parse_column(row.try_get::<&str, _>("status")?)?,
        attempt_number: row.try_get::<i32, _>("attempt_number")? as u32,
        max_attempts: opt_u32(row.try_get("max_attempts")?),
        retry_options: opt_json(row.try_get("retry_options")?)?,
        machine_preset: row.try_get("machine_preset")?,
        payload: row.try_get("payload")?,
        payload_type: row.try_get("payload_type")?,
        output: row.try_get("output")?,
        output_type: row.try_get("output_type")?,
        error: opt_json(row.try_get("error")?)?,
        metadata: row.try_get("metadata")?,
        runtime_environment_id: row.try_get("runtime_environment_id")?,
        environment_type: parse_column(row.try_get::<&str, _>("environment_type")?)?,
        project_id: row.try_get("project_id")?,
        organization_id: row.try_get("organization_id")?,
        parent_task_run_id: row.try_get("parent_task_run_id")?,
        root_task_run_id: row.try_get("root_task_run_id")?,
        depth: row.try_get::<i32, _>("depth")? as u32,
        batch_id: row.try_get("batch_id")?,
        batch_index: opt_u32(row.try_get("batch_index")?),
        resume_parent_on_completion: row.try_get("resume_parent_on_completion")?,
        associated_waitpoint_id: row.try_get("associated_waitpoint_id")?,
        ttl_ms: row.try_get::<Option<i64>, _>("ttl_ms")?.map(|v| v as u64),
        delay_until: row.try_get("delay_until")?,
        debounce_key: row.try_get("debounce_key")?,
        priority_ms: row.try_get("priority_ms")?,
        queue_timestamp: row.try_get("queue_timestamp")?,
        latest_snapshot_id: row.try_get("latest_snapshot_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        executed_at: row.try_get("executed_at")?,
        completed_at: row.try_get("completed_at")?,
        expired_at: row.try_get("expired_at")?,
    })
}

async fn insert_run(tx: &mut Transaction<'_, Postgres>, run: &TaskRun) -> EngineResult<()> {
    let placeholders = (1..=40).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO task_runs ({RUN_COLUMNS}) VALUES ({placeholders})");
    bind_run(sqlx::query(&sql), run)?.execute(&mut **tx).await?;
    Ok(())
}

async fn write_run(tx: &mut Transaction<'_, Postgres>, run: &TaskRun) -> EngineResult<()> {
    let assignments = RUN_COLUMNS
        .split(", ")
        .enumerate()
        .skip(1)
        .map(|(i, column)| format!("{} = ${}", column.trim(), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE task_runs SET {assignments} WHERE id = $1");
    bind_run(sqlx::query(&sql), run)?.execute(&mut **tx).await?;
    Ok(())
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

/// Binds every column of [`RUN_COLUMNS`] in order.
fn bind_run<'q>(query: PgQuery<'q>, run: &'q TaskRun) -> EngineResult<PgQuery<'q>> {
    let retry_options = run.retry_options.as_ref().map(serde_json::to_value).transpose()?;
    let error = run.error.as_ref().map(serde_json::to_value).transpose()?;
    Ok(query
        .bind(run.id)
        .bind(&run.friendly_id)
        .bind(&run.task_identifier)
        .bind(&run.queue)
        .bind(&run.concurrency_key)
        .bind(&run.master_queue)
        .bind(run.status.as_str())
        .bind(run.attempt_number as i32)
        .bind(run.max_attempts.map(|v| v as i32))
        .bind(retry_options)
        .bind(&run.machine_preset)
        .bind(&run.payload)
        .bind(&run.payload_type)
        .bind(&run.output)
        .bind(&run.output_type)
        .bind(error)
        .bind(&run.metadata)
        .bind(run.runtime_environment_id)
        .bind(run.environment_type.as_str())
        .bind(run.project_id)
        .bind(run.organization_id)
        .bind(run.parent_task_run_id)
        .bind(run.root_task_run_id)
        .bind(run.depth as i32)
        .bind(run.batch_id)
        .bind(run.batch_index.map(|v| v as i32))
        .bind(run.resume_parent_on_completion)
        .bind(run.associated_waitpoint_id)
        .bind(run.ttl_ms.map(|v| v as i64))
        .bind(run.delay_until)
        .bind(&run.debounce_key)
        .bind(run.priority_ms)
        .bind(run.queue_timestamp)
        .bind(run.latest_snapshot_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.executed_at)
        .bind(run.completed_at)
        .bind(run.expired_at))
}

fn snapshot_from_row(row: &PgRow) -> EngineResult<ExecutionSnapshot> {
    let completed: serde_json::Value = row.try_get("completed_waitpoints")?;
    let completed_waitpoints: Vec<CompletedWaitpointRef> = serde_json::from_value(completed)?;
    Ok(ExecutionSnapshot {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        execution_status: parse_column(row.try_get::<&str, _>("execution_status")?)?,
        description: row.try_get("description")?,
        run_status: parse_column(row.try_get::<&str, _>("run_status")?)?,
        attempt_number: opt_u32(row.try_get("attempt_number")?),
        previous_snapshot_id: row.try_get("previous_snapshot_id")?,
        environment_id: row.try_get("environment_id")?,
        environment_type: parse_column(row.try_get::<&str, _>("environment_type")?)?,
        project_id: row.try_get("project_id")?,
        organization_id: row.try_get("organization_id")?,
        completed_waitpoints,
        batch_id: row.try_get("batch_id")?,
        worker_id: row.try_get("worker_id")?,
        runner_id: row.try_get("runner_id")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &ExecutionSnapshot,
) -> EngineResult<()> {
    let sql = format!(
        "INSERT INTO execution_snapshots ({SNAPSHOT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
    );
    sqlx::query(&sql)
        .bind(snapshot.id)
        .bind(snapshot.run_id)
        .bind(snapshot.execution_status.as_str())
        .bind(&snapshot.description)
        .bind(snapshot.run_status.as_str())
        .bind(snapshot.attempt_number.map(|v| v as i32))
        .bind(snapshot.previous_snapshot_id)
        .bind(snapshot.environment_id)
        .bind(snapshot.environment_type.as_str())
        .bind(snapshot.project_id)
        .bind(snapshot.organization_id)
        .bind(serde_json::to_value(&snapshot.completed_waitpoints)?)
        .bind(snapshot.batch_id)
        .bind(&snapshot.worker_id)
        .bind(&snapshot.runner_id)
        .bind(&snapshot.error)
        .bind(snapshot.created_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn waitpoint_from_row(row: &PgRow) -> EngineResult<Waitpoint> {
    Ok(Waitpoint {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        kind: parse_column(row.try_get::<&str, _>("kind")?)?,
        status: parse_column(row.try_get::<&str, _>("status")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        user_provided_idempotency_key: row.try_get("user_provided_idempotency_key")?,
        output: row.try_get("output")?,
        output_type: row.try_get("output_type")?,
        output_is_error: row.try_get("output_is_error")?,
        completed_by_task_run_id: row.try_get("completed_by_task_run_id")?,
        completed_by_batch_id: row.try_get("completed_by_batch_id")?,
        completed_after: row.try_get("completed_after")?,
        completed_at: row.try_get("completed_at")?,
        project_id: row.try_get("project_id")?,
        environment_id: row.try_get("environment_id")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_waitpoint(
    tx: &mut Transaction<'_, Postgres>,
    waitpoint: &Waitpoint,
) -> EngineResult<()> {
    let sql = format!(
        "INSERT INTO waitpoints ({WAITPOINT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
    );
    sqlx::query(&sql)
        .bind(waitpoint.id)
        .bind(&waitpoint.friendly_id)
        .bind(waitpoint.kind.as_str())
        .bind(waitpoint.status.as_str())
        .bind(&waitpoint.idempotency_key)
        .bind(waitpoint.user_provided_idempotency_key)
        .bind(&waitpoint.output)
        .bind(&waitpoint.output_type)
        .bind(waitpoint.output_is_error)
        .bind(waitpoint.completed_by_task_run_id)
        .bind(waitpoint.completed_by_batch_id)
        .bind(waitpoint.completed_after)
        .bind(waitpoint.completed_at)
        .bind(waitpoint.project_id)
        .bind(waitpoint.environment_id)
        .bind(waitpoint.created_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn relation_from_row(row: &PgRow) -> EngineResult<TaskRunWaitpoint> {
    Ok(TaskRunWaitpoint {
        id: row.try_get("id")?,
        task_run_id: row.try_get("task_run_id")?,
        waitpoint_id: row.try_get("waitpoint_id")?,
        project_id: row.try_get("project_id")?,
        batch_id: row.try_get("batch_id")?,
        batch_index: opt_u32(row.try_get("batch_index")?),
        created_at: row.try_get("created_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> EngineResult<BatchTaskRun> {
    Ok(BatchTaskRun {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        status: parse_column(row.try_get::<&str, _>("status")?)?,
        run_count: row.try_get::<i32, _>("run_count")? as u32,
        processed_count: row.try_get::<i32, _>("processed_count")? as u32,
        successful_run_count: row.try_get::<i32, _>("successful_run_count")? as u32,
        failed_run_count: row.try_get::<i32, _>("failed_run_count")? as u32,
        run_ids: row.try_get("run_ids")?,
        parent_run_id: row.try_get("parent_run_id")?,
        resume_parent_on_completion: row.try_get("resume_parent_on_completion")?,
        waitpoint_id: row.try_get("waitpoint_id")?,
        runtime_environment_id: row.try_get("runtime_environment_id")?,
        project_id: row.try_get("project_id")?,
        organization_id: row.try_get("organization_id")?,
        sealed_at: row.try_get("sealed_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_batch(tx: &mut Transaction<'_, Postgres>, batch: &BatchTaskRun) -> EngineResult<()> {
    let sql = format!(
        "INSERT INTO batch_task_runs ({BATCH_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
    );
    sqlx::query(&sql)
        .bind(batch.id)
        .bind(&batch.friendly_id)
        .bind(batch.status.as_str())
        .bind(batch.run_count as i32)
        .bind(batch.processed_count as i32)
        .bind(batch.successful_run_count as i32)
        .bind(batch.failed_run_count as i32)
        .bind(&batch.run_ids)
        .bind(batch.parent_run_id)
        .bind(batch.resume_parent_on_completion)
        .bind(batch.waitpoint_id)
        .bind(batch.runtime_environment_id)
        .bind(batch.project_id)
        .bind(batch.organization_id)
        .bind(batch.sealed_at)
        .bind(batch.completed_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_column_count_matches_binds() {
        assert_eq!(RUN_COLUMNS.split(", ").count(), 40);
    }

    #[test]
    fn test_parse_column_reports_bad_values() {
        let result: EngineResult<TaskRunStatus> = parse_column("RUNNING");
        assert!(matches!(result, Err(EngineError::Database(_))));
    }

    #[cfg(feature = "test-services")]
    #[tokio::test]
    async fn test_round_trip_against_database() {
        let config = DatabaseConfig::default();
        let Ok(store) = PgEngineStore::connect(&config).await else {
            eprintln!("Skipping PostgreSQL store test: database unavailable");
            return;
        };
        store.migrate().await.unwrap();
        let missing = store.find_run(Uuid::now_v7()).await.unwrap();
        assert!(missing.is_none());
    }
}

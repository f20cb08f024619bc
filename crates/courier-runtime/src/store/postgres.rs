//! PostgreSQL task store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers pop disjoint
//! batches without serialization conflicts, and every subsequent mutation is
//! conditioned on `picked_by` so a recovered lease turns into
//! [`StoreError::LeaseLost`] for the previous holder.
//!
//! The table is provisioned out-of-band; this module owns no DDL. Expected
//! schema:
//!
//! ```sql
//! CREATE TABLE scheduled_tasks (
//!     task_name            TEXT NOT NULL,
//!     task_instance        TEXT NOT NULL,
//!     execution_time       TIMESTAMPTZ NOT NULL,
//!     data                 BYTEA NOT NULL,
//!     picked               BOOLEAN NOT NULL DEFAULT FALSE,
//!     picked_by            TEXT,
//!     last_heartbeat       TIMESTAMPTZ,
//!     last_success         TIMESTAMPTZ,
//!     last_failure         TIMESTAMPTZ,
//!     consecutive_failures INTEGER NOT NULL DEFAULT 0,
//!     version              BIGINT NOT NULL DEFAULT 0,
//!
//!     PRIMARY KEY (task_name, task_instance)
//! );
//!
//! CREATE INDEX idx_scheduled_tasks_due ON scheduled_tasks (picked, execution_time);
//! CREATE INDEX idx_scheduled_tasks_owner ON scheduled_tasks (picked_by);
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use courier_core::{NewTask, Task, TaskId};
use rand::Rng;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{StoreError, TaskStore, POISON_FAILURES};

const RETRY_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: NewTask) -> Result<(), StoreError> {
        let result = with_retry("insert", || async {
            sqlx::query(
                "INSERT INTO scheduled_tasks
                     (task_name, task_instance, execution_time, data,
                      picked, consecutive_failures, version)
                 VALUES ($1, $2, $3, $4, FALSE, 0, 0)",
            )
            .bind(&task.id.name)
            .bind(&task.id.instance)
            .bind(task.execution_time)
            .bind(&task.data)
            .execute(&self.pool)
            .await
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateInstance(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = with_retry("claim_due", || async {
            sqlx::query(
                "WITH due AS (
                     SELECT task_name, task_instance
                     FROM scheduled_tasks
                     WHERE picked = FALSE
                       AND execution_time <= $1
                       AND consecutive_failures < $2
                     ORDER BY execution_time ASC
                     LIMIT $3
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE scheduled_tasks t
                 SET picked = TRUE,
                     picked_by = $4,
                     last_heartbeat = $1,
                     version = version + 1
                 FROM due
                 WHERE t.task_name = due.task_name
                   AND t.task_instance = due.task_instance
                 RETURNING t.*",
            )
            .bind(now)
            .bind(POISON_FAILURES)
            .bind(limit as i64)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut tasks = rows
            .into_iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        // The UPDATE ... FROM form does not preserve the subquery order.
        tasks.sort_by_key(|task| task.execution_time);

        Ok(tasks)
    }

    async fn heartbeat(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks
             SET last_heartbeat = $1,
                 version = version + 1
             WHERE task_name = $2 AND task_instance = $3 AND picked_by = $4",
        )
        .bind(now)
        .bind(&id.name)
        .bind(&id.instance)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        lease_checked(result.rows_affected())
    }

    async fn complete(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError> {
        let result = with_retry("complete", || async {
            sqlx::query(
                "DELETE FROM scheduled_tasks
                 WHERE task_name = $1 AND task_instance = $2 AND picked_by = $3",
            )
            .bind(&id.name)
            .bind(&id.instance)
            .bind(worker_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        lease_checked(result.rows_affected())
    }

    async fn reschedule(
        &self,
        id: &TaskId,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = if on_success {
            "UPDATE scheduled_tasks
             SET execution_time = $1,
                 picked = FALSE,
                 picked_by = NULL,
                 last_heartbeat = NULL,
                 last_success = $2,
                 consecutive_failures = 0,
                 version = version + 1
             WHERE task_name = $3 AND task_instance = $4 AND picked_by = $5"
        } else {
            "UPDATE scheduled_tasks
             SET execution_time = $1,
                 picked = FALSE,
                 picked_by = NULL,
                 last_heartbeat = NULL,
                 last_failure = $2,
                 consecutive_failures = consecutive_failures + 1,
                 version = version + 1
             WHERE task_name = $3 AND task_instance = $4 AND picked_by = $5"
        };

        let result = with_retry("reschedule", || async {
            sqlx::query(sql)
                .bind(next_time)
                .bind(now)
                .bind(&id.name)
                .bind(&id.instance)
                .bind(worker_id)
                .execute(&self.pool)
                .await
        })
        .await?;

        lease_checked(result.rows_affected())
    }

    async fn release(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError> {
        let result = with_retry("release", || async {
            sqlx::query(
                "UPDATE scheduled_tasks
                 SET picked = FALSE,
                     picked_by = NULL,
                     last_heartbeat = NULL,
                     version = version + 1
                 WHERE task_name = $1 AND task_instance = $2 AND picked_by = $3",
            )
            .bind(&id.name)
            .bind(&id.instance)
            .bind(worker_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        lease_checked(result.rows_affected())
    }

    async fn poison(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = with_retry("poison", || async {
            sqlx::query(
                "UPDATE scheduled_tasks
                 SET picked = FALSE,
                     picked_by = NULL,
                     last_heartbeat = NULL,
                     last_failure = $1,
                     consecutive_failures = $2,
                     version = version + 1
                 WHERE task_name = $3 AND task_instance = $4 AND picked_by = $5",
            )
            .bind(now)
            .bind(POISON_FAILURES)
            .bind(&id.name)
            .bind(&id.instance)
            .bind(worker_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        lease_checked(result.rows_affected())
    }

    async fn recover_leases(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = now
            - TimeDelta::from_std(stale_after).unwrap_or_else(|_| TimeDelta::seconds(i32::MAX as i64));

        let result = with_retry("recover_leases", || async {
            sqlx::query(
                "UPDATE scheduled_tasks
                 SET picked = FALSE,
                     picked_by = NULL,
                     last_heartbeat = NULL,
                     version = version + 1
                 WHERE picked = TRUE AND last_heartbeat < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM scheduled_tasks WHERE task_name = $1 AND task_instance = $2",
        )
        .bind(&id.name)
        .bind(&id.instance)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose().map_err(Into::into)
    }
}

fn lease_checked(rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::LeaseLost)
    } else {
        Ok(())
    }
}

fn row_to_task(row: PgRow) -> Result<Task, sqlx::Error> {
    Ok(Task {
        id: TaskId::new(
            row.try_get::<String, _>("task_name")?,
            row.try_get::<String, _>("task_instance")?,
        ),
        execution_time: row.try_get("execution_time")?,
        data: row.try_get("data")?,
        picked: row.try_get("picked")?,
        picked_by: row.try_get("picked_by")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        last_success: row.try_get("last_success")?,
        last_failure: row.try_get("last_failure")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        version: row.try_get("version")?,
    })
}

/// Runs a statement up to [`RETRY_ATTEMPTS`] times, sleeping a short jittered
/// delay between attempts, as long as the failure looks transient
/// (connection loss, pool exhaustion, deadlock, serialization conflict).
async fn with_retry<T, F, Fut>(op: &str, f: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        match f().await {
            Err(error) if attempt < RETRY_ATTEMPTS && is_transient(&error) => {
                let delay = rand::thread_rng().gen_range(50..250) * attempt as u64;
                tracing::warn!(
                    "transient database error during {op} (attempt {attempt}): {error}"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            result => return result,
        }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => match db.code() {
            // serialization_failure, deadlock_detected, connection class
            Some(code) => code == "40001" || code == "40P01" || code.starts_with("08"),
            None => false,
        },
        _ => false,
    }
}

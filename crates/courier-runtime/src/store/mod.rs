//! Durable task storage.
//!
//! The store is the only coordination point between workers: every operation
//! here is a single atomic transaction against the backing database, and all
//! lease-conditioned mutations re-check ownership so that a stolen lease
//! surfaces as [`StoreError::LeaseLost`] instead of a lost update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{NewTask, Task, TaskId};

mod memory;
mod postgres;

pub use self::memory::MemTaskStore;
pub use self::postgres::PgTaskStore;

/// A row whose `consecutive_failures` reaches this value is parked: it is
/// never returned by `claim_due` again and must be cleared out-of-band.
pub const POISON_FAILURES: i32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Insert collided on `(task_name, task_instance)`. For named recurring
    /// tasks this is the dedup signal, not a fault.
    #[error("task {0} already exists")]
    DuplicateInstance(TaskId),

    /// A lease-conditioned mutation found the row claimed by someone else
    /// (or gone). The caller must abandon the task without side effects.
    #[error("task lease is no longer held by this worker")]
    LeaseLost,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Operational surface over the `scheduled_tasks` table.
///
/// No business logic lives here; recurrence and failure policy are decided
/// by the caller and handed down as plain values.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a fresh, unclaimed row. Fails with
    /// [`StoreError::DuplicateInstance`] when the identity is taken.
    async fn insert(&self, task: NewTask) -> Result<(), StoreError>;

    /// Atomically claims up to `limit` due rows for `worker_id`, in
    /// ascending due-time order. Two workers never receive the same row.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError>;

    /// Refreshes the lease liveness timestamp.
    async fn heartbeat(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes a finished row (one-shot success, or exhausted schedule).
    async fn complete(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError>;

    /// Releases the lease and moves the row to its next due time. On
    /// success the failure streak resets; on failure it grows and the
    /// failure timestamp is recorded.
    async fn reschedule(
        &self,
        id: &TaskId,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Releases the lease without recording an outcome or touching the due
    /// time. Used when a claimed row cannot be handed to the pool.
    async fn release(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError>;

    /// Parks a row whose payload can no longer be decoded: lease released,
    /// failure recorded, `consecutive_failures` forced to the poison
    /// ceiling so the row stops being claimed.
    async fn poison(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Forcibly releases every claimed row whose heartbeat is older than
    /// `stale_after`. This is the only path that reclaims work from crashed
    /// workers. Returns how many rows were released.
    async fn recover_leases(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StoreError>;

    /// Point read by identity.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;
}

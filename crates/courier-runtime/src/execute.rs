//! Per-task execution pipeline.
//!
//! One claimed row is handled end-to-end: a heartbeat sidecar keeps the
//! lease fresh while the payload is decoded and republished, then a single
//! store mutation finalizes the row. Losing the lease at any point aborts
//! the pipeline without publishing or mutating — the new lease holder is
//! authoritative.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use courier_core::{Task, TaskData};
use futures_util::FutureExt;
use rand::Rng;
use tokio::time::Instant;
use tracing::Instrument;

use crate::flag::StopFlag;
use crate::store::StoreError;
use crate::worker::SharedState;

pub(crate) async fn run_task(shared: Arc<SharedState>, worker_id: String, task: Task) {
    let span = tracing::info_span!("task", task = %task.id);

    async move {
        let lease_lost = StopFlag::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            shared.clone(),
            worker_id.clone(),
            task.id.clone(),
            lease_lost.clone(),
        ));

        execute(&shared, &worker_id, &task, &lease_lost).await;

        heartbeat.abort();
    }
    .instrument(span)
    .await
}

async fn execute(shared: &SharedState, worker_id: &str, task: &Task, lease_lost: &StopFlag) {
    let data = match TaskData::decode(&task.data) {
        Ok(data) => data,
        Err(error) => {
            tracing::error!("task data no longer decodes, parking the row: {error}");
            park(shared, worker_id, task).await;
            return;
        }
    };

    let Some(handler) = shared.registry.handler(&task.id.name) else {
        tracing::error!(kind = %task.id.name, "no handler registered for task kind, parking the row");
        park(shared, worker_id, task).await;
        return;
    };

    if lease_lost.is_raised() {
        tracing::debug!("lease already lost, abandoning task");
        return;
    }

    // A panicking handler must not take the pool down; it counts as a
    // transient execution failure like any other.
    let attempt = AssertUnwindSafe(handler.execute(task, &data)).catch_unwind();
    let result = tokio::select! {
        biased;

        _ = lease_lost.wait() => {
            tracing::debug!("lease lost mid-execution, abandoning task");
            return;
        }
        result = attempt => match result {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "task handler panicked: {}",
                panic_message(&payload)
            )),
        },
    };

    if lease_lost.is_raised() {
        tracing::debug!("lease lost before finalize, abandoning task");
        return;
    }

    let now = Utc::now();
    let finalized = match result {
        Ok(()) => {
            shared.stats.record_processed();
            finalize_success(shared, worker_id, task, &data, now).await
        }
        Err(error) => {
            shared.stats.record_failed();
            tracing::warn!("task execution failed: {error:#}");
            finalize_failure(shared, worker_id, task, now).await
        }
    };

    match finalized {
        Ok(()) => {}
        Err(StoreError::LeaseLost) => {
            tracing::debug!("row was reassigned before finalize, leaving it alone");
        }
        Err(error) => {
            // The row stays leased until recovery releases it; execution
            // will repeat, which at-least-once permits.
            tracing::error!("failed to finalize task: {error}");
        }
    }
}

async fn finalize_success(
    shared: &SharedState,
    worker_id: &str,
    task: &Task,
    data: &TaskData,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let schedule = match data.schedule.to_schedule() {
        Ok(schedule) => schedule,
        Err(error) => {
            // The descriptor was valid at ingress; if it no longer
            // constructs, the row cannot be rescheduled safely.
            tracing::error!("schedule descriptor no longer validates, parking the row: {error}");
            return shared.store.poison(&task.id, worker_id, now).await;
        }
    };

    match schedule.next(now) {
        Some(next) if schedule.is_recurring() => {
            tracing::debug!(next = %next, "rescheduling recurring task");
            shared
                .store
                .reschedule(&task.id, worker_id, next, true, now)
                .await
        }
        _ => shared.store.complete(&task.id, worker_id).await,
    }
}

async fn finalize_failure(
    shared: &SharedState,
    worker_id: &str,
    task: &Task,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let backoff = shared.config.backoff(task.consecutive_failures + 1);
    let next = now + TimeDelta::from_std(backoff).unwrap_or_else(|_| TimeDelta::hours(1));

    tracing::info!(
        failures = task.consecutive_failures + 1,
        retry_at = %next,
        "scheduling retry after failure"
    );

    shared
        .store
        .reschedule(&task.id, worker_id, next, false, now)
        .await
}

async fn park(shared: &SharedState, worker_id: &str, task: &Task) {
    shared.stats.record_failed();

    match shared.store.poison(&task.id, worker_id, Utc::now()).await {
        Ok(()) => {}
        Err(StoreError::LeaseLost) => {
            tracing::debug!("row was reassigned before it could be parked");
        }
        Err(error) => tracing::error!("failed to park undecodable task: {error}"),
    }
}

/// Keeps the lease fresh until aborted. A rejected heartbeat means another
/// worker owns the row now: raise the flag and stop.
async fn heartbeat_loop(
    shared: Arc<SharedState>,
    worker_id: String,
    id: courier_core::TaskId,
    lease_lost: StopFlag,
) {
    let interval = shared.config.heartbeat_interval();
    let mut next = Instant::now() + jittered(interval);

    loop {
        tokio::time::sleep_until(next).await;

        let attempt = tokio::time::timeout(
            interval / 2,
            shared.store.heartbeat(&id, &worker_id, Utc::now()),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {}
            Ok(Err(StoreError::LeaseLost)) => {
                tracing::debug!(task = %id, "heartbeat rejected, lease lost");
                lease_lost.raise();
                return;
            }
            // Transient; the lease has slack for several missed beats.
            Ok(Err(error)) => tracing::warn!(task = %id, "heartbeat failed: {error}"),
            Err(_) => tracing::warn!(task = %id, "heartbeat attempt timed out"),
        }

        next += jittered(interval);
    }
}

/// Jitters an interval downwards by up to a quarter to keep a fleet of
/// workers from heartbeating in lockstep.
fn jittered(interval: Duration) -> Duration {
    let quarter = (interval.as_millis() / 4) as u64;
    let jitter = rand::thread_rng().gen_range(0..=quarter);

    interval - Duration::from_millis(jitter)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else {
        "Box<dyn Any>"
    }
}

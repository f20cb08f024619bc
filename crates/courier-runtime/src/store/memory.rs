//! In-memory task store.
//!
//! Implements the exact claim/lease/reschedule semantics of the Postgres
//! store over a process-local map. Integration tests run against this so
//! they need no database; it is not meant for production use (nothing
//! survives a restart).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use courier_core::{NewTask, Task, TaskId};
use parking_lot::Mutex;

use super::{StoreError, TaskStore, POISON_FAILURES};

#[derive(Default)]
pub struct MemTaskStore {
    tasks: Mutex<HashMap<(String, String), Task>>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// A copy of every row, for test assertions.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Rewrites a row's due time, bypassing the lease check. Lets tests
    /// fast-forward a backoff instead of sleeping through it.
    pub fn set_execution_time(&self, id: &TaskId, execution_time: DateTime<Utc>) {
        if let Some(task) = self.tasks.lock().get_mut(&key(id)) {
            task.execution_time = execution_time;
        }
    }

    fn with_leased_row<T>(
        &self,
        id: &TaskId,
        worker_id: &str,
        f: impl FnOnce(&mut Task) -> T,
    ) -> Result<T, StoreError> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&key(id)) {
            Some(task) if task.picked_by.as_deref() == Some(worker_id) => Ok(f(task)),
            _ => Err(StoreError::LeaseLost),
        }
    }
}

fn key(id: &TaskId) -> (String, String) {
    (id.name.clone(), id.instance.clone())
}

fn unclaim(task: &mut Task) {
    task.picked = false;
    task.picked_by = None;
    task.last_heartbeat = None;
    task.version += 1;
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn insert(&self, task: NewTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock();
        let entry = key(&task.id);
        if tasks.contains_key(&entry) {
            return Err(StoreError::DuplicateInstance(task.id));
        }

        tasks.insert(
            entry,
            Task {
                id: task.id,
                execution_time: task.execution_time,
                data: task.data,
                picked: false,
                picked_by: None,
                last_heartbeat: None,
                last_success: None,
                last_failure: None,
                consecutive_failures: 0,
                version: 0,
            },
        );

        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.lock();

        let mut due: Vec<(String, String)> = tasks
            .values()
            .filter(|task| {
                !task.picked
                    && task.execution_time <= now
                    && task.consecutive_failures < POISON_FAILURES
            })
            .map(|task| key(&task.id))
            .collect();
        due.sort_by_key(|entry| tasks[entry].execution_time);
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for entry in due {
            if let Some(task) = tasks.get_mut(&entry) {
                task.picked = true;
                task.picked_by = Some(worker_id.to_owned());
                task.last_heartbeat = Some(now);
                task.version += 1;
                claimed.push(task.clone());
            }
        }

        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_leased_row(id, worker_id, |task| {
            task.last_heartbeat = Some(now);
            task.version += 1;
        })
    }

    async fn complete(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock();
        match tasks.get(&key(id)) {
            Some(task) if task.picked_by.as_deref() == Some(worker_id) => {
                tasks.remove(&key(id));
                Ok(())
            }
            _ => Err(StoreError::LeaseLost),
        }
    }

    async fn reschedule(
        &self,
        id: &TaskId,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_leased_row(id, worker_id, |task| {
            task.execution_time = next_time;
            if on_success {
                task.last_success = Some(now);
                task.consecutive_failures = 0;
            } else {
                task.last_failure = Some(now);
                task.consecutive_failures += 1;
            }
            unclaim(task);
        })
    }

    async fn release(&self, id: &TaskId, worker_id: &str) -> Result<(), StoreError> {
        self.with_leased_row(id, worker_id, unclaim)
    }

    async fn poison(
        &self,
        id: &TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_leased_row(id, worker_id, |task| {
            task.last_failure = Some(now);
            task.consecutive_failures = POISON_FAILURES;
            unclaim(task);
        })
    }

    async fn recover_leases(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff =
            now - TimeDelta::from_std(stale_after).unwrap_or_else(|_| TimeDelta::seconds(i32::MAX as i64));
        let mut recovered = 0;

        for task in self.tasks.lock().values_mut() {
            let stale = task.picked
                && task
                    .last_heartbeat
                    .map(|heartbeat| heartbeat < cutoff)
                    .unwrap_or(true);
            if stale {
                unclaim(task);
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.lock().get(&key(id)).cloned())
    }
}

//! The per-process worker: one polling loop feeding a bounded pool of
//! execution pipelines.
//!
//! Multiple workers may run against the same database; they coordinate only
//! through the store. Each tick recovers stale leases, then claims at most
//! as many due rows as the pool has idle capacity — a saturated pool simply
//! leaves rows unclaimed for a later tick (or another worker), which is the
//! system's flow control.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::Publisher;
use crate::config::Config;
use crate::execute;
use crate::flag::{StopFlag, StopGuard};
use crate::registry::{PublishHandler, TaskRegistry};
use crate::stats::Stats;
use crate::store::TaskStore;

pub(crate) struct SharedState {
    pub shutdown: StopFlag,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<TaskRegistry>,
    pub config: Config,
    pub stats: Arc<Stats>,
}

pub struct WorkerBuilder {
    config: Config,
    store: Arc<dyn TaskStore>,
    publisher: Arc<dyn Publisher>,
    shutdown: Option<StopFlag>,
    stats: Option<Arc<Stats>>,
    worker_id: Option<String>,
}

impl WorkerBuilder {
    pub fn new(store: Arc<dyn TaskStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            config: Config::default(),
            store,
            publisher,
            shutdown: None,
            stats: None,
            worker_id: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Share an externally owned stop flag (so sibling components like the
    /// HTTP listener shut down together with the worker).
    pub fn shutdown(mut self, flag: StopFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Overrides the generated worker identity (used by tests to simulate
    /// specific lease holders).
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn build(self) -> Worker {
        let stats = self.stats.unwrap_or_default();
        let registry = Arc::new(TaskRegistry::new(self.store.clone(), stats.clone()));
        registry.register(
            courier_core::PUBLISH_PAYLOAD,
            Arc::new(PublishHandler::new(
                self.publisher,
                self.config.publish_timeout,
            )),
        );

        let permits = Arc::new(Semaphore::new(self.config.max_threads));
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| format!("{}@{}", std::process::id(), Uuid::new_v4()));

        Worker {
            shared: Arc::new(SharedState {
                shutdown: self.shutdown.unwrap_or_default(),
                store: self.store,
                registry,
                config: self.config,
                stats,
            }),
            worker_id,
            permits,
            tasks: JoinSet::new(),
        }
    }
}

/// Cloneable remote control for a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<SharedState>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shared.shutdown.raise();
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.shared.registry.clone()
    }
}

pub struct Worker {
    shared: Arc<SharedState>,
    worker_id: String,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl Worker {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.shared.registry.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs the polling loop until the stop flag is raised, then drains
    /// in-flight pipelines within the shutdown grace period.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        tracing::info!(worker_id = %self.worker_id, "courier worker starting");

        self.poll_loop().await;
        self.drain().await;

        tracing::info!(worker_id = %self.worker_id, "courier worker stopped");

        Ok(())
    }

    async fn poll_loop(&mut self) {
        let shutdown = self.shared.shutdown.clone();
        let _guard = StopGuard::new(&shutdown);
        let mut next = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait() => break,
                _ = tokio::time::sleep_until(next) => ()
            }

            if let Err(error) = self.tick().await {
                // Transient store trouble was already retried below us;
                // whatever is left keeps the loop alive and tries again
                // next tick.
                tracing::error!("polling tick failed: {error:#}");
            }

            // Reap pipelines that have already finished.
            while self.tasks.try_join_next().is_some() {}

            // Scheduling relative to tick completion keeps ticks from
            // overlapping no matter how long a tick takes.
            next = Instant::now() + self.shared.config.polling_interval;
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let now = Utc::now();
        let config = &self.shared.config;

        let recovered = self
            .shared
            .store
            .recover_leases(now, config.lease_timeout)
            .await?;
        if recovered > 0 {
            tracing::info!(recovered, "released stale task leases");
        }

        let idle = self.permits.available_permits();
        if idle == 0 {
            tracing::debug!("worker pool saturated, not claiming this tick");
            return Ok(());
        }

        let limit = (config.batch_size as usize).min(idle) as u32;
        let claimed = self
            .shared
            .store
            .claim_due(now, &self.worker_id, limit)
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = claimed.len(), "claimed due tasks");

        for task in claimed {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // The pool filled up under us; put the row back for a
                    // later tick.
                    if let Err(error) = self.shared.store.release(&task.id, &self.worker_id).await {
                        tracing::warn!(task = %task.id, "failed to release unstartable task: {error}");
                    }
                    continue;
                }
            };

            let shared = self.shared.clone();
            let worker_id = self.worker_id.clone();
            self.tasks.spawn(async move {
                let _permit = permit;
                execute::run_task(shared, worker_id, task).await;
            });
        }

        Ok(())
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        let grace = self.shared.config.shutdown_grace;
        tracing::info!(
            in_flight = self.tasks.len(),
            "waiting up to {} for in-flight tasks",
            humantime::Duration::from(grace)
        );

        let deadline = Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    // Abandoned tasks become stale-lease candidates for the
                    // next worker, preserving at-least-once.
                    tracing::warn!(
                        abandoned = self.tasks.len(),
                        "shutdown grace expired, aborting in-flight tasks"
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
    }
}

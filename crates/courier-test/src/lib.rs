//! Helpers for end-to-end tests: spawn a worker over an in-memory store and
//! a recording publisher, with intervals short enough to observe scheduling
//! behavior in test time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_runtime::broker::TestPublisher;
use courier_runtime::registry::TaskRegistry;
use courier_runtime::store::MemTaskStore;
use courier_runtime::{Config, WorkerBuilder, WorkerHandle};
use futures::FutureExt;
use tokio::task::JoinHandle;

/// Production defaults scaled down to test time: 100 ms polling, 2 s leases.
pub fn test_config() -> Config {
    Config::new()
        .polling_interval(Duration::from_millis(100))
        .lease_timeout(Duration::from_secs(2))
        .lease_heartbeat_interval(Duration::from_millis(100))
        .shutdown_grace(Duration::from_secs(5))
}

pub struct TestHarness {
    pub store: Arc<MemTaskStore>,
    pub publisher: Arc<TestPublisher>,
    pub worker: WorkerShutdownGuard,
}

impl TestHarness {
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.worker.handle().registry()
    }
}

pub fn spawn_worker() -> TestHarness {
    spawn_worker_with(test_config())
}

pub fn spawn_worker_with(config: Config) -> TestHarness {
    let store = Arc::new(MemTaskStore::new());
    let publisher = Arc::new(TestPublisher::new());
    let worker = spawn_worker_on(store.clone(), publisher.clone(), config);

    TestHarness {
        store,
        publisher,
        worker,
    }
}

/// Spawns a worker over pre-existing collaborators (for tests that seed the
/// store before the worker starts looking at it).
pub fn spawn_worker_on(
    store: Arc<MemTaskStore>,
    publisher: Arc<TestPublisher>,
    config: Config,
) -> WorkerShutdownGuard {
    let mut worker = WorkerBuilder::new(store, publisher).config(config).build();

    let handle = worker.handle();
    let task = tokio::spawn(async move { worker.run().await });

    WorkerShutdownGuard { handle, task }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    condition()
}

pub struct WorkerShutdownGuard {
    handle: WorkerHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl WorkerShutdownGuard {
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }
}

impl Future for WorkerShutdownGuard {
    type Output = anyhow::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = std::task::ready!(self.task.poll_unpin(cx));

        Poll::Ready(match result {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(e) => Err(anyhow::anyhow!(e)),
            },
        })
    }
}

impl Drop for WorkerShutdownGuard {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

#[ctor::ctor]
fn setup_tracing() {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

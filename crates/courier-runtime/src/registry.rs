//! Task kinds and request resolution.
//!
//! The registry maps a task kind (`task_name`) to the handler that executes
//! it, and turns validated schedule requests into persisted task rows. There
//! is one built-in kind, [`PUBLISH_PAYLOAD`]: the schedule descriptor travels
//! inside each row's data envelope, so recurring tasks need no per-request
//! registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{NewTask, ScheduleRequest, Task, TaskData, TaskId, PUBLISH_PAYLOAD};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::broker::Publisher;
use crate::stats::Stats;
use crate::store::{StoreError, TaskStore};

/// Executes one claimed task of a given kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task, data: &TaskData) -> anyhow::Result<()>;
}

/// The built-in handler: republish the envelope's payload to its topic.
pub struct PublishHandler {
    publisher: Arc<dyn Publisher>,
    timeout: Duration,
}

impl PublishHandler {
    pub fn new(publisher: Arc<dyn Publisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }
}

#[async_trait]
impl TaskHandler for PublishHandler {
    async fn execute(&self, task: &Task, data: &TaskData) -> anyhow::Result<()> {
        let payload = Bytes::from(data.payload.clone());
        let publish = self
            .publisher
            .publish(&data.target_topic, payload, &data.attributes);

        let message_id = tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "publish timed out after {}",
                    humantime::Duration::from(self.timeout)
                )
            })??;

        tracing::debug!(
            task = %task.id,
            topic = %data.target_topic,
            message_id = %message_id,
            "republished payload"
        );

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The `(task_name, task_instance)` pair is already scheduled. For named
    /// recurring requests this is the dedup outcome; callers decide whether
    /// it is an error.
    #[error("task {0} is already scheduled")]
    Duplicate(TaskId),

    #[error("failed to encode task data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SubmitError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateInstance(id) => SubmitError::Duplicate(id),
            other => SubmitError::Store(other),
        }
    }
}

pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stats: Arc<Stats>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn TaskStore>, stats: Arc<Stats>) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Registers a handler for a task kind. Meant to run at startup, before
    /// any row of that kind can be claimed.
    pub fn register(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_name.into(), handler);
    }

    pub fn handler(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_name).cloned()
    }

    /// Resolves a validated request into a persisted task row and returns
    /// its identity.
    ///
    /// Named requests keep their caller-supplied name as the instance, which
    /// is what makes a second submission collide; anonymous one-shots get a
    /// fresh UUID.
    pub async fn submit(
        &self,
        request: &ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<TaskId, SubmitError> {
        let data = request.task_data().encode()?;
        let execution_time = request.first_execution_time(now);

        let instance = match &request.task_name {
            Some(name) => name.clone(),
            None => Uuid::new_v4().to_string(),
        };
        let id = TaskId::new(PUBLISH_PAYLOAD, instance);

        self.store
            .insert(NewTask {
                id: id.clone(),
                execution_time,
                data,
            })
            .await?;

        self.stats.record_received();
        tracing::info!(task = %id, due = %execution_time, "task scheduled");

        Ok(id)
    }
}

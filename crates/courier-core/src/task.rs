use std::fmt;

use chrono::{DateTime, Utc};

/// The task kind every schedule request resolves to.
///
/// The schedule descriptor rides inside the task's `data` envelope, so a
/// single registered kind covers one-time and recurring schedules alike.
pub const PUBLISH_PAYLOAD: &str = "publish-payload";

/// Identity of a persisted task: `(task_name, task_instance)`.
///
/// `task_name` is the kind of work; `task_instance` is unique within the
/// kind. Named recurring requests supply their own instance (which is what
/// makes duplicate submissions collide); one-shots get a generated UUID.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub name: String,
    pub instance: String,
}

impl TaskId {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.instance)
    }
}

/// A row in the `scheduled_tasks` table.
///
/// `data` is opaque here: it is written once on insert and never mutated,
/// only the scheduling and leasing fields change afterwards.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub execution_time: DateTime<Utc>,
    pub data: Vec<u8>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub version: i64,
}

impl Task {
    /// Whether the row is claimable at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.picked && self.execution_time <= now
    }
}

/// A task as handed to the store for insertion.
///
/// The scheduling/leasing fields all start at their unclaimed defaults, so
/// only the identity, due time and payload envelope are supplied.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub id: TaskId,
    pub execution_time: DateTime<Utc>,
    pub data: Vec<u8>,
}

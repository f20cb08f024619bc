//! Runtime for the courier message scheduler: the durable task store, the
//! leased polling worker, the execution pipeline, and the ingress adapters
//! that feed it.

pub mod api;
pub mod broker;
mod config;
mod execute;
pub mod flag;
pub mod ingest;
pub mod registry;
mod stats;
pub mod store;
mod worker;

pub use self::config::Config;
pub use self::stats::{Stats, StatsSnapshot};
pub use self::worker::{Worker, WorkerBuilder, WorkerHandle};

//! Staging queue controller
//!
//! Drives one queue at a time through cleanup, image check, deployment,
//! testing, collection, and disposition. Each tick runs exactly one phase
//! handler for the current queue; handlers are idempotent and gate every side
//! effect on a condition recorded on the queue.

pub mod cluster;
pub mod context;
pub mod controller;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod phases;
pub mod report;
pub mod store;
pub mod testrunner;
pub mod values;

#[cfg(test)]
pub(crate) mod test_support;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use context::{Context, ContextBuilder, Timings};
pub use controller::{Controller, Tick};
pub use engine::{DeployEngine, EngineRegistry};
pub use error::{Result, StagingError};
pub use store::{KubeQueueStore, QueueStore};
pub use testrunner::{RunnerRegistry, TestResult, TestRunner};

/// Fixed name of promote-to-active queues
pub const PROMOTE_TO_ACTIVE_QUEUE: &str = "promote-to-active";

/// Fixed name of demote-from-active queues
pub const DEMOTE_FROM_ACTIVE_QUEUE: &str = "demote-from-active";

//! Custom Resource Definitions for Stagehand
//!
//! All resources are namespaced: one tenant namespace holds the queues, the
//! run history, and the last-known-good component versions of one team.

mod queue;
mod queue_history;
mod stable_component;
mod types;

pub use queue::{
    Conditions, Queue, QueueCondition, QueueConditionType, QueueSpec, QueueState, QueueStatus,
    QueueType, TestRunnerStatus,
};
pub use queue_history::{QueueHistory, QueueHistorySpec, QueueSnapshot};
pub use stable_component::{StableComponent, StableComponentSpec};
pub use types::{ConditionStatus, Image};

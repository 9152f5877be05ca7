//! Test runners
//!
//! A runner starts an external test execution for a deployed queue and
//! reports its outcome. The test configuration names the runner implicitly:
//! whichever provider block is filled in.

mod http;
mod mock;

pub use http::{HttpTestRunner, HTTP_RUNNER};
pub use mock::{MockTestRunner, MOCK_RUNNER};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagehand_common::config::TestRunnerConfig;
use stagehand_common::crd::Queue;

use crate::Result;

/// Time a trigger call may take before the tick fails
pub const TRIGGER_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a poll
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestResult {
    /// Whether the test passed (meaningless until finished)
    pub success: bool,
    /// Whether the execution is over
    pub finished: bool,
}

impl TestResult {
    /// Execution still running
    pub fn pending() -> Self {
        Self::default()
    }

    /// Execution over with the given outcome
    pub fn finished(success: bool) -> Self {
        Self {
            success,
            finished: true,
        }
    }
}

/// Contract every test runner implements
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Registry name of the runner
    fn name(&self) -> &str;

    /// Start a test execution.
    ///
    /// Runners record what they need for polling on `queue.status.test_runners`.
    async fn trigger(&self, config: &TestRunnerConfig, queue: &mut Queue) -> Result<()>;

    /// Poll the execution started by [`TestRunner::trigger`]
    async fn get_result(&self, config: &TestRunnerConfig, queue: &Queue) -> Result<TestResult>;
}

/// Test runners by name
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn TestRunner>>,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            runners: BTreeMap::new(),
        }
    }

    /// Registry with the built-in runners
    pub fn with_builtin() -> Result<Self> {
        Ok(Self::new()
            .register(Arc::new(HttpTestRunner::new()?))
            .register(Arc::new(MockTestRunner)))
    }

    /// Add a runner under its own name
    pub fn register(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.runners.insert(runner.name().to_string(), runner);
        self
    }

    /// Runner for a test configuration, if its provider is registered
    pub fn select(&self, config: &TestRunnerConfig) -> Option<Arc<dyn TestRunner>> {
        let name = if config.http.is_some() {
            HTTP_RUNNER
        } else if config.mock.is_some() {
            MOCK_RUNNER
        } else {
            return None;
        };
        self.runners.get(name).cloned()
    }
}

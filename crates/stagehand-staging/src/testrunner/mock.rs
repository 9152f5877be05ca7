//! Test runner with a configured outcome

use async_trait::async_trait;
use stagehand_common::config::TestRunnerConfig;
use stagehand_common::crd::{Queue, TestRunnerStatus};
use tracing::info;

use super::{TestResult, TestRunner};
use crate::Result;

/// Registry name of the mock runner
pub const MOCK_RUNNER: &str = "mock";

/// Runner that finishes immediately with `mock.result`
#[derive(Debug, Default, Clone, Copy)]
pub struct MockTestRunner;

#[async_trait]
impl TestRunner for MockTestRunner {
    fn name(&self) -> &str {
        MOCK_RUNNER
    }

    async fn trigger(&self, _config: &TestRunnerConfig, queue: &mut Queue) -> Result<()> {
        info!(queue = %queue.spec.name, "Mock test triggered");
        queue.status_mut().test_runners = Some(TestRunnerStatus {
            name: MOCK_RUNNER.to_string(),
            ..Default::default()
        });
        Ok(())
    }

    async fn get_result(&self, config: &TestRunnerConfig, _queue: &Queue) -> Result<TestResult> {
        let success = config.mock.as_ref().map(|m| m.result).unwrap_or(true);
        Ok(TestResult::finished(success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_common::config::MockTestConfig;
    use stagehand_common::crd::{QueueSpec, QueueType};

    #[tokio::test]
    async fn reports_the_configured_outcome() {
        let mut queue = Queue::new(
            "redis",
            QueueSpec::new("redis", "bitnami/redis", "5.0.5-r1", QueueType::Upgrade),
        );
        let config = TestRunnerConfig {
            mock: Some(MockTestConfig { result: false }),
            ..Default::default()
        };

        MockTestRunner.trigger(&config, &mut queue).await.unwrap();
        assert_eq!(
            queue.status.as_ref().and_then(|s| s.test_runners.as_ref()).map(|t| t.name.as_str()),
            Some(MOCK_RUNNER)
        );
        assert_eq!(
            MockTestRunner.get_result(&config, &queue).await.unwrap(),
            TestResult::finished(false)
        );
    }
}

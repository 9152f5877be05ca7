//! Helm deploy engine
//!
//! Drives the `helm` CLI. Values are passed with one `--set-json` flag per
//! top-level key so nothing is written to disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stagehand_common::config::Component;
use stagehand_common::crd::Queue;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::DeployEngine;
use crate::{Result, StagingError};

/// Registry name of the helm engine
pub const HELM_ENGINE: &str = "helm";

/// Label helm charts put on every resource of a release
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Timeout of a single helm invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Output of an external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command exited successfully
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Trait for executing external commands (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, failing when it outlives `timeout`
    async fn run(&self, program: &str, args: &[String], timeout: Duration)
        -> Result<CommandOutput>;
}

/// Runs commands as child processes
#[derive(Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| StagingError::Timeout {
                operation: "helm command",
                timeout,
            })?
            .map_err(|e| StagingError::engine(HELM_ENGINE, format!("failed to execute: {}", e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Whether a release is being installed or upgraded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseAction {
    Install,
    Upgrade,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    name: String,
    status: String,
    #[serde(default)]
    revision: String,
}

impl ReleaseEntry {
    fn action(&self) -> ReleaseAction {
        if self.revision.parse::<u32>().unwrap_or(1) <= 1 {
            ReleaseAction::Install
        } else {
            ReleaseAction::Upgrade
        }
    }
}

/// Readiness of one release.
///
/// A failed first install is left for helm to retry; a failed upgrade is an
/// error because the previous revision is still running.
pub(crate) fn release_ready(action: ReleaseAction, name: &str, status: &str) -> Result<bool> {
    match (action, status) {
        (_, "deployed") => Ok(true),
        (ReleaseAction::Upgrade, "failed") => Err(StagingError::engine(
            HELM_ENGINE,
            format!("upgrade of release {} failed", name),
        )),
        _ => Ok(false),
    }
}

/// Deploy engine backed by the helm CLI
pub struct HelmEngine {
    namespace: String,
    binary: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl HelmEngine {
    /// Helm engine for `namespace` running the `helm` binary
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_runner(namespace, Arc::new(ProcessRunner))
    }

    /// Helm engine with a custom command runner
    pub fn with_runner(namespace: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            namespace: namespace.into(),
            binary: HELM_ENGINE.to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            runner,
        }
    }

    /// Override the helm binary path
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn helm(&self, args: Vec<String>) -> Result<CommandOutput> {
        debug!(args = ?args, "Running helm");
        self.runner.run(&self.binary, &args, self.timeout).await
    }

    fn install_args(
        &self,
        release: &str,
        chart: &Component,
        values: &serde_json::Value,
    ) -> Result<Vec<String>> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            release.to_string(),
            chart.chart.name.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        if !chart.chart.repository.is_empty() {
            args.push("--repo".to_string());
            args.push(chart.chart.repository.clone());
        }
        if !chart.chart.version.is_empty() {
            args.push("--version".to_string());
            args.push(chart.chart.version.clone());
        }
        if let serde_json::Value::Object(map) = values {
            for (key, value) in map {
                args.push("--set-json".to_string());
                args.push(format!("{}={}", key, serde_json::to_string(value)?));
            }
        }
        Ok(args)
    }
}

#[async_trait]
impl DeployEngine for HelmEngine {
    fn name(&self) -> &str {
        HELM_ENGINE
    }

    async fn create(
        &self,
        release: &str,
        component: &Component,
        parent: Option<&Component>,
        values: &serde_json::Value,
    ) -> Result<()> {
        let chart = parent.unwrap_or(component);
        let args = self.install_args(release, chart, values)?;
        let output = self.helm(args).await?;
        if !output.success {
            return Err(StagingError::engine(HELM_ENGINE, output.stderr.trim()));
        }
        info!(release, chart = %chart.chart.name, "Helm release applied");
        Ok(())
    }

    async fn delete(&self, release: &str) -> Result<()> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        let output = self.helm(args).await?;
        if output.success {
            info!(release, "Helm release uninstalled");
            return Ok(());
        }
        if output.stderr.contains("not found") {
            debug!(release, "Helm release already gone");
            return Ok(());
        }
        Err(StagingError::engine(HELM_ENGINE, output.stderr.trim()))
    }

    async fn is_ready(&self, queue: &Queue) -> Result<bool> {
        let args = vec![
            "list".to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--all".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let output = self.helm(args).await?;
        if !output.success {
            return Err(StagingError::engine(HELM_ENGINE, output.stderr.trim()));
        }

        let releases: Vec<ReleaseEntry> = serde_json::from_str(output.stdout.trim())?;
        for release in &releases {
            if !release_ready(release.action(), &release.name, &release.status)? {
                debug!(
                    queue = %queue.spec.name,
                    release = %release.name,
                    status = %release.status,
                    "Helm release not ready"
                );
                return Ok(false);
            }
        }
        if releases.is_empty() {
            warn!(queue = %queue.spec.name, "No helm releases found");
        }
        Ok(true)
    }

    fn label_selectors(&self, release: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(INSTANCE_LABEL.to_string(), release.to_string())])
    }

    fn is_mocked(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_common::config::ChartSpec;
    use stagehand_common::crd::{QueueSpec, QueueType};

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn wordpress() -> Component {
        Component {
            name: "wordpress".to_string(),
            chart: ChartSpec {
                repository: "https://charts.bitnami.com/bitnami".to_string(),
                name: "wordpress".to_string(),
                version: "9.0.3".to_string(),
            },
            ..Default::default()
        }
    }

    fn queue() -> Queue {
        Queue::new(
            "wordpress",
            QueueSpec::new("wordpress", "bitnami/wordpress", "5.2", QueueType::Upgrade),
        )
    }

    #[tokio::test]
    async fn create_installs_the_parent_chart_with_json_values() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "helm"
                    && args[..4] == ["upgrade", "--install", "payments-s2h-wordpress", "wordpress"]
                    && args.contains(&"--repo".to_string())
                    && args.contains(&"--version".to_string())
                    && args.contains(&r#"mariadb={"image":{"tag":"10.3"}}"#.to_string())
            })
            .times(1)
            .returning(|_, _, _| Ok(ok("")));

        let engine = HelmEngine::with_runner("s2h", Arc::new(runner));
        let mariadb = Component {
            name: "mariadb".to_string(),
            parent: Some("wordpress".to_string()),
            ..Default::default()
        };

        engine
            .create(
                "payments-s2h-wordpress",
                &mariadb,
                Some(&wordpress()),
                &serde_json::json!({"mariadb": {"image": {"tag": "10.3"}}}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_tolerates_missing_releases() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(failed("Error: uninstall: Release not loaded: x: release: not found")));

        let engine = HelmEngine::with_runner("s2h", Arc::new(runner));
        assert!(engine.delete("x").await.is_ok());
    }

    #[tokio::test]
    async fn delete_surfaces_other_failures() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(failed("Error: Kubernetes cluster unreachable")));

        let engine = HelmEngine::with_runner("s2h", Arc::new(runner));
        assert!(matches!(
            engine.delete("x").await,
            Err(StagingError::Engine { .. })
        ));
    }

    #[tokio::test]
    async fn readiness_waits_for_every_release() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _, _| {
            Ok(ok(r#"[
                {"name":"a","status":"deployed","revision":"1"},
                {"name":"b","status":"pending-install","revision":"1"}
            ]"#))
        });

        let engine = HelmEngine::with_runner("s2h", Arc::new(runner));
        assert!(!engine.is_ready(&queue()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_upgrade_is_an_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(ok(r#"[{"name":"a","status":"failed","revision":"3"}]"#)));

        let engine = HelmEngine::with_runner("s2h", Arc::new(runner));
        assert!(engine.is_ready(&queue()).await.is_err());
    }

    #[test]
    fn install_and_upgrade_differ_only_on_failure() {
        assert!(release_ready(ReleaseAction::Install, "a", "deployed").unwrap());
        assert!(!release_ready(ReleaseAction::Install, "a", "failed").unwrap());
        assert!(release_ready(ReleaseAction::Upgrade, "a", "failed").is_err());
        assert!(!release_ready(ReleaseAction::Upgrade, "a", "pending-upgrade").unwrap());
    }

    #[test]
    fn selectors_use_the_instance_label() {
        let engine = HelmEngine::new("s2h");
        assert_eq!(
            engine.label_selectors("r").get(INSTANCE_LABEL).map(String::as_str),
            Some("r")
        );
        assert!(!engine.is_mocked());
    }
}

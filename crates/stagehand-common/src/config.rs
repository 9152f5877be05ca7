//! Tenant configuration
//!
//! A team's configuration names the components of its stack, how they are
//! deployed, how they are tested, and which values each environment
//! overrides. The controller never loads it by itself: the peer pushes new
//! revisions through `UpdateConfiguration`, and the operator may seed one from
//! a file at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crd::QueueType;
use crate::{Error, Result};

/// Default time a deployment may take before the run is failed
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default time a test may take before the run is failed
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default interval between test result polls
pub const DEFAULT_TEST_POLLING: Duration = Duration::from_secs(5);
/// Default time stale resources may linger before they are force-deleted
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Default number of failed runs before a queue is converted to a reverify
pub const DEFAULT_MAX_RETRY: u32 = 3;

fn default_deploy_timeout_seconds() -> u64 {
    DEFAULT_DEPLOY_TIMEOUT.as_secs()
}

fn default_test_timeout_seconds() -> u64 {
    DEFAULT_TEST_TIMEOUT.as_secs()
}

fn default_polling_seconds() -> u64 {
    DEFAULT_TEST_POLLING.as_secs()
}

fn default_cleanup_timeout_seconds() -> u64 {
    DEFAULT_CLEANUP_TIMEOUT.as_secs()
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_true() -> bool {
    true
}

/// Environment a value override applies to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EnvType {
    /// Staging namespace (upgrade and reverify runs)
    Staging,
    /// Pre-active namespace
    PreActive,
    /// Active namespace (promotion and demotion swaps)
    Active,
}

impl EnvType {
    /// Environment whose overrides a queue of this type deploys with
    pub fn for_queue(queue_type: QueueType) -> Self {
        match queue_type {
            QueueType::Upgrade | QueueType::Reverify => Self::Staging,
            QueueType::PreActive => Self::PreActive,
            QueueType::PromoteToActive | QueueType::DemoteFromActive => Self::Active,
        }
    }
}

/// Complete configuration of one team
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Top-level components with their dependencies
    #[serde(default)]
    pub components: Vec<Component>,

    /// Staging run settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging: Option<StagingConfig>,

    /// Pre-active and active run settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_promotion: Option<ActivePromotionConfig>,

    /// Per-environment value overrides keyed by component name
    #[serde(default)]
    pub envs: BTreeMap<EnvType, BTreeMap<String, serde_json::Value>>,
}

/// A deployable component
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Component name
    pub name: String,

    /// Parent component when this one is deployed as part of another chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Chart coordinates
    #[serde(default)]
    pub chart: ChartSpec,

    /// Image the component runs
    #[serde(default)]
    pub image: ComponentImage,

    /// Chart values
    #[serde(default)]
    pub values: serde_json::Value,

    /// Components deployed inside this component's chart
    #[serde(default)]
    pub dependencies: Vec<Component>,
}

impl Component {
    /// Find this component or one of its dependencies by name
    pub fn find(&self, name: &str) -> Option<&Component> {
        if self.name == name {
            return Some(self);
        }
        self.dependencies.iter().find_map(|d| d.find(name))
    }
}

/// Chart coordinates of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart repository URL
    #[serde(default)]
    pub repository: String,
    /// Chart name
    #[serde(default)]
    pub name: String,
    /// Chart version (latest when empty)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Image coordinates of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentImage {
    /// Image repository
    #[serde(default)]
    pub repository: String,
    /// Default tag
    #[serde(default)]
    pub tag: String,
    /// Tag pattern the version checker matches against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
}

/// Staging run settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StagingConfig {
    /// How staging runs deploy and test
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Failed runs tolerated before a queue turns into a reverify
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentConfig::default(),
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

/// Pre-active and active run settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionConfig {
    /// How promotion runs deploy and test (staging's settings when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,
}

/// How a run deploys and tests
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Seconds a deployment may take
    #[serde(default = "default_deploy_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Seconds stale resources may linger before they are force-deleted
    #[serde(default = "default_cleanup_timeout_seconds")]
    pub component_cleanup_timeout_seconds: u64,

    /// Deploy engine name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Test to run after a successful deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_runner: Option<TestRunnerConfig>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_deploy_timeout_seconds(),
            component_cleanup_timeout_seconds: default_cleanup_timeout_seconds(),
            engine: None,
            test_runner: None,
        }
    }
}

impl DeploymentConfig {
    /// Deployment timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Cleanup force-timeout
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.component_cleanup_timeout_seconds)
    }
}

/// Test settings of a deployment context
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestRunnerConfig {
    /// Seconds a test may take
    #[serde(default = "default_test_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Seconds between result polls
    #[serde(default = "default_polling_seconds")]
    pub polling_seconds: u64,

    /// Trigger and poll an HTTP test service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpTestConfig>,

    /// Report a fixed result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock: Option<MockTestConfig>,
}

impl Default for TestRunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_test_timeout_seconds(),
            polling_seconds: default_polling_seconds(),
            http: None,
            mock: None,
        }
    }
}

impl TestRunnerConfig {
    /// Test timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Result polling interval
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_seconds)
    }
}

/// HTTP test service coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpTestConfig {
    /// URL a POST to which starts a test execution
    pub trigger_url: String,
    /// URL polled for `{finished, success}`
    pub result_url: String,
    /// Extra headers sent with both requests
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Fixed test outcome
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockTestConfig {
    /// Outcome to report
    #[serde(default = "default_true")]
    pub result: bool,
}

impl Default for MockTestConfig {
    fn default() -> Self {
        Self { result: true }
    }
}

impl Config {
    /// Parse a configuration document (YAML or JSON)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Deployment context a queue of this type runs under
    pub fn deployment_for(&self, queue_type: QueueType) -> Option<&DeploymentConfig> {
        let staging = self.staging.as_ref().map(|s| &s.deployment);
        match queue_type {
            QueueType::Upgrade | QueueType::Reverify => staging,
            _ => self
                .active_promotion
                .as_ref()
                .and_then(|a| a.deployment.as_ref())
                .or(staging),
        }
    }

    /// Failed runs tolerated before a queue turns into a reverify
    pub fn max_retry(&self) -> u32 {
        self.staging
            .as_ref()
            .map(|s| s.max_retry)
            .unwrap_or(DEFAULT_MAX_RETRY)
    }

    /// Top-level components keyed by name
    pub fn parent_components(&self) -> BTreeMap<String, Component> {
        self.components
            .iter()
            .filter(|c| c.parent.is_none())
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }

    /// Find a component at any depth
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find_map(|c| c.find(name))
    }

    /// Top-level component that deploys the named component
    pub fn root_of(&self, name: &str) -> Option<&Component> {
        self.locate(name).map(|(root, _)| root)
    }

    /// Top-level component that deploys the named component, and the chain
    /// of dependency names leading from it to the component.
    ///
    /// A dependency is either nested under `dependencies` or listed on its
    /// own with `parent` set. Cyclic parents resolve to `None`.
    pub fn locate(&self, name: &str) -> Option<(&Component, Vec<String>)> {
        let mut path: Vec<String> = Vec::new();
        let mut current = name.to_string();

        for _ in 0..=self.components.len() {
            let top = self.components.iter().find(|c| c.find(&current).is_some())?;
            let mut nested = nested_path(top, &current).unwrap_or_default();
            nested.append(&mut path);
            path = nested;

            match &top.parent {
                Some(parent) => {
                    path.insert(0, top.name.clone());
                    current = parent.clone();
                }
                None => return Some((top, path)),
            }
        }
        None
    }

    /// Every component name, dependencies included
    pub fn component_names(&self) -> Vec<String> {
        fn walk(component: &Component, out: &mut Vec<String>) {
            out.push(component.name.clone());
            for dependency in &component.dependencies {
                walk(dependency, out);
            }
        }
        let mut out = Vec::new();
        for component in &self.components {
            walk(component, &mut out);
        }
        out
    }

    /// Value override for a component in an environment
    pub fn env_values(&self, env: EnvType, component: &str) -> Option<&serde_json::Value> {
        self.envs.get(&env).and_then(|m| m.get(component))
    }
}

/// Names from `top`'s direct dependency down to `name` (empty when `top` is
/// the component itself)
fn nested_path(top: &Component, name: &str) -> Option<Vec<String>> {
    if top.name == name {
        return Some(Vec::new());
    }
    top.dependencies.iter().find_map(|d| {
        nested_path(d, name).map(|mut rest| {
            rest.insert(0, d.name.clone());
            rest
        })
    })
}

// =============================================================================
// ConfigSource
// =============================================================================

/// Read access to tenant configuration
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Configuration of a team
    async fn get(&self, team: &str) -> Result<Arc<Config>>;

    /// Top-level components of a team keyed by name
    async fn get_parent_components(&self, team: &str) -> Result<BTreeMap<String, Component>> {
        Ok(self.get(team).await?.parent_components())
    }
}

struct Revisioned {
    config: Arc<Config>,
    revision: i64,
}

/// Configuration of the controller's team, replaced whole on every accepted
/// revision.
pub struct SharedConfig {
    team: String,
    current: RwLock<Option<Revisioned>>,
}

impl SharedConfig {
    /// Empty configuration holder for a team
    pub fn new(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            current: RwLock::new(None),
        }
    }

    /// Holder seeded with a configuration at revision 0
    pub fn with_config(team: impl Into<String>, config: Config) -> Self {
        let shared = Self::new(team);
        shared.update(config, 0);
        shared
    }

    /// Team this holder serves
    pub fn team(&self) -> &str {
        &self.team
    }

    /// Replace the configuration if `revision` is newer than the held one.
    ///
    /// Returns whether the configuration was replaced.
    pub fn update(&self, config: Config, revision: i64) -> bool {
        let mut current = self.current.write();
        if let Some(held) = current.as_ref() {
            if revision <= held.revision {
                debug!(
                    team = %self.team,
                    revision,
                    held = held.revision,
                    "Ignoring stale configuration revision"
                );
                return false;
            }
        }
        info!(team = %self.team, revision, "Configuration updated");
        *current = Some(Revisioned {
            config: Arc::new(config),
            revision,
        });
        true
    }

    /// Revision of the held configuration
    pub fn revision(&self) -> Option<i64> {
        self.current.read().as_ref().map(|r| r.revision)
    }

    /// Held configuration
    pub fn snapshot(&self) -> Option<Arc<Config>> {
        self.current.read().as_ref().map(|r| r.config.clone())
    }
}

#[async_trait]
impl ConfigSource for SharedConfig {
    async fn get(&self, team: &str) -> Result<Arc<Config>> {
        if !team.is_empty() && team != self.team {
            return Err(Error::configuration(
                team,
                format!("controller serves team {}", self.team),
            ));
        }
        self.snapshot()
            .ok_or_else(|| Error::configuration(team, "no configuration loaded"))
    }
}

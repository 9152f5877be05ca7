//! Shared state of the phase handlers

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use stagehand_common::config::{Config, ConfigSource, DeploymentConfig};
use stagehand_common::crd::Queue;
use stagehand_common::kube_utils::label_selector;
use stagehand_rpc::PeerClient;

use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::engine::{DeployEngine, EngineRegistry, HelmEngine};
use crate::store::{KubeQueueStore, QueueStore};
use crate::testrunner::RunnerRegistry;
use crate::Result;

/// Dispatch loop intervals
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    /// Sleep when no queue is eligible
    pub idle: Duration,
    /// Upper bound of the random delay added to `idle`
    pub idle_jitter: Duration,
    /// Sleep while a phase waits on the cluster
    pub wait: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(2),
            idle_jitter: Duration::from_secs(1),
            wait: Duration::from_secs(2),
        }
    }
}

/// Everything a phase handler needs
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, namespace, team, config, peer).build()?;
/// ```
pub struct Context {
    /// Tenant namespace
    pub namespace: String,
    /// Team the controller serves
    pub team: String,
    /// Queue persistence
    pub store: Arc<dyn QueueStore>,
    /// Cluster reads and deletes
    pub cluster: Arc<dyn ClusterClient>,
    /// Tenant configuration
    pub config: Arc<dyn ConfigSource>,
    /// Peer service
    pub peer: Arc<dyn PeerClient>,
    /// Deploy engines
    pub engines: EngineRegistry,
    /// Test runners
    pub runners: RunnerRegistry,
    /// Loop intervals
    pub timings: Timings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        namespace: impl Into<String>,
        team: impl Into<String>,
        config: Arc<dyn ConfigSource>,
        peer: Arc<dyn PeerClient>,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            namespace: namespace.into(),
            team: team.into(),
            config,
            peer,
            store: None,
            cluster: None,
            engines: None,
            runners: None,
            timings: Timings::default(),
        }
    }

    /// Create a context for testing with in-memory collaborators
    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    pub fn for_testing(
        namespace: &str,
        team: &str,
        store: Arc<dyn QueueStore>,
        cluster: Arc<dyn ClusterClient>,
        config: Arc<dyn ConfigSource>,
        peer: Arc<dyn PeerClient>,
        engines: EngineRegistry,
        runners: RunnerRegistry,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            team: team.to_string(),
            store,
            cluster,
            config,
            peer,
            engines,
            runners,
            timings: Timings {
                idle: Duration::ZERO,
                idle_jitter: Duration::ZERO,
                wait: Duration::ZERO,
            },
        }
    }

    /// Persist the queue's status and adopt the stored copy
    pub async fn save(&self, queue: &mut Queue) -> Result<()> {
        *queue = self.store.update_status(queue).await?;
        Ok(())
    }

    /// Current configuration of the team
    pub async fn team_config(&self) -> Result<Arc<Config>> {
        Ok(self.config.get(&self.team).await?)
    }

    /// Team of a queue (the controller's own when the queue names none)
    pub fn team_of<'a>(&'a self, queue: &'a Queue) -> &'a str {
        if queue.spec.team_name.is_empty() {
            &self.team
        } else {
            &queue.spec.team_name
        }
    }

    /// Deployment context of a queue, defaults when none is configured
    pub fn deployment(&self, config: &Config, queue: &Queue) -> DeploymentConfig {
        config
            .deployment_for(queue.spec.type_)
            .cloned()
            .unwrap_or_default()
    }

    /// Engine a queue deploys with
    pub fn engine(&self, config: &Config, queue: &Queue) -> Arc<dyn DeployEngine> {
        let pinned = queue
            .status
            .as_ref()
            .map(|s| s.deploy_engine.as_str())
            .unwrap_or_default();
        let deployment = config.deployment_for(queue.spec.type_);
        self.engines
            .resolve(pinned, deployment.and_then(|d| d.engine.as_deref()))
    }

    /// Release names of the team's top-level components
    pub fn releases(&self, config: &Config, queue: &Queue) -> Vec<String> {
        let team = self.team_of(queue);
        config
            .parent_components()
            .keys()
            .map(|name| stagehand_common::release_name(team, &self.namespace, name))
            .collect()
    }

    /// Label selectors of the team's top-level releases
    pub fn selectors(&self, config: &Config, queue: &Queue) -> Vec<String> {
        let engine = self.engine(config, queue);
        self.releases(config, queue)
            .iter()
            .map(|release| label_selector(&engine.label_selectors(release)))
            .collect()
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    namespace: String,
    team: String,
    config: Arc<dyn ConfigSource>,
    peer: Arc<dyn PeerClient>,
    store: Option<Arc<dyn QueueStore>>,
    cluster: Option<Arc<dyn ClusterClient>>,
    engines: Option<EngineRegistry>,
    runners: Option<RunnerRegistry>,
    timings: Timings,
}

impl ContextBuilder {
    /// Override the queue store
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the cluster client
    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Override the deploy engines (helm and mock by default)
    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Override the test runners (http and mock by default)
    pub fn runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Some(runners);
        self
    }

    /// Override the loop intervals
    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let runners = match self.runners {
            Some(runners) => runners,
            None => RunnerRegistry::with_builtin()?,
        };
        let engines = self.engines.unwrap_or_else(|| {
            EngineRegistry::new().register(Arc::new(HelmEngine::new(self.namespace.clone())))
        });

        Ok(Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeQueueStore::new(self.client.clone(), &self.namespace))),
            cluster: self
                .cluster
                .unwrap_or_else(|| Arc::new(KubeClusterClient::new(self.client.clone()))),
            namespace: self.namespace,
            team: self.team,
            config: self.config,
            peer: self.peer,
            engines,
            runners,
            timings: self.timings,
        })
    }
}

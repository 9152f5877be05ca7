//! Deploy engines
//!
//! An engine materializes and destroys named releases. The controller never
//! knows which one it drives: it resolves a name through [`EngineRegistry`]
//! and talks to the [`DeployEngine`] contract.

mod helm;
mod mock;

pub use helm::{CommandOutput, CommandRunner, HelmEngine, ProcessRunner, HELM_ENGINE};
pub use mock::{MockEngine, MOCK_ENGINE};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use stagehand_common::config::Component;
use stagehand_common::crd::Queue;
use tracing::debug;

use crate::Result;

/// Contract every deploy engine implements
#[async_trait]
pub trait DeployEngine: Send + Sync {
    /// Registry name of the engine
    fn name(&self) -> &str;

    /// Install or upgrade `release`.
    ///
    /// When `parent` is set the component is deployed inside the parent's
    /// chart and `values` are the parent's values.
    async fn create(
        &self,
        release: &str,
        component: &Component,
        parent: Option<&Component>,
        values: &serde_json::Value,
    ) -> Result<()>;

    /// Remove `release` (no-op when it does not exist)
    async fn delete(&self, release: &str) -> Result<()>;

    /// Whether the engine considers the queue's releases rolled out
    async fn is_ready(&self, queue: &Queue) -> Result<bool>;

    /// Labels carried by every resource of `release`
    fn label_selectors(&self, release: &str) -> BTreeMap<String, String>;

    /// Whether the engine only pretends to deploy
    fn is_mocked(&self) -> bool;
}

/// Deploy engines by name with a mock fallback
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn DeployEngine>>,
    fallback: Arc<dyn DeployEngine>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// Registry holding only the mock engine
    pub fn new() -> Self {
        Self::with_mock(Arc::new(MockEngine::new()))
    }

    /// Registry holding only the given mock engine
    pub fn with_mock(mock: Arc<MockEngine>) -> Self {
        let mock: Arc<dyn DeployEngine> = mock;
        let mut engines = BTreeMap::new();
        engines.insert(MOCK_ENGINE.to_string(), mock.clone());
        Self {
            engines,
            fallback: mock,
        }
    }

    /// Add an engine under its own name
    pub fn register(mut self, engine: Arc<dyn DeployEngine>) -> Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    /// Engine for a queue: the one pinned on its status, else the configured
    /// one, else the mock.
    pub fn resolve(&self, pinned: &str, configured: Option<&str>) -> Arc<dyn DeployEngine> {
        let name = if pinned.is_empty() {
            configured.unwrap_or_default()
        } else {
            pinned
        };

        match self.engines.get(name) {
            Some(engine) => engine.clone(),
            None => {
                debug!(engine = %name, fallback = MOCK_ENGINE, "Deploy engine not found, using mock");
                self.fallback.clone()
            }
        }
    }
}

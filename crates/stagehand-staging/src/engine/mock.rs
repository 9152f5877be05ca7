//! No-op deploy engine

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_common::config::Component;
use stagehand_common::crd::Queue;
use tracing::info;

use super::DeployEngine;
use crate::Result;

/// Registry name of the mock engine
pub const MOCK_ENGINE: &str = "mock";

/// Engine that deploys nothing and is always ready.
///
/// Releases it was asked about are remembered so runs can be inspected.
#[derive(Default)]
pub struct MockEngine {
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MockEngine {
    /// Create a mock engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases created so far, in call order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Releases deleted so far, in call order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl DeployEngine for MockEngine {
    fn name(&self) -> &str {
        MOCK_ENGINE
    }

    async fn create(
        &self,
        release: &str,
        component: &Component,
        parent: Option<&Component>,
        _values: &serde_json::Value,
    ) -> Result<()> {
        info!(
            release,
            component = %component.name,
            parent = parent.map(|p| p.name.as_str()).unwrap_or_default(),
            "Mock deploy"
        );
        self.created.lock().push(release.to_string());
        Ok(())
    }

    async fn delete(&self, release: &str) -> Result<()> {
        self.deleted.lock().push(release.to_string());
        Ok(())
    }

    async fn is_ready(&self, _queue: &Queue) -> Result<bool> {
        Ok(true)
    }

    fn label_selectors(&self, release: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("release".to_string(), release.to_string())])
    }

    fn is_mocked(&self) -> bool {
        true
    }
}

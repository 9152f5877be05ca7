//! In-memory collaborators for driving whole queue lifecycles in tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodStatus, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use stagehand_common::config::{Config, SharedConfig};
use stagehand_common::crd::{
    Image, Queue, QueueHistory, QueueHistorySpec, QueueSpec, QueueState, QueueType,
    StableComponent, StableComponentSpec,
};
use stagehand_rpc::types::{ComponentUpgradeReport, ComponentVersion};
use stagehand_rpc::PeerClient;

use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::engine::{EngineRegistry, MockEngine};
use crate::store::{apply_retry, apply_reverify_at_first, order_bounds, pick_first, QueueStore};
use crate::testrunner::{MockTestRunner, RunnerRegistry};
use crate::{Result, StagingError};

pub const NAMESPACE: &str = "s2h-payments";
pub const TEAM: &str = "payments";

const SAMPLE_CONFIG: &str = r#"
components:
  - name: redis
    chart:
      repository: https://charts.bitnami.com/bitnami
      name: redis
    image:
      repository: bitnami/redis
      tag: 5.0.5-debian-9-r160
  - name: wordpress
    chart:
      repository: https://charts.bitnami.com/bitnami
      name: wordpress
    image:
      repository: bitnami/wordpress
      tag: 5.2.4-debian-9-r18
    dependencies:
      - name: mariadb
        parent: wordpress
        image:
          repository: bitnami/mariadb
          tag: 10.3.18-debian-9-r32
staging:
  maxRetry: 2
  deployment:
    engine: mock
    componentCleanupTimeoutSeconds: 120
    testRunner:
      mock:
        result: true
"#;

pub fn sample_config() -> Config {
    Config::from_slice(SAMPLE_CONFIG.as_bytes()).unwrap()
}

pub fn upgrade_queue(name: &str, version: &str) -> Queue {
    Queue::new(
        name,
        QueueSpec::new(name, format!("bitnami/{}", name), version, QueueType::Upgrade)
            .with_team(TEAM),
    )
}

pub fn promotion_queue(type_: QueueType) -> Queue {
    let name = match type_ {
        QueueType::DemoteFromActive => crate::DEMOTE_FROM_ACTIVE_QUEUE,
        _ => crate::PROMOTE_TO_ACTIVE_QUEUE,
    };
    Queue::new(name, QueueSpec::new(name, "", "", type_).with_team(TEAM))
}

/// Running, not ready pod carrying one label
pub fn labelled_pod(name: &str, key: &str, value: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn selects(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
pub struct FakeStore {
    queues: Mutex<BTreeMap<String, Queue>>,
    visited: Mutex<BTreeMap<String, Vec<QueueState>>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeStore {
    fn record(&self, queue: &Queue) {
        let mut visited = self.visited.lock();
        let states = visited.entry(queue.name_any()).or_default();
        if states.last() != Some(&queue.state()) {
            states.push(queue.state());
        }
    }

    pub fn put(&self, queue: Queue) {
        self.record(&queue);
        self.queues.lock().insert(queue.name_any(), queue);
    }

    pub fn remove(&self, name: &str) {
        self.queues.lock().remove(name);
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.queues.lock().get(name).cloned()
    }

    /// States a queue was persisted in, in order
    pub fn visited(&self, name: &str) -> Vec<QueueState> {
        self.visited.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    fn rewrite(&self, name: &str, apply: impl FnOnce(&mut Queue, &[Queue])) -> Result<()> {
        let all: Vec<Queue> = self.queues.lock().values().cloned().collect();
        let mut queue = self
            .queue(name)
            .ok_or_else(|| StagingError::QueueNotFound(name.to_string()))?;
        apply(&mut queue, &all);
        self.put(queue);
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FakeStore {
    async fn first(&self) -> Result<Option<Queue>> {
        let queues: Vec<Queue> = self.queues.lock().values().cloned().collect();
        Ok(pick_first(&queues, Utc::now()).cloned())
    }

    async fn get(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self.queue(name))
    }

    async fn update_status(&self, queue: &Queue) -> Result<Queue> {
        let name = queue.name_any();
        let mut stored = self
            .queue(&name)
            .ok_or_else(|| StagingError::QueueNotFound(name.clone()))?;
        stored.status = queue.status.clone();
        self.put(stored.clone());
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.remove(name);
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn set_retry_queue(
        &self,
        queue: &Queue,
        no_of_retry: u32,
        next_process_at: DateTime<Utc>,
    ) -> Result<()> {
        let name = queue.name_any();
        self.rewrite(&name, |q, all| {
            let (_, last) = order_bounds(all, &name);
            apply_retry(q, no_of_retry, next_process_at, last);
        })
    }

    async fn set_reverify_queue_at_first(&self, queue: &Queue) -> Result<()> {
        let name = queue.name_any();
        self.rewrite(&name, |q, all| {
            let (first, _) = order_bounds(all, &name);
            apply_reverify_at_first(q, first);
        })
    }
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<Vec<Pod>>,
    stable: Mutex<BTreeMap<String, StableComponentSpec>>,
    histories: Mutex<BTreeMap<String, QueueHistorySpec>>,
    force_deleted: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().push(pod);
    }

    pub fn clear_pods(&self) {
        self.pods.lock().clear();
    }

    /// Selectors workloads were force-deleted with
    pub fn force_deleted(&self) -> Vec<String> {
        self.force_deleted.lock().clone()
    }

    pub fn stable(&self, name: &str) -> Option<StableComponentSpec> {
        self.stable.lock().get(name).cloned()
    }

    pub fn history(&self, name: &str) -> Option<QueueHistorySpec> {
        self.histories.lock().get(name).cloned()
    }

    pub fn history_count(&self) -> usize {
        self.histories.lock().len()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .iter()
            .filter(|p| selects(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_services(&self, _namespace: &str, _selector: &str) -> Result<Vec<Service>> {
        Ok(Vec::new())
    }

    async fn list_pvcs(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(Vec::new())
    }

    async fn list_deployments(&self, _namespace: &str, _selector: &str) -> Result<Vec<Deployment>> {
        Ok(Vec::new())
    }

    async fn force_delete_workloads(&self, _namespace: &str, selector: &str) -> Result<()> {
        self.force_deleted.lock().push(selector.to_string());
        self.pods.lock().retain(|p| !selects(p.labels(), selector));
        Ok(())
    }

    async fn delete_services(&self, _namespace: &str, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_pvcs(&self, _namespace: &str, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        _previous: bool,
    ) -> Result<String> {
        Ok(String::new())
    }

    async fn list_stable_components(&self, _namespace: &str) -> Result<Vec<StableComponent>> {
        Ok(self
            .stable
            .lock()
            .values()
            .map(|spec| StableComponent::new(&spec.name, spec.clone()))
            .collect())
    }

    async fn upsert_stable_component(
        &self,
        _namespace: &str,
        spec: &StableComponentSpec,
    ) -> Result<()> {
        self.stable.lock().insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn get_queue_history(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<QueueHistory>> {
        Ok(self
            .histories
            .lock()
            .get(name)
            .map(|spec| QueueHistory::new(name, spec.clone())))
    }

    async fn create_queue_history(
        &self,
        _namespace: &str,
        name: &str,
        spec: &QueueHistorySpec,
    ) -> Result<()> {
        self.histories
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| spec.clone());
        Ok(())
    }
}

// =============================================================================
// Peer
// =============================================================================

#[derive(Default)]
pub struct FakePeer {
    missing: Mutex<Vec<Image>>,
    asked: Mutex<Vec<ComponentVersion>>,
    reports: Mutex<Vec<ComponentUpgradeReport>>,
    failures: AtomicU32,
}

impl FakePeer {
    /// Fail the next `n` report deliveries
    pub fn failing_reports(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_missing(&self, images: Vec<Image>) {
        *self.missing.lock() = images;
    }

    /// Components of the last missing-version request
    pub fn asked(&self) -> Vec<ComponentVersion> {
        self.asked.lock().clone()
    }

    pub fn reports(&self) -> Vec<ComponentUpgradeReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl PeerClient for FakePeer {
    async fn notify_component_upgrade(
        &self,
        report: &ComponentUpgradeReport,
    ) -> stagehand_rpc::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(stagehand_rpc::Error::PeerStatus {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.reports.lock().push(report.clone());
        Ok(())
    }

    async fn get_missing_versions(
        &self,
        _team: &str,
        components: &[ComponentVersion],
    ) -> stagehand_rpc::Result<Vec<Image>> {
        *self.asked.lock() = components.to_vec();
        Ok(self.missing.lock().clone())
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub struct Fixture {
    pub store: Arc<FakeStore>,
    pub cluster: Arc<FakeCluster>,
    pub peer: Arc<FakePeer>,
    pub engine: Arc<MockEngine>,
    pub config: Arc<SharedConfig>,
}

impl Fixture {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(FakeStore::default()),
            cluster: Arc::new(FakeCluster::default()),
            peer: Arc::new(FakePeer::default()),
            engine: Arc::new(MockEngine::new()),
            config: Arc::new(SharedConfig::with_config(TEAM, config)),
        }
    }

    /// Store a queue and return the stored copy
    pub fn insert(&self, queue: Queue) -> Queue {
        self.store.put(queue.clone());
        queue
    }
}

pub fn context_with_store(fixture: &Fixture, store: Arc<dyn QueueStore>) -> Context {
    Context::for_testing(
        NAMESPACE,
        TEAM,
        store,
        fixture.cluster.clone(),
        fixture.config.clone(),
        fixture.peer.clone(),
        EngineRegistry::with_mock(fixture.engine.clone()),
        RunnerRegistry::new().register(Arc::new(MockTestRunner)),
    )
}

pub fn test_context(fixture: &Fixture) -> Context {
    context_with_store(fixture, fixture.store.clone())
}

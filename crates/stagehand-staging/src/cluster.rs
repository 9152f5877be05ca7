//! Cluster access used by the phase handlers
//!
//! Everything the controller reads or deletes in the tenant namespace goes
//! through [`ClusterClient`] so that phases can be tested without an API
//! server.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use stagehand_common::crd::{QueueHistory, QueueHistorySpec, StableComponent, StableComponentSpec};
use stagehand_common::FIELD_MANAGER;

use crate::Result;

/// Trait abstracting the Kubernetes operations of the phase handlers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods matching a label selector (all pods when empty)
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// List services matching a label selector
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;

    /// List persistent volume claims matching a label selector
    async fn list_pvcs(&self, namespace: &str, selector: &str)
        -> Result<Vec<PersistentVolumeClaim>>;

    /// List deployments matching a label selector
    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;

    /// Delete deployments, stateful sets, daemon sets, and pods matching a
    /// selector with a zero grace period
    async fn force_delete_workloads(&self, namespace: &str, selector: &str) -> Result<()>;

    /// Delete services matching a selector
    async fn delete_services(&self, namespace: &str, selector: &str) -> Result<()>;

    /// Delete persistent volume claims matching a selector
    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> Result<()>;

    /// Logs of a container (of its previous instance when `previous`)
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String>;

    /// All stable components of the namespace
    async fn list_stable_components(&self, namespace: &str) -> Result<Vec<StableComponent>>;

    /// Create or update the stable component named `spec.name`
    async fn upsert_stable_component(
        &self,
        namespace: &str,
        spec: &StableComponentSpec,
    ) -> Result<()>;

    /// Get a history record by name
    async fn get_queue_history(&self, namespace: &str, name: &str)
        -> Result<Option<QueueHistory>>;

    /// Create a history record (no-op when it already exists)
    async fn create_queue_history(
        &self,
        namespace: &str,
        name: &str,
        spec: &QueueHistorySpec,
    ) -> Result<()>;
}

/// Real cluster client backed by kube-rs
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn selected(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

fn immediate() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        ..DeleteParams::background()
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self.api::<Pod>(namespace).list(&selected(selector)).await?.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        Ok(self.api::<Service>(namespace).list(&selected(selector)).await?.items)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.api::<PersistentVolumeClaim>(namespace).list(&selected(selector)).await?.items)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self.api::<Deployment>(namespace).list(&selected(selector)).await?.items)
    }

    async fn force_delete_workloads(&self, namespace: &str, selector: &str) -> Result<()> {
        let lp = selected(selector);
        let dp = immediate();
        debug!(namespace, selector, "Force deleting workloads");

        self.api::<Deployment>(namespace)
            .delete_collection(&dp, &lp)
            .await?;
        self.api::<StatefulSet>(namespace)
            .delete_collection(&dp, &lp)
            .await?;
        self.api::<DaemonSet>(namespace)
            .delete_collection(&dp, &lp)
            .await?;
        self.api::<Pod>(namespace).delete_collection(&dp, &lp).await?;
        Ok(())
    }

    async fn delete_services(&self, namespace: &str, selector: &str) -> Result<()> {
        // Services do not support deletecollection
        let api: Api<Service> = self.api(namespace);
        for svc in api.list(&selected(selector)).await?.items {
            if let Some(name) = svc.metadata.name {
                match api.delete(&name, &immediate()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> Result<()> {
        self.api::<PersistentVolumeClaim>(namespace)
            .delete_collection(&DeleteParams::background(), &selected(selector))
            .await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            previous,
            ..Default::default()
        };
        Ok(self.api::<Pod>(namespace).logs(pod, &params).await?)
    }

    async fn list_stable_components(&self, namespace: &str) -> Result<Vec<StableComponent>> {
        Ok(self
            .api::<StableComponent>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn upsert_stable_component(
        &self,
        namespace: &str,
        spec: &StableComponentSpec,
    ) -> Result<()> {
        let object = StableComponent::new(&spec.name, spec.clone());
        self.api::<StableComponent>(namespace)
            .patch(
                &spec.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await?;
        Ok(())
    }

    async fn get_queue_history(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<QueueHistory>> {
        Ok(self.api::<QueueHistory>(namespace).get_opt(name).await?)
    }

    async fn create_queue_history(
        &self,
        namespace: &str,
        name: &str,
        spec: &QueueHistorySpec,
    ) -> Result<()> {
        let object = QueueHistory::new(name, spec.clone());
        match self
            .api::<QueueHistory>(namespace)
            .create(&PostParams::default(), &object)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name, "Queue history already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

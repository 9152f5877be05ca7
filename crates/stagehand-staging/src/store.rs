//! Queue persistence and ordering
//!
//! Queues live as `Queue` objects in the tenant namespace. Ordering is the
//! `noOfOrder` field: the lowest eligible value is processed next, retries
//! move to the back, and reverify conversions jump to the front.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use stagehand_common::crd::{Queue, QueueState, QueueType};
use stagehand_common::FIELD_MANAGER;

use crate::{Result, StagingError};

/// Trait abstracting the queue store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Next queue to process, if any is eligible
    async fn first(&self) -> Result<Option<Queue>>;

    /// Read a queue by name
    async fn get(&self, name: &str) -> Result<Option<Queue>>;

    /// Persist the status of a queue and return the stored object
    async fn update_status(&self, queue: &Queue) -> Result<Queue>;

    /// Delete a queue (no-op when it is already gone)
    async fn delete(&self, name: &str) -> Result<()>;

    /// Reset a queue for another run at the back of the order
    async fn set_retry_queue(
        &self,
        queue: &Queue,
        no_of_retry: u32,
        next_process_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Convert a queue into a reverify run at the front of the order
    async fn set_reverify_queue_at_first(&self, queue: &Queue) -> Result<()>;
}

// =============================================================================
// Ordering rules
// =============================================================================

/// Whether a queue may be picked up at `now`
pub fn is_eligible(queue: &Queue, now: DateTime<Utc>) -> bool {
    queue.state() != QueueState::Finished
        && queue.spec.next_process_at.map(|t| t <= now).unwrap_or(true)
}

/// Eligible queue with the lowest order, ties broken by creation time
pub fn pick_first(queues: &[Queue], now: DateTime<Utc>) -> Option<&Queue> {
    queues
        .iter()
        .filter(|q| is_eligible(q, now))
        .min_by(|a, b| {
            a.spec
                .no_of_order
                .cmp(&b.spec.no_of_order)
                .then_with(|| a.creation_timestamp().cmp(&b.creation_timestamp()))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

/// Rewrite a queue for another run after every other queue
pub fn apply_retry(
    queue: &mut Queue,
    no_of_retry: u32,
    next_process_at: DateTime<Utc>,
    last_order: i32,
) {
    queue.spec.no_of_retry = no_of_retry;
    queue.spec.next_process_at = Some(next_process_at);
    queue.spec.no_of_order = last_order.saturating_add(1);

    let status = queue.status_mut();
    status.reset();
    status.no_of_processed += 1;
    status.next_process_at = Some(next_process_at);
}

/// Rewrite a queue as a reverify run ahead of every other queue
pub fn apply_reverify_at_first(queue: &mut Queue, first_order: i32) {
    queue.spec.type_ = QueueType::Reverify;
    queue.spec.no_of_retry = 0;
    queue.spec.next_process_at = None;
    queue.spec.no_of_order = first_order.saturating_sub(1);

    let status = queue.status_mut();
    status.reset();
    status.no_of_processed += 1;
}

pub(crate) fn order_bounds(queues: &[Queue], except: &str) -> (i32, i32) {
    let orders = queues
        .iter()
        .filter(|q| q.name_any() != except)
        .map(|q| q.spec.no_of_order);
    let first = orders.clone().min().unwrap_or(0);
    let last = orders.max().unwrap_or(0);
    (first, last)
}

// =============================================================================
// Kubernetes implementation
// =============================================================================

/// Queue store backed by `Queue` objects in one namespace
pub struct KubeQueueStore {
    api: Api<Queue>,
}

impl KubeQueueStore {
    /// Store for queues in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn list(&self) -> Result<Vec<Queue>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn fresh(&self, name: &str) -> Result<Queue> {
        self.api
            .get_opt(name)
            .await?
            .ok_or_else(|| StagingError::QueueNotFound(name.to_string()))
    }

    /// Write spec then status of a rewritten queue
    async fn replace(&self, queue: &Queue) -> Result<()> {
        let name = queue.name_any();
        let params = PatchParams::apply(FIELD_MANAGER);
        self.api
            .patch(
                &name,
                &params,
                &Patch::Merge(&serde_json::json!({ "spec": queue.spec })),
            )
            .await?;
        self.api
            .patch_status(
                &name,
                &params,
                &Patch::Merge(&serde_json::json!({ "status": queue.status })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for KubeQueueStore {
    async fn first(&self) -> Result<Option<Queue>> {
        let queues = self.list().await?;
        Ok(pick_first(&queues, Utc::now()).cloned())
    }

    async fn get(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn update_status(&self, queue: &Queue) -> Result<Queue> {
        let name = queue.name_any();
        let patch = serde_json::json!({ "status": queue.status });
        let updated = self
            .api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 404 => StagingError::QueueNotFound(name.clone()),
                e => e.into(),
            })?;
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(queue = %name, "Queue deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(queue = %name, "Queue already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_retry_queue(
        &self,
        queue: &Queue,
        no_of_retry: u32,
        next_process_at: DateTime<Utc>,
    ) -> Result<()> {
        let name = queue.name_any();
        let queues = self.list().await?;
        let (_, last) = order_bounds(&queues, &name);

        let mut fresh = self.fresh(&name).await?;
        apply_retry(&mut fresh, no_of_retry, next_process_at, last);
        self.replace(&fresh).await?;

        info!(
            queue = %name,
            no_of_retry,
            next_process_at = %next_process_at,
            "Queue rescheduled"
        );
        Ok(())
    }

    async fn set_reverify_queue_at_first(&self, queue: &Queue) -> Result<()> {
        let name = queue.name_any();
        let queues = self.list().await?;
        let (first, _) = order_bounds(&queues, &name);

        let mut fresh = self.fresh(&name).await?;
        apply_reverify_at_first(&mut fresh, first);
        self.replace(&fresh).await?;

        info!(queue = %name, "Queue converted to reverify at the front of the order");
        Ok(())
    }
}

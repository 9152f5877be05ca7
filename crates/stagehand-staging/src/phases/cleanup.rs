//! Cleanup before and after a run
//!
//! Releases of every top-level component are deleted once, then the
//! namespace is polled until no pods, services, or claims remain under their
//! selectors. Claims are deleted as soon as they are seen; workloads and
//! services are force-deleted once the cleanup outlives its timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use stagehand_common::crd::{ConditionStatus, Queue, QueueConditionType, QueueState};
use tracing::{debug, info, instrument, warn};

use super::{elapsed_since, Progress};
use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::Result;

/// Outcome of one cleanup poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Nothing remains
    Cleaned,
    /// Resources remain, keep polling
    Pending,
    /// The timeout passed and remaining resources were force-deleted
    ForceDeleted,
}

/// Poll the resources under `selectors`, deleting claims right away and
/// everything else once `timeout` has passed since `started_at`.
pub async fn wait_for_components_cleaned(
    cluster: &dyn ClusterClient,
    namespace: &str,
    selectors: &[String],
    started_at: DateTime<Utc>,
    timeout: Duration,
) -> Result<CleanupStatus> {
    let force = elapsed_since(started_at) > timeout;
    let mut pending = false;
    let mut forced = false;

    for selector in selectors {
        let pvcs = cluster.list_pvcs(namespace, selector).await?;
        if !pvcs.is_empty() {
            debug!(selector = %selector, count = pvcs.len(), "Deleting claims");
            cluster.delete_pvcs(namespace, selector).await?;
            pending = true;
        }

        let pods = cluster.list_pods(namespace, selector).await?;
        if !pods.is_empty() {
            pending = true;
            if force {
                warn!(selector = %selector, count = pods.len(), "Cleanup timed out, force deleting workloads");
                cluster.force_delete_workloads(namespace, selector).await?;
                forced = true;
            }
        }

        let services = cluster.list_services(namespace, selector).await?;
        if !services.is_empty() {
            pending = true;
            if force {
                warn!(selector = %selector, count = services.len(), "Cleanup timed out, deleting services");
                cluster.delete_services(namespace, selector).await?;
                forced = true;
            }
        }
    }

    Ok(if forced {
        CleanupStatus::ForceDeleted
    } else if pending {
        CleanupStatus::Pending
    } else {
        CleanupStatus::Cleaned
    })
}

struct Stage {
    name: &'static str,
    started: QueueConditionType,
    cleaned: QueueConditionType,
    next: QueueState,
}

const BEFORE: Stage = Stage {
    name: "before",
    started: QueueConditionType::CleaningBeforeStarted,
    cleaned: QueueConditionType::CleanedBefore,
    next: QueueState::DetectingImageMissing,
};

const AFTER: Stage = Stage {
    name: "after",
    started: QueueConditionType::CleaningAfterStarted,
    cleaned: QueueConditionType::CleanedAfter,
    next: QueueState::Deleting,
};

/// `cleaning-before`: clear stale releases before deploying
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn clean_before(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    clean(ctx, queue, &BEFORE).await
}

/// `cleaning-after`: remove what the run deployed
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn clean_after(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    clean(ctx, queue, &AFTER).await
}

async fn clean(ctx: &Context, queue: &mut Queue, stage: &Stage) -> Result<Progress> {
    let config = ctx.team_config().await?;
    let deployment = ctx.deployment(&config, queue);

    if !queue.is_condition_true(stage.started) {
        let engine = ctx.engine(&config, queue);
        for release in ctx.releases(&config, queue) {
            engine.delete(&release).await?;
        }
        queue.set_condition(stage.started, ConditionStatus::True, "ReleasesDeleted", "");
        ctx.save(queue).await?;
        info!(stage = stage.name, engine = engine.name(), "Releases deleted");
    }

    let started_at = queue
        .condition(stage.started)
        .map(|c| c.last_transition_time)
        .unwrap_or_else(Utc::now);
    let selectors = ctx.selectors(&config, queue);

    match wait_for_components_cleaned(
        ctx.cluster.as_ref(),
        &ctx.namespace,
        &selectors,
        started_at,
        deployment.cleanup_timeout(),
    )
    .await?
    {
        CleanupStatus::Cleaned => {
            queue.set_condition(stage.cleaned, ConditionStatus::True, "Cleaned", "");
            queue.set_state(stage.next);
            ctx.save(queue).await?;
            info!(stage = stage.name, state = %stage.next, "Cleanup complete");
            Ok(Progress::Advanced)
        }
        CleanupStatus::Pending => {
            debug!(stage = stage.name, "Resources still present");
            Ok(Progress::Wait(ctx.timings.wait))
        }
        CleanupStatus::ForceDeleted => {
            warn!(stage = stage.name, "Forced deletion issued, re-checking");
            Ok(Progress::Wait(ctx.timings.wait))
        }
    }
}

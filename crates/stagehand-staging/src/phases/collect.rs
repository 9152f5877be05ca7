//! Result collection
//!
//! Captures diagnostics, records the run's history, promotes the version to
//! stable on success, and reports the outcome. Every step is gated so that a
//! failed tick can be retried without duplicating anything.

use chrono::{DateTime, Utc};
use stagehand_common::crd::{
    ConditionStatus, Queue, QueueConditionType, QueueHistorySpec, QueueState, StableComponentSpec,
};
use stagehand_rpc::types::UpgradeStatus;
use tracing::{debug, info, instrument};

use super::image_missing::stable_components;
use super::Progress;
use crate::context::Context;
use crate::diagnostics::collect_bundle;
use crate::report::{build_report, send_report};
use crate::values::{applied_values, desired_components, resolve_releases};
use crate::Result;

/// Name of the history record of a run started at `at`
pub fn history_name(queue: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", queue, at.format("%Y%m%d-%H%M%S"))
}

/// `collecting`: finalize the run
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn collect(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    let has_bundle = queue
        .status
        .as_ref()
        .map(|s| !s.kube_zip_log.is_empty())
        .unwrap_or(false);
    if !has_bundle {
        let bundle = collect_bundle(ctx.cluster.as_ref(), &ctx.namespace).await?;
        queue.status_mut().kube_zip_log = bundle;
        ctx.save(queue).await?;
    }

    if queue.is_promotion() {
        queue.set_state(QueueState::Finished);
        ctx.save(queue).await?;
        info!("Promotion run finished");
        return Ok(Progress::Advanced);
    }

    if !queue.is_condition_true(QueueConditionType::Collected) {
        record_and_report(ctx, queue).await?;
    }

    queue.set_state(QueueState::CleaningAfter);
    ctx.save(queue).await?;
    Ok(Progress::Advanced)
}

async fn record_and_report(ctx: &Context, queue: &mut Queue) -> Result<()> {
    let config = ctx.team_config().await?;
    let stable = stable_components(ctx).await?;
    let team = ctx.team_of(queue).to_string();

    if queue.status.as_ref().map(|s| s.queue_history_name.is_empty()).unwrap_or(true) {
        queue.status_mut().queue_history_name = history_name(&queue.spec.name, Utc::now());
        ctx.save(queue).await?;
    }
    let name = queue
        .status
        .as_ref()
        .map(|s| s.queue_history_name.clone())
        .unwrap_or_default();

    if ctx.cluster.get_queue_history(&ctx.namespace, &name).await?.is_none() {
        let applied = resolve_releases(&config, queue, &team, &ctx.namespace, &stable)
            .map(|releases| applied_values(&releases))
            .unwrap_or_default();
        let spec = QueueHistorySpec::capture(queue, applied, stable.clone());
        ctx.cluster
            .create_queue_history(&ctx.namespace, &name, &spec)
            .await?;
        info!(history = %name, "Recorded queue history");
    } else {
        debug!(history = %name, "Queue history already recorded");
    }

    let succeeded = queue.is_deploy_success() && queue.is_test_success();
    let components = desired_components(&config, queue, &stable);

    if succeeded && !queue.is_reverify() {
        let spec = StableComponentSpec {
            updated_by: Some(name.clone()),
            ..StableComponentSpec::new(&queue.spec.name, &queue.spec.repository, &queue.spec.version)
        };
        ctx.cluster
            .upsert_stable_component(&ctx.namespace, &spec)
            .await?;
        info!(version = %queue.spec.version, "Promoted to stable");

        let report = build_report(queue, &ctx.namespace, &team, UpgradeStatus::Success, components);
        send_report(ctx.peer.as_ref(), &report).await;
    } else if queue.is_reverify() {
        let report = build_report(queue, &ctx.namespace, &team, UpgradeStatus::Failure, components);
        send_report(ctx.peer.as_ref(), &report).await;
    }

    queue.set_condition(
        QueueConditionType::Collected,
        ConditionStatus::True,
        "Collected",
        "",
    );
    ctx.save(queue).await?;
    Ok(())
}

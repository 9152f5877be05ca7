//! Image-missing detection

use stagehand_common::crd::{
    ConditionStatus, Queue, QueueConditionType, QueueState, StableComponentSpec,
};
use tracing::{info, instrument, warn};

use super::Progress;
use crate::context::Context;
use crate::values::desired_components;
use crate::Result;

/// Reason recorded on `Deployed` when images are missing
pub const IMAGE_MISSING_REASON: &str = "ImageMissing";

/// Stable versions currently recorded in the namespace
pub(crate) async fn stable_components(ctx: &Context) -> Result<Vec<StableComponentSpec>> {
    Ok(ctx
        .cluster
        .list_stable_components(&ctx.namespace)
        .await?
        .into_iter()
        .map(|c| c.spec)
        .collect())
}

/// `detecting-image-missing`: ask the peer whether every image exists
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn detect_image_missing(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    if !queue.is_condition_true(QueueConditionType::ImageMissingChecked) {
        let config = ctx.team_config().await?;
        let stable = stable_components(ctx).await?;
        let components = desired_components(&config, queue, &stable);
        let missing = ctx
            .peer
            .get_missing_versions(ctx.team_of(queue), &components)
            .await?;

        queue.status_mut().image_missing_list = missing;
        queue.set_condition(
            QueueConditionType::ImageMissingChecked,
            ConditionStatus::True,
            "Checked",
            format!("{} components checked", components.len()),
        );
        ctx.save(queue).await?;
    }

    let missing = queue
        .status
        .as_ref()
        .map(|s| s.image_missing_list.clone())
        .unwrap_or_default();

    if missing.is_empty() {
        queue.set_state(QueueState::Creating);
        info!("All images present");
    } else {
        let list = missing
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        warn!(missing = %list, "Images missing, skipping deployment");
        queue.set_condition(
            QueueConditionType::Deployed,
            ConditionStatus::False,
            IMAGE_MISSING_REASON,
            format!("missing images: {}", list),
        );
        queue.set_state(QueueState::Collecting);
    }
    ctx.save(queue).await?;
    Ok(Progress::Advanced)
}

//! Outcome reports to the peer service

use std::time::Duration;

use stagehand_common::crd::Queue;
use stagehand_common::retry::{retry_with_backoff, RetryConfig};
use stagehand_rpc::types::{ComponentUpgradeReport, ComponentVersion, IssueType, UpgradeStatus};
use stagehand_rpc::PeerClient;
use tracing::{error, info};

/// Time a report may take, retries included
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts made to deliver a report
pub const REPORT_ATTEMPTS: u32 = 3;

/// Build the report of a finished run
pub fn build_report(
    queue: &Queue,
    namespace: &str,
    team: &str,
    status: UpgradeStatus,
    components: Vec<ComponentVersion>,
) -> ComponentUpgradeReport {
    let queue_status = queue.status.clone().unwrap_or_default();
    let run_succeeded = queue.is_deploy_success() && queue.is_test_success();
    let team_name = if queue.spec.team_name.is_empty() {
        team.to_string()
    } else {
        queue.spec.team_name.clone()
    };

    ComponentUpgradeReport {
        status,
        name: queue.spec.name.clone(),
        team_name,
        namespace: namespace.to_string(),
        queue_type: queue.spec.type_,
        issue_type: IssueType::classify(
            !queue_status.image_missing_list.is_empty(),
            queue.is_reverify(),
            run_succeeded,
        ),
        queue_history_name: queue_status.queue_history_name,
        no_of_retry: queue.spec.no_of_retry,
        is_reverify: queue.is_reverify(),
        components,
        image_missing_list: queue_status.image_missing_list,
        test_runner: queue_status.test_runners,
    }
}

/// Deliver a report, retrying with backoff under [`REPORT_TIMEOUT`].
///
/// Delivery failures are logged and never fail the caller.
pub async fn send_report(peer: &dyn PeerClient, report: &ComponentUpgradeReport) {
    let retry = RetryConfig::with_max_attempts(REPORT_ATTEMPTS);
    let delivery = retry_with_backoff(&retry, "notify component upgrade", || {
        peer.notify_component_upgrade(report)
    });

    match tokio::time::timeout(REPORT_TIMEOUT, delivery).await {
        Ok(Ok(())) => info!(
            queue = %report.name,
            status = ?report.status,
            issue_type = ?report.issue_type,
            "Reported run outcome"
        ),
        Ok(Err(e)) => error!(queue = %report.name, error = %e, "Failed to report run outcome"),
        Err(_) => error!(
            queue = %report.name,
            timeout_secs = REPORT_TIMEOUT.as_secs(),
            "Reporting run outcome timed out"
        ),
    }
}

//! Deployment phase

use k8s_openapi::api::core::v1::Pod;
use stagehand_common::crd::{ConditionStatus, Queue, QueueConditionType, QueueState};
use stagehand_common::kube_utils::{
    is_deployment_ready, is_pod_ready, is_pod_succeeded, is_pvc_bound, is_service_ready,
};
use tracing::{debug, info, instrument, warn};

use super::image_missing::stable_components;
use super::{elapsed_since, Progress};
use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::values::{resolve_releases, target_release};
use crate::{Result, StagingError};

/// Reason recorded on `Deployed` when the deployment outlives its timeout
pub const DEPLOY_TIMEOUT_REASON: &str = "DeployTimeout";

fn pod_settled(pod: &Pod) -> bool {
    is_pod_ready(pod) || is_pod_succeeded(pod)
}

/// Whether every pod, deployment, service, and claim under `selectors` is
/// ready
pub async fn resources_ready(
    cluster: &dyn ClusterClient,
    namespace: &str,
    selectors: &[String],
) -> Result<bool> {
    for selector in selectors {
        if !cluster.list_pods(namespace, selector).await?.iter().all(pod_settled) {
            debug!(selector = %selector, "Pods not ready");
            return Ok(false);
        }
        if !cluster
            .list_deployments(namespace, selector)
            .await?
            .iter()
            .all(is_deployment_ready)
        {
            debug!(selector = %selector, "Deployments not ready");
            return Ok(false);
        }
        if !cluster
            .list_services(namespace, selector)
            .await?
            .iter()
            .all(is_service_ready)
        {
            debug!(selector = %selector, "Services not ready");
            return Ok(false);
        }
        if !cluster.list_pvcs(namespace, selector).await?.iter().all(is_pvc_bound) {
            debug!(selector = %selector, "Claims not bound");
            return Ok(false);
        }
    }
    Ok(true)
}

fn fail(queue: &mut Queue, reason: &str, message: String) {
    queue.set_condition(
        QueueConditionType::Deployed,
        ConditionStatus::False,
        reason,
        message,
    );
    queue.set_state(QueueState::Collecting);
}

/// Record the engine on the queue once, warning when it is not the
/// configured one. Returns whether a substitute was pinned.
fn pin_engine(queue: &mut Queue, engine: &str, configured: Option<&str>) -> bool {
    let status = queue.status_mut();
    if !status.deploy_engine.is_empty() {
        return false;
    }
    status.deploy_engine = engine.to_string();

    let substituted = configured.unwrap_or_default() != engine;
    if substituted {
        warn!(
            configured = configured.unwrap_or_default(),
            engine,
            "Configured deploy engine is not registered, pinning fallback"
        );
    }
    substituted
}

/// `creating`: hand the releases to the engine and wait for readiness
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn deploy(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    let config = ctx.team_config().await?;
    let deployment = ctx.deployment(&config, queue);

    let started = match queue.status.as_ref().and_then(|s| s.start_deploy_time) {
        Some(started) => started,
        None => {
            let now = chrono::Utc::now();
            queue.status_mut().start_deploy_time = Some(now);
            now
        }
    };
    let elapsed = elapsed_since(started);
    if elapsed > deployment.timeout() {
        warn!(
            elapsed_secs = elapsed.as_secs(),
            timeout_secs = deployment.timeout_seconds,
            "Deployment timed out"
        );
        fail(
            queue,
            DEPLOY_TIMEOUT_REASON,
            format!("not ready after {}s", deployment.timeout_seconds),
        );
        ctx.save(queue).await?;
        return Ok(Progress::Advanced);
    }

    let engine = ctx.engine(&config, queue);
    let team = ctx.team_of(queue).to_string();
    pin_engine(queue, engine.name(), deployment.engine.as_deref());
    if queue.status.as_ref().map(|s| s.release_name.is_empty()).unwrap_or(true) {
        let release = target_release(&config, queue, &team, &ctx.namespace).unwrap_or_default();
        queue.status_mut().release_name = release;
    }

    if !queue.is_condition_true(QueueConditionType::DeployStarted) {
        let stable = stable_components(ctx).await?;
        let releases = match resolve_releases(&config, queue, &team, &ctx.namespace, &stable) {
            Ok(releases) => releases,
            Err(StagingError::ComponentNotFound(name)) => {
                warn!(component = %name, "Component not configured");
                fail(queue, "ComponentNotFound", format!("component {} is not configured", name));
                ctx.save(queue).await?;
                return Ok(Progress::Advanced);
            }
            Err(e) => return Err(e),
        };

        for release in &releases {
            engine
                .create(
                    &release.release,
                    &release.component,
                    release.parent.as_ref(),
                    &release.values,
                )
                .await?;
        }
        queue.set_condition(
            QueueConditionType::DeployStarted,
            ConditionStatus::True,
            "ReleasesCreated",
            format!("{} releases via {}", releases.len(), engine.name()),
        );
        ctx.save(queue).await?;
        info!(engine = engine.name(), releases = releases.len(), "Deployment started");
    }

    if queue.is_promotion() && !engine.is_ready(queue).await? {
        debug!(engine = engine.name(), "Engine reports releases not ready");
        return Ok(Progress::Wait(ctx.timings.wait));
    }
    if !engine.is_mocked() {
        let selectors = ctx.selectors(&config, queue);
        if !resources_ready(ctx.cluster.as_ref(), &ctx.namespace, &selectors).await? {
            return Ok(Progress::Wait(ctx.timings.wait));
        }
    }

    queue.set_condition(
        QueueConditionType::Deployed,
        ConditionStatus::True,
        "DeploySucceeded",
        "",
    );
    queue.set_state(QueueState::Testing);
    ctx.save(queue).await?;
    info!("Deployment ready");
    Ok(Progress::Advanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{labelled_pod, sample_config, test_context, upgrade_queue, Fixture};

    #[tokio::test]
    async fn deploy_started_is_not_repeated() {
        let fixture = Fixture::new(sample_config());
        let ctx = test_context(&fixture);
        let mut queue = fixture.insert(upgrade_queue("redis", "5.0.5-r1"));
        queue.set_state(QueueState::Creating);
        queue.set_condition(
            QueueConditionType::DeployStarted,
            ConditionStatus::True,
            "ReleasesCreated",
            "",
        );

        deploy(&ctx, &mut queue).await.unwrap();

        assert!(fixture.engine.created().is_empty());
        assert_eq!(queue.state(), QueueState::Testing);
    }

    #[tokio::test]
    async fn first_entry_pins_engine_and_release() {
        let fixture = Fixture::new(sample_config());
        let ctx = test_context(&fixture);
        let mut queue = fixture.insert(upgrade_queue("redis", "5.0.5-r1"));
        queue.set_state(QueueState::Creating);

        assert_eq!(deploy(&ctx, &mut queue).await.unwrap(), Progress::Advanced);

        let status = queue.status.as_ref().unwrap();
        assert_eq!(status.deploy_engine, "mock");
        assert_eq!(status.release_name, "payments-s2h-payments-redis");
        assert!(status.start_deploy_time.is_some());
        assert_eq!(
            fixture.engine.created(),
            vec!["payments-s2h-payments-redis", "payments-s2h-payments-wordpress"]
        );
    }

    #[test]
    fn fallback_engine_is_pinned_once() {
        let mut queue = upgrade_queue("redis", "5.0.5-r1");

        assert!(pin_engine(&mut queue, "mock", Some("flux")));
        assert!(!pin_engine(&mut queue, "mock", Some("flux")));
        assert_eq!(queue.status.as_ref().unwrap().deploy_engine, "mock");
    }

    #[test]
    fn configured_engine_is_pinned_quietly() {
        let mut queue = upgrade_queue("redis", "5.0.5-r1");
        assert!(!pin_engine(&mut queue, "helm", Some("helm")));
        assert_eq!(queue.status.as_ref().unwrap().deploy_engine, "helm");
    }

    #[tokio::test]
    async fn stale_start_time_times_out_regardless_of_readiness() {
        let fixture = Fixture::new(sample_config());
        let ctx = test_context(&fixture);
        let mut queue = fixture.insert(upgrade_queue("redis", "5.0.5-r1"));
        queue.set_state(QueueState::Creating);
        queue.status_mut().start_deploy_time = Some(chrono::Utc::now() - chrono::Duration::hours(2));

        deploy(&ctx, &mut queue).await.unwrap();

        assert_eq!(queue.state(), QueueState::Collecting);
        let deployed = queue.condition(QueueConditionType::Deployed).unwrap();
        assert_eq!(deployed.status, ConditionStatus::False);
        assert_eq!(deployed.reason, DEPLOY_TIMEOUT_REASON);
        assert!(fixture.engine.created().is_empty());
    }

    #[tokio::test]
    async fn unready_pods_hold_back_real_engines() {
        let fixture = Fixture::new(sample_config());
        let pod = labelled_pod("redis-0", "release", "a");
        fixture.cluster.add_pod(pod);

        assert!(!resources_ready(fixture.cluster.as_ref(), "s2h-payments", &["release=a".to_string()])
            .await
            .unwrap());
        assert!(resources_ready(fixture.cluster.as_ref(), "s2h-payments", &["release=b".to_string()])
            .await
            .unwrap());
    }
}

//! Kubernetes readiness helpers
//!
//! Pure functions over k8s-openapi objects, shared by the deployment phase
//! (is everything up?) and the diagnostics bundle (what is not up?).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Kubernetes condition status "True"
pub const STATUS_TRUE: &str = "True";

/// Percentage of a deployment's replicas allowed to be unavailable when the
/// rollout strategy does not say
pub const DEFAULT_MAX_UNAVAILABLE_PERCENT: i32 = 25;

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Check if a Kubernetes resource has a condition with the given type and
/// status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Pod has condition Ready=True
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_condition(
        pod.status.as_ref().and_then(|s| s.conditions.as_deref()),
        "Ready",
    )
}

/// Pod ran to completion
pub fn is_pod_succeeded(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Succeeded")
        .unwrap_or(false)
}

/// Replicas a deployment may be short of while still counting as ready
pub fn max_unavailable(deployment: &Deployment) -> i32 {
    let desired = desired_replicas(deployment);
    let strategy = deployment.spec.as_ref().and_then(|s| s.strategy.as_ref());

    if strategy.and_then(|s| s.type_.as_deref()) == Some("Recreate") {
        return 0;
    }

    match strategy
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.max_unavailable.as_ref())
    {
        Some(IntOrString::Int(n)) => *n,
        Some(IntOrString::String(s)) => s
            .trim_end_matches('%')
            .parse::<i32>()
            .map(|pct| desired * pct / 100)
            .unwrap_or(0),
        None => desired * DEFAULT_MAX_UNAVAILABLE_PERCENT / 100,
    }
}

fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Ready replicas cover the desired count minus what may be unavailable
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired_replicas(deployment) - max_unavailable(deployment)
}

/// Service has a cluster IP and, when load-balanced, an external address
pub fn is_service_ready(service: &Service) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    if spec.cluster_ip.as_deref().unwrap_or_default().is_empty() {
        return false;
    }
    if spec.type_.as_deref() == Some("LoadBalancer") {
        return service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| !ingress.is_empty())
            .unwrap_or(false);
    }
    true
}

/// Claim is bound to a volume
pub fn is_pvc_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Bound")
        .unwrap_or(false)
}

/// Render a label map as a `k=v,k=v` selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

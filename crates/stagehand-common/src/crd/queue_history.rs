//! QueueHistory Custom Resource Definition
//!
//! One record per non-promotion run, written once by the collection phase and
//! never mutated afterwards.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::queue::{Queue, QueueSpec, QueueStatus};
use super::stable_component::StableComponentSpec;
use super::types::preserve_unknown_fields;

/// Immutable snapshot of a finished queue run
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stagehand.dev",
    version = "v1beta1",
    kind = "QueueHistory",
    plural = "queuehistories",
    shortname = "qh",
    namespaced,
    printcolumn = r#"{"name":"Component","type":"string","jsonPath":".spec.queue.spec.name"}"#,
    printcolumn = r#"{"name":"Deployed","type":"boolean","jsonPath":".spec.isDeploySuccess"}"#,
    printcolumn = r#"{"name":"Tested","type":"boolean","jsonPath":".spec.isTestSuccess"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QueueHistorySpec {
    /// The queue as it stood when the run was collected
    pub queue: QueueSnapshot,

    /// Value tree handed to the deploy engine for the queue's component
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub applied_values: serde_json::Value,

    /// Last-known-good versions at the time of the run
    #[serde(default)]
    pub stable_components: Vec<StableComponentSpec>,

    /// Whether the releases became ready
    #[serde(default)]
    pub is_deploy_success: bool,

    /// Whether the test passed
    #[serde(default)]
    pub is_test_success: bool,

    /// Whether the run was a reverify
    #[serde(default)]
    pub is_reverify: bool,

    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
}

/// Spec and status of a queue, copied verbatim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Queue spec
    pub spec: QueueSpec,
    /// Queue status
    #[serde(default)]
    pub status: QueueStatus,
}

impl QueueHistorySpec {
    /// Snapshot a queue together with what was applied and what was stable
    pub fn capture(
        queue: &Queue,
        applied_values: serde_json::Value,
        stable_components: Vec<StableComponentSpec>,
    ) -> Self {
        Self {
            queue: QueueSnapshot {
                spec: queue.spec.clone(),
                status: queue.status.clone().unwrap_or_default(),
            },
            applied_values,
            stable_components,
            is_deploy_success: queue.is_deploy_success(),
            is_test_success: queue.is_test_success(),
            is_reverify: queue.is_reverify(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, QueueConditionType, QueueType};

    #[test]
    fn capture_copies_outcome_flags() {
        let mut queue = Queue::new(
            "redis",
            QueueSpec::new("redis", "bitnami/redis", "5.0.5-r1", QueueType::Reverify),
        );
        queue.set_condition(
            QueueConditionType::Deployed,
            ConditionStatus::True,
            "DeploySucceeded",
            "",
        );
        queue.set_condition(
            QueueConditionType::Tested,
            ConditionStatus::False,
            "TestFailed",
            "",
        );

        let spec = QueueHistorySpec::capture(
            &queue,
            serde_json::json!({"image": {"tag": "5.0.5-r1"}}),
            vec![StableComponentSpec::new("mariadb", "bitnami/mariadb", "10.3")],
        );

        assert!(spec.is_deploy_success);
        assert!(!spec.is_test_success);
        assert!(spec.is_reverify);
        assert_eq!(spec.queue.spec.version, "5.0.5-r1");
        assert_eq!(spec.stable_components.len(), 1);
        assert_eq!(spec.applied_values["image"]["tag"], "5.0.5-r1");
    }

    #[test]
    fn applied_values_schema_preserves_unknown_fields() {
        use kube::CustomResourceExt;
        let crd = serde_json::to_value(QueueHistory::crd()).unwrap();
        let values = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["appliedValues"];
        assert_eq!(values["x-kubernetes-preserve-unknown-fields"], true);
    }
}

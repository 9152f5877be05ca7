//! Wire types of the peer RPC methods

use serde::{Deserialize, Serialize};
use stagehand_common::crd::{Image, QueueType, TestRunnerStatus};

/// Outcome of a run as reported to the peer
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    /// Component version is now stable
    Success,
    /// Component version could not be confirmed
    Failure,
}

/// Why a run failed, derived from the run's outcome
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    /// Some image was not in the registry
    ImageMissing,
    /// The environment is healthy but the desired version is not
    DesiredVersionFailed,
    /// Even the last stable version fails
    EnvironmentIssue,
    /// Nothing more specific is known
    #[default]
    Unknown,
}

impl IssueType {
    /// Classify a run.
    ///
    /// Missing images win. A reverify stands in for an upgrade that failed
    /// repeatedly: if the stable version passes the desired version is at
    /// fault, otherwise the environment is.
    pub fn classify(images_missing: bool, is_reverify: bool, run_succeeded: bool) -> Self {
        if images_missing {
            Self::ImageMissing
        } else if is_reverify && run_succeeded {
            Self::DesiredVersionFailed
        } else if is_reverify {
            Self::EnvironmentIssue
        } else {
            Self::Unknown
        }
    }
}

/// A component at a version
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersion {
    /// Component name
    pub name: String,
    /// Image repository
    pub repository: String,
    /// Image tag
    pub version: String,
}

impl ComponentVersion {
    /// Create a component version
    pub fn new(
        name: impl Into<String>,
        repository: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            version: version.into(),
        }
    }

    /// Image coordinate
    pub fn image(&self) -> Image {
        Image::new(&self.repository, &self.version)
    }
}

/// `NotifyComponentUpgrade` request
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpgradeReport {
    /// Outcome
    pub status: UpgradeStatus,
    /// Queue name
    pub name: String,
    /// Owning team
    pub team_name: String,
    /// Namespace the run happened in
    pub namespace: String,
    /// Kind of run
    pub queue_type: QueueType,
    /// Failure classification
    pub issue_type: IssueType,
    /// History record of the run
    pub queue_history_name: String,
    /// Failed attempts before this run
    pub no_of_retry: u32,
    /// Whether the run was a reverify
    pub is_reverify: bool,
    /// Components deployed by the run
    pub components: Vec<ComponentVersion>,
    /// Images the peer reported as missing
    pub image_missing_list: Vec<Image>,
    /// Test execution details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_runner: Option<TestRunnerStatus>,
}

/// `GetMissingVersion` request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MissingVersionRequest {
    /// Owning team
    pub team_name: String,
    /// Components whose images must exist
    pub components: Vec<ComponentVersion>,
}

/// `GetMissingVersion` response
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MissingVersionResponse {
    /// Images not found in the registry
    #[serde(default)]
    pub images: Vec<Image>,
}

/// `UpdateConfiguration` request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigurationRequest {
    /// Base64-encoded JSON configuration document
    pub config: String,
    /// Revision of the document (older revisions are ignored)
    #[serde(default)]
    pub revision: i64,
}

/// `UpdateConfiguration` response
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigurationResponse {
    /// Whether the revision replaced the held configuration
    pub accepted: bool,
}

/// `GetCurrentQueue` response
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentQueueResponse {
    /// Queue being processed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueSummary>,
}

/// Short description of a queue
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    /// Queue name
    pub name: String,
    /// Kind of run
    pub queue_type: QueueType,
    /// Workflow state
    pub state: String,
    /// Image repository
    pub repository: String,
    /// Image tag
    pub version: String,
    /// Failed attempts so far
    pub no_of_retry: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_type_classification() {
        assert_eq!(IssueType::classify(true, true, true), IssueType::ImageMissing);
        assert_eq!(
            IssueType::classify(false, true, true),
            IssueType::DesiredVersionFailed
        );
        assert_eq!(
            IssueType::classify(false, true, false),
            IssueType::EnvironmentIssue
        );
        assert_eq!(IssueType::classify(false, false, false), IssueType::Unknown);
    }

    #[test]
    fn report_uses_camel_case() {
        let report = ComponentUpgradeReport {
            status: UpgradeStatus::Failure,
            name: "redis".into(),
            team_name: "payments".into(),
            namespace: "s2h-payments".into(),
            queue_type: QueueType::Reverify,
            issue_type: IssueType::EnvironmentIssue,
            queue_history_name: "redis-20240101-000000".into(),
            no_of_retry: 0,
            is_reverify: true,
            components: vec![ComponentVersion::new("redis", "bitnami/redis", "5.0.5-r1")],
            image_missing_list: vec![],
            test_runner: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["issueType"], "environment-issue");
        assert_eq!(json["teamName"], "payments");
        assert_eq!(json["queueType"], "reverify");
        assert_eq!(json["components"][0]["version"], "5.0.5-r1");
        assert!(json.get("testRunner").is_none());
    }
}

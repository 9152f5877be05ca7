//! Queue Custom Resource Definition
//!
//! A Queue is one pending change: a component version to deploy into the
//! tenant's staging namespace, test, and then either promote to "stable" or
//! retry. The spec is the intent and is only rewritten by the disposition
//! step; the status is the progress record the staging controller mutates
//! while the queue is current.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use super::types::{ConditionStatus, Image};

// =============================================================================
// Queue type and state
// =============================================================================

/// What kind of run a queue represents
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    /// Deploy and test a new component version
    #[default]
    Upgrade,
    /// Re-run the last stable version to check the environment itself
    Reverify,
    /// Deploy the full stable set into a pre-active namespace
    PreActive,
    /// Swap the pre-active namespace into the active role
    PromoteToActive,
    /// Move the previous active namespace out of the active role
    DemoteFromActive,
}

impl QueueType {
    /// Promotion/demotion queues are infrastructure swaps: no cleanup, no
    /// external tests, no history record.
    pub fn is_promotion(self) -> bool {
        matches!(self, Self::PromoteToActive | Self::DemoteFromActive)
    }

    /// Wire name of the type
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Reverify => "reverify",
            Self::PreActive => "pre-active",
            Self::PromoteToActive => "promote-to-active",
            Self::DemoteFromActive => "demote-from-active",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a queue in the staging workflow
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    /// Not picked up yet (an empty string on the wire means the same)
    #[default]
    #[serde(alias = "")]
    Waiting,
    /// Removing stale releases before deploying
    CleaningBefore,
    /// Asking the peer whether every image exists
    DetectingImageMissing,
    /// Deploying releases and waiting for readiness
    Creating,
    /// Running the configured test
    Testing,
    /// Capturing diagnostics, history, and reporting
    Collecting,
    /// Removing the releases after the run
    CleaningAfter,
    /// Waiting for the disposition policy
    Deleting,
    /// The queue was deleted out-of-band
    Cancelling,
    /// Terminal state for promotion/demotion queues
    Finished,
}

impl QueueState {
    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::CleaningBefore => "cleaning-before",
            Self::DetectingImageMissing => "detecting-image-missing",
            Self::Creating => "creating",
            Self::Testing => "testing",
            Self::Collecting => "collecting",
            Self::CleaningAfter => "cleaning-after",
            Self::Deleting => "deleting",
            Self::Cancelling => "cancelling",
            Self::Finished => "finished",
        }
    }

    /// States that are never re-synced from the backing store
    pub fn skips_sync(self) -> bool {
        matches!(self, Self::Deleting | Self::Cancelling)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Workflow checkpoints recorded on a queue
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum QueueConditionType {
    /// Release deletion was issued before deploying
    CleaningBeforeStarted,
    /// No stale resources remain before deploying
    CleanedBefore,
    /// Peer was asked about missing images
    ImageMissingChecked,
    /// Releases were handed to the deploy engine
    DeployStarted,
    /// Releases became ready (False on timeout or missing images)
    Deployed,
    /// The test runner was triggered
    TestTriggered,
    /// The test outcome
    Tested,
    /// History was recorded and the outcome reported
    Collected,
    /// Release deletion was issued after the run
    CleaningAfterStarted,
    /// No resources remain after the run
    CleanedAfter,
}

/// A typed, timestamped checkpoint on a queue
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueCondition {
    /// Which checkpoint this is
    #[serde(rename = "type")]
    pub type_: QueueConditionType,

    /// Status of the checkpoint
    pub status: ConditionStatus,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Ordered condition list holding at most one entry per type
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Conditions(Vec<QueueCondition>);

impl Conditions {
    /// Look up a condition by type
    pub fn get(&self, type_: QueueConditionType) -> Option<&QueueCondition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Whether the condition exists with status True
    pub fn is_true(&self, type_: QueueConditionType) -> bool {
        self.get(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Insert or update a condition.
    ///
    /// The transition time only moves when the status actually changes, so a
    /// `*Started` checkpoint keeps the time the phase began.
    pub fn set(
        &mut self,
        type_: QueueConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.upsert(QueueCondition {
            type_,
            status,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: message.into(),
        });
    }

    fn upsert(&mut self, condition: QueueCondition) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.status = condition.status;
                    existing.last_transition_time = condition.last_transition_time;
                }
                existing.reason = condition.reason;
                existing.message = condition.message;
            }
            None => self.0.push(condition),
        }
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &QueueCondition> {
        self.0.iter()
    }

    /// Number of recorded checkpoints
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no checkpoint was recorded yet
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<QueueCondition> for Conditions {
    fn from_iter<I: IntoIterator<Item = QueueCondition>>(iter: I) -> Self {
        let mut conditions = Conditions::default();
        for condition in iter {
            conditions.upsert(condition);
        }
        conditions
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Vec::<QueueCondition>::deserialize(deserializer)?;
        Ok(list.into_iter().collect())
    }
}

impl JsonSchema for Conditions {
    fn schema_name() -> String {
        "Conditions".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<QueueCondition>>::json_schema(gen)
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Pending change to deploy and test in the staging namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stagehand.dev",
    version = "v1beta1",
    kind = "Queue",
    plural = "queues",
    shortname = "q",
    namespaced,
    status = "QueueStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Component","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    /// Component name, or the fixed alias of a promotion/demotion queue
    pub name: String,

    /// Image repository of the desired version
    #[serde(default)]
    pub repository: String,

    /// Image tag of the desired version
    #[serde(default)]
    pub version: String,

    /// Kind of run
    #[serde(rename = "type", default)]
    pub type_: QueueType,

    /// Number of failed attempts so far
    #[serde(default)]
    pub no_of_retry: u32,

    /// Processing order (lower runs first)
    #[serde(default)]
    pub no_of_order: i32,

    /// Do not process before this time
    #[serde(default)]
    pub next_process_at: Option<DateTime<Utc>>,

    /// Owning team
    #[serde(default)]
    pub team_name: String,
}

impl QueueSpec {
    /// Create a spec for a component change
    pub fn new(
        name: impl Into<String>,
        repository: impl Into<String>,
        version: impl Into<String>,
        type_: QueueType,
    ) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            version: version.into(),
            type_,
            ..Default::default()
        }
    }

    /// Set the owning team
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team_name = team.into();
        self
    }
}

/// Test-runner-specific sub-status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestRunnerStatus {
    /// Runner that executed the test
    pub name: String,
    /// Identifier of the external test execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    /// Link to the external test execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,
}

/// Progress record of a queue.
///
/// Optional fields serialize as `null` so that a merge patch of the whole
/// status clears them when a queue is reset for a retry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueStatus {
    /// When the queue was first picked up
    pub created_at: Option<DateTime<Utc>>,
    /// Last status mutation
    pub updated_at: Option<DateTime<Utc>>,
    /// Copy of the spec's next-process time at the last reschedule
    pub next_process_at: Option<DateTime<Utc>>,
    /// When the deployment phase began
    pub start_deploy_time: Option<DateTime<Utc>>,
    /// When the test phase began
    pub start_testing_time: Option<DateTime<Utc>>,
    /// Current workflow state
    pub state: QueueState,
    /// How many runs this queue has been through
    pub no_of_processed: u32,
    /// Release of the queue's top-level component
    pub release_name: String,
    /// Workflow checkpoints
    pub conditions: Conditions,
    /// Test runner sub-status
    pub test_runners: Option<TestRunnerStatus>,
    /// Name of the history record of this run
    pub queue_history_name: String,
    /// Base64 tar.gz bundle of cluster diagnostics
    pub kube_zip_log: String,
    /// Images the peer reported as missing
    pub image_missing_list: Vec<Image>,
    /// Deploy engine pinned for this run
    pub deploy_engine: String,
}

impl QueueStatus {
    /// Clear the progress of the previous run, keeping the creation time and
    /// the processed counter.
    pub fn reset(&mut self) {
        *self = QueueStatus {
            created_at: self.created_at,
            updated_at: Some(Utc::now()),
            no_of_processed: self.no_of_processed,
            ..Default::default()
        };
    }
}

impl Queue {
    /// Current workflow state (`waiting` when no status was written yet)
    pub fn state(&self) -> QueueState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut QueueStatus {
        self.status.get_or_insert_with(QueueStatus::default)
    }

    /// Move to a new state and stamp the update time
    pub fn set_state(&mut self, state: QueueState) {
        let status = self.status_mut();
        status.state = state;
        status.updated_at = Some(Utc::now());
    }

    /// Look up a checkpoint
    pub fn condition(&self, type_: QueueConditionType) -> Option<&QueueCondition> {
        self.status.as_ref().and_then(|s| s.conditions.get(type_))
    }

    /// Whether a checkpoint is recorded as True
    pub fn is_condition_true(&self, type_: QueueConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_true(type_))
            .unwrap_or(false)
    }

    /// Record a checkpoint
    pub fn set_condition(
        &mut self,
        type_: QueueConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let queue_status = self.status_mut();
        queue_status.conditions.set(type_, status, reason, message);
        queue_status.updated_at = Some(Utc::now());
    }

    /// Whether this queue is a promotion/demotion swap
    pub fn is_promotion(&self) -> bool {
        self.spec.type_.is_promotion()
    }

    /// Whether this queue re-runs the last stable version
    pub fn is_reverify(&self) -> bool {
        self.spec.type_ == QueueType::Reverify
    }

    /// Whether the releases became ready
    pub fn is_deploy_success(&self) -> bool {
        self.is_condition_true(QueueConditionType::Deployed)
    }

    /// Whether the test passed
    pub fn is_test_success(&self) -> bool {
        self.is_condition_true(QueueConditionType::Tested)
    }

    /// Desired image of the queue
    pub fn image(&self) -> Image {
        Image::new(&self.spec.repository, &self.spec.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_queue() -> Queue {
        Queue::new(
            "redis",
            QueueSpec::new("redis", "bitnami/redis", "5.0.5-r1", QueueType::Upgrade)
                .with_team("payments"),
        )
    }

    #[test]
    fn spec_serializes_with_store_field_names() {
        let mut spec = QueueSpec::new("redis", "bitnami/redis", "5.0.5-r1", QueueType::Upgrade)
            .with_team("payments");
        spec.no_of_retry = 2;
        spec.no_of_order = 7;
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(json["name"], "redis");
        assert_eq!(json["repository"], "bitnami/redis");
        assert_eq!(json["version"], "5.0.5-r1");
        assert_eq!(json["type"], "upgrade");
        assert_eq!(json["noOfRetry"], 2);
        assert_eq!(json["noOfOrder"], 7);
        assert_eq!(json["teamName"], "payments");
    }

    #[test]
    fn status_serializes_with_store_field_names() {
        let mut queue = sample_queue();
        queue.set_state(QueueState::Creating);
        let status = queue.status.clone().unwrap();
        let json = serde_json::to_value(&status).unwrap();

        for key in [
            "createdAt",
            "updatedAt",
            "nextProcessAt",
            "startDeployTime",
            "startTestingTime",
            "state",
            "noOfProcessed",
            "releaseName",
            "conditions",
            "testRunners",
            "queueHistoryName",
            "kubeZipLog",
            "imageMissingList",
            "deployEngine",
        ] {
            assert!(json.get(key).is_some(), "missing status field {key}");
        }
        assert_eq!(json["state"], "creating");
    }

    #[test]
    fn empty_state_means_waiting() {
        let status: QueueStatus = serde_json::from_str(r#"{"state":""}"#).unwrap();
        assert_eq!(status.state, QueueState::Waiting);

        let status: QueueStatus = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(status.state, QueueState::Waiting);
    }

    #[test]
    fn queue_types_use_kebab_case() {
        assert_eq!(
            serde_json::to_string(&QueueType::PromoteToActive).unwrap(),
            "\"promote-to-active\""
        );
        assert_eq!(
            serde_json::from_str::<QueueType>("\"demote-from-active\"").unwrap(),
            QueueType::DemoteFromActive
        );
        assert!(QueueType::PromoteToActive.is_promotion());
        assert!(QueueType::DemoteFromActive.is_promotion());
        assert!(!QueueType::PreActive.is_promotion());
        assert!(!QueueType::Reverify.is_promotion());
    }

    mod conditions {
        use super::*;

        #[test]
        fn upsert_keeps_one_entry_per_type() {
            let mut queue = sample_queue();
            queue.set_condition(
                QueueConditionType::Deployed,
                ConditionStatus::False,
                "Waiting",
                "",
            );
            queue.set_condition(
                QueueConditionType::Deployed,
                ConditionStatus::True,
                "DeploySucceeded",
                "",
            );

            let status = queue.status.as_ref().unwrap();
            assert_eq!(status.conditions.len(), 1);
            assert!(queue.is_deploy_success());
            assert_eq!(
                queue.condition(QueueConditionType::Deployed).unwrap().reason,
                "DeploySucceeded"
            );
        }

        #[test]
        fn transition_time_only_moves_on_status_change() {
            let mut conditions = Conditions::default();
            conditions.set(
                QueueConditionType::CleaningBeforeStarted,
                ConditionStatus::True,
                "Started",
                "",
            );
            let first = conditions
                .get(QueueConditionType::CleaningBeforeStarted)
                .unwrap()
                .last_transition_time;

            conditions.set(
                QueueConditionType::CleaningBeforeStarted,
                ConditionStatus::True,
                "StillCleaning",
                "",
            );
            let second = conditions
                .get(QueueConditionType::CleaningBeforeStarted)
                .unwrap();
            assert_eq!(second.last_transition_time, first);
            assert_eq!(second.reason, "StillCleaning");
        }

        #[test]
        fn duplicates_on_the_wire_collapse_on_read() {
            let json = r#"[
                {"type":"Tested","status":"False","lastTransitionTime":"2024-01-01T00:00:00Z"},
                {"type":"Tested","status":"True","lastTransitionTime":"2024-01-01T00:01:00Z"}
            ]"#;
            let conditions: Conditions = serde_json::from_str(json).unwrap();
            assert_eq!(conditions.len(), 1);
            assert!(conditions.is_true(QueueConditionType::Tested));
        }

        #[test]
        fn unknown_until_recorded() {
            let queue = sample_queue();
            assert!(!queue.is_condition_true(QueueConditionType::Tested));
            assert!(queue.condition(QueueConditionType::Tested).is_none());
        }
    }

    #[test]
    fn reset_keeps_creation_and_processed_count() {
        let mut queue = sample_queue();
        let created = Utc::now();
        {
            let status = queue.status_mut();
            status.created_at = Some(created);
            status.no_of_processed = 3;
            status.release_name = "payments-s2h-redis".to_string();
            status.kube_zip_log = "H4sI".to_string();
            status.image_missing_list = vec![Image::new("bitnami/redis", "x")];
        }
        queue.set_condition(
            QueueConditionType::Deployed,
            ConditionStatus::True,
            "DeploySucceeded",
            "",
        );
        queue.set_state(QueueState::Deleting);

        queue.status_mut().reset();

        let status = queue.status.as_ref().unwrap();
        assert_eq!(status.created_at, Some(created));
        assert_eq!(status.no_of_processed, 3);
        assert_eq!(status.state, QueueState::Waiting);
        assert!(status.conditions.is_empty());
        assert!(status.release_name.is_empty());
        assert!(status.kube_zip_log.is_empty());
        assert!(status.image_missing_list.is_empty());
    }
}

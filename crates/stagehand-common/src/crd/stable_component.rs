//! StableComponent Custom Resource Definition
//!
//! The last version of a component that deployed and tested successfully in
//! the tenant's staging namespace. Sibling components are deployed at these
//! versions while a queue runs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Image;

/// Last known-good version of a component
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stagehand.dev",
    version = "v1beta1",
    kind = "StableComponent",
    plural = "stablecomponents",
    shortname = "sc",
    namespaced,
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StableComponentSpec {
    /// Component name
    pub name: String,
    /// Image repository
    pub repository: String,
    /// Image tag
    pub version: String,
    /// Queue history record that promoted this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl StableComponentSpec {
    /// Create a stable component spec
    pub fn new(
        name: impl Into<String>,
        repository: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            version: version.into(),
            updated_by: None,
        }
    }

    /// Image coordinate of this stable version
    pub fn image(&self) -> Image {
        Image::new(&self.repository, &self.version)
    }
}

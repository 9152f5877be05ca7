//! Common types for Stagehand: CRDs, tenant configuration, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod values;

pub use config::{ConfigSource, SharedConfig};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Stagehand custom resources
pub const CRD_GROUP: &str = "stagehand.dev";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "stagehand-staging-controller";

/// Default port for the controller's HTTP surface (health + RPC)
pub const DEFAULT_HTTP_PORT: u16 = 8090;

/// Generate the release name for a component deployed by a team in a namespace.
///
/// Release names are deterministic so that cleanup, readiness checks, and
/// label selectors can be recomputed on every tick without persisted state.
pub fn release_name(team: &str, namespace: &str, component: &str) -> String {
    format!("{}-{}-{}", team, namespace, component).to_lowercase()
}

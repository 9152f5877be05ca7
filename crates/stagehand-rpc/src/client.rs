//! Outbound calls to the peer service

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stagehand_common::crd::Image;
use tracing::debug;

use crate::types::{
    ComponentUpgradeReport, ComponentVersion, MissingVersionRequest, MissingVersionResponse,
};
use crate::{Error, Result, AUTH_HEADER, PEER_RPC_PREFIX};

/// Timeout of a single peer request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The peer service as seen by the staging controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Report the outcome of a run
    async fn notify_component_upgrade(&self, report: &ComponentUpgradeReport) -> Result<()>;

    /// Images of `components` that the peer's registry does not have
    async fn get_missing_versions(
        &self,
        team: &str,
        components: &[ComponentVersion],
    ) -> Result<Vec<Image>>;
}

/// Peer client speaking JSON over HTTP
pub struct HttpPeerClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpPeerClient {
    /// Client for the peer at `endpoint` (e.g. `http://stagehand:8080`)
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}{}/{}", self.endpoint, PEER_RPC_PREFIX, method)
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(method);
        debug!(method, url = %url, "Calling peer");

        let response = self
            .http
            .post(&url)
            .header(AUTH_HEADER, &self.token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PeerStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"{}")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn notify_component_upgrade(&self, report: &ComponentUpgradeReport) -> Result<()> {
        let _: serde_json::Value = self.call("NotifyComponentUpgrade", report).await?;
        Ok(())
    }

    async fn get_missing_versions(
        &self,
        team: &str,
        components: &[ComponentVersion],
    ) -> Result<Vec<Image>> {
        let request = MissingVersionRequest {
            team_name: team.to_string(),
            components: components.to_vec(),
        };
        let response: MissingVersionResponse = self.call("GetMissingVersion", &request).await?;
        Ok(response.images)
    }
}

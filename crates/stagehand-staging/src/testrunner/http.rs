//! Test runner for HTTP test services
//!
//! The service is started with a POST to `triggerUrl` and polled with a GET
//! on `resultUrl` until it reports `finished`. A `buildId` returned by the
//! trigger is sent back on every poll.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_common::config::{HttpTestConfig, TestRunnerConfig};
use stagehand_common::crd::{Queue, TestRunnerStatus};
use tracing::{debug, info};

use super::{TestResult, TestRunner};
use crate::{Result, StagingError};

/// Registry name of the HTTP runner
pub const HTTP_RUNNER: &str = "http";

/// Timeout of a single request to the test service
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest<'a> {
    queue: &'a str,
    team_name: &'a str,
    component: &'a str,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    #[serde(default)]
    build_id: Option<String>,
    #[serde(default)]
    build_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    success: bool,
}

/// Runner talking to an HTTP test service
pub struct HttpTestRunner {
    http: reqwest::Client,
}

impl HttpTestRunner {
    /// Runner with the default request timeout
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(failed)?;
        Ok(Self { http })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        http: &HttpTestConfig,
    ) -> reqwest::RequestBuilder {
        http.headers
            .iter()
            .fold(self.http.request(method, url), |req, (k, v)| req.header(k, v))
    }
}

fn failed(err: impl std::fmt::Display) -> StagingError {
    StagingError::test_runner(HTTP_RUNNER, err.to_string())
}

fn http_config(config: &TestRunnerConfig) -> Result<&HttpTestConfig> {
    config
        .http
        .as_ref()
        .ok_or_else(|| failed("no http test configuration"))
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(failed(format!("test service returned {}: {}", status, body.trim())))
}

#[async_trait]
impl TestRunner for HttpTestRunner {
    fn name(&self) -> &str {
        HTTP_RUNNER
    }

    async fn trigger(&self, config: &TestRunnerConfig, queue: &mut Queue) -> Result<()> {
        let http = http_config(config)?;
        let body = TriggerRequest {
            queue: &queue.spec.name,
            team_name: &queue.spec.team_name,
            component: &queue.spec.name,
            version: &queue.spec.version,
        };

        let response = self
            .request(reqwest::Method::POST, &http.trigger_url, http)
            .json(&body)
            .send()
            .await
            .map_err(failed)?;
        let bytes = checked(response).await?.bytes().await.map_err(failed)?;
        let started: TriggerResponse = if bytes.is_empty() {
            TriggerResponse::default()
        } else {
            serde_json::from_slice(&bytes)?
        };

        info!(
            queue = %queue.spec.name,
            build_id = started.build_id.as_deref().unwrap_or_default(),
            "Test triggered"
        );
        queue.status_mut().test_runners = Some(TestRunnerStatus {
            name: HTTP_RUNNER.to_string(),
            build_id: started.build_id,
            build_url: started.build_url,
        });
        Ok(())
    }

    async fn get_result(&self, config: &TestRunnerConfig, queue: &Queue) -> Result<TestResult> {
        let http = http_config(config)?;
        let build_id = queue
            .status
            .as_ref()
            .and_then(|s| s.test_runners.as_ref())
            .and_then(|t| t.build_id.clone());

        let mut request = self.request(reqwest::Method::GET, &http.result_url, http);
        if let Some(id) = &build_id {
            request = request.query(&[("buildId", id)]);
        }
        let response = request.send().await.map_err(failed)?;
        let result: ResultResponse = checked(response).await?.json().await.map_err(failed)?;

        debug!(
            queue = %queue.spec.name,
            finished = result.finished,
            success = result.success,
            "Polled test result"
        );
        Ok(if result.finished {
            TestResult::finished(result.success)
        } else {
            TestResult::pending()
        })
    }
}

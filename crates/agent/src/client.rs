use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relay_core::api::{
    routes, HeartbeatRequest, HeartbeatResponse, ReportRequest, ReportResponse, TaskAssignment,
};
use reqwest::StatusCode;

pub const USER_AGENT: &str = concat!("relay-agent/", env!("CARGO_PKG_VERSION"));

/// The daemon's agent-facing API.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn heartbeat(&self) -> anyhow::Result<HeartbeatResponse>;

    /// `None` when the daemon has nothing for this agent.
    async fn poll(&self) -> anyhow::Result<Option<TaskAssignment>>;

    async fn report(&self, task_id: &str, report: &ReportRequest) -> anyhow::Result<ReportResponse>;
}

pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRelayClient {
    pub fn new(base_url: &str, token: String, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turns a non-2xx response into an error carrying the daemon's message.
async fn ensure_success(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("daemon returned {status}: {}", body.trim())
}

#[async_trait]
impl RelayApi for HttpRelayClient {
    async fn heartbeat(&self) -> anyhow::Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(self.url(routes::AGENT_HEARTBEAT))
            .bearer_auth(&self.token)
            .json(&HeartbeatRequest {
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            })
            .send()
            .await
            .context("heartbeat request")?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    async fn poll(&self) -> anyhow::Result<Option<TaskAssignment>> {
        let resp = self
            .http
            .post(self.url(routes::AGENT_POLL))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("poll request")?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let assignment = ensure_success(resp)
            .await?
            .json::<TaskAssignment>()
            .await
            .context("decoding task assignment")?;
        Ok(Some(assignment))
    }

    async fn report(&self, task_id: &str, report: &ReportRequest) -> anyhow::Result<ReportResponse> {
        let resp = self
            .http
            .post(self.url(&routes::agent_report(task_id)))
            .bearer_auth(&self.token)
            .json(report)
            .send()
            .await
            .context("report request")?;
        Ok(ensure_success(resp).await?.json().await?)
    }
}

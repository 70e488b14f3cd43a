//! reqwest dispatcher for moderation calls.
//!
//! Hosts that run on tokio can use [`ModerationTransport::spawn`] to issue a
//! call in the background and receive a [`Completion`] on a channel, then
//! feed it to the exchange identified by `key`.

use crate::config::ServiceEndpoint;
use crate::error::{GuardError, Result};
use crate::signer::ModerationRequest;
use crate::verdict::HttpReply;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of one dispatched call.
#[derive(Debug)]
pub struct Completion {
    /// Caller-chosen id of the exchange that issued the call.
    pub key: u64,
    pub reply: Result<HttpReply>,
}

#[derive(Debug, Clone)]
pub struct ModerationTransport {
    client: reqwest::Client,
    base_url: String,
    host: String,
}

impl ModerationTransport {
    /// `base_url` is where connections go; `host` is the signed host header.
    pub fn new(base_url: impl Into<String>, host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GuardError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            host: host.into(),
        })
    }

    pub fn from_endpoint(endpoint: &ServiceEndpoint) -> Result<Self> {
        Self::new(
            format!("https://{}:{}", endpoint.host, endpoint.port),
            endpoint.host.clone(),
        )
    }

    /// Send one call and wait for the reply. Non-2xx statuses are returned
    /// as replies; only connection failures and timeouts are errors.
    pub async fn send(&self, request: &ModerationRequest, timeout: Duration) -> Result<HttpReply> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(reqwest::header::HOST, self.host.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| GuardError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| GuardError::Transport(e.to_string()))?;
        tracing::debug!(
            action = %request.action,
            service = %request.service,
            status,
            "moderation call completed"
        );
        Ok(HttpReply::new(status, body.to_vec()))
    }

    /// Issue a call on the current tokio runtime.
    pub fn spawn(
        &self,
        key: u64,
        request: ModerationRequest,
        timeout: Duration,
        completions: mpsc::Sender<Completion>,
    ) -> Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GuardError::Transport(format!("no async runtime: {}", e)))?;
        let transport = self.clone();
        Ok(runtime.spawn(async move {
            let reply = transport.send(&request, timeout).await;
            if completions.send(Completion { key, reply }).await.is_err() {
                tracing::warn!(key, "completion dropped, receiver closed");
            }
        }))
    }
}

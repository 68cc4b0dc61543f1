//! HTTP client for the lab-control service.
//!
//! ```text
//! POST {base}/labs/{lab_ref}/start
//! POST {base}/labs/{lab_ref}/stop
//! GET  {base}/labs/{lab_ref}/state   -> {"state": "RUNNING"}
//! ```
//!
//! The bearer token comes from the per-call context and `X-Request-Id`
//! carries the context's request id.

use std::time::Duration;

use anyhow::Context;
use labslot_core::model::RuntimeState;
use labslot_core::runtime::{LabRuntimeClient, RuntimeContext, RuntimeFailure, RuntimeFuture};
use serde::Deserialize;
use tracing::debug;

/// Bytes of an error response body kept in the failure message.
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct HttpLabRuntime {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

impl HttpLabRuntime {
    /// `timeout` is a transport backstop; the engine enforces its own
    /// per-call deadline on top.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base_url = reqwest::Url::parse(base_url)
            .with_context(|| format!("invalid runtime base URL: {base_url}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, lab_ref: &str, action: &str) -> Result<reqwest::Url, RuntimeFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RuntimeFailure::unavailable("runtime base URL cannot be a base"))?
            .pop_if_empty()
            .extend(["labs", lab_ref, action]);
        Ok(url)
    }

    async fn send(
        &self,
        ctx: &RuntimeContext,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RuntimeFailure> {
        let mut request = request.header("X-Request-Id", &ctx.request_id);
        if let Some(token) = ctx.credentials.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RuntimeFailure::unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        let message = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };
        if status.is_server_error() {
            // 5xx is the service failing, not refusing
            return Err(RuntimeFailure::unavailable(message));
        }
        Err(RuntimeFailure::rejected(status.as_u16(), message))
    }

    async fn post_action(
        &self,
        ctx: &RuntimeContext,
        lab_ref: &str,
        action: &str,
    ) -> Result<(), RuntimeFailure> {
        let url = self.endpoint(lab_ref, action)?;
        debug!(lab_ref, action, request_id = %ctx.request_id, "Runtime request");
        self.send(ctx, self.client.post(url)).await.map(|_| ())
    }
}

impl LabRuntimeClient for HttpLabRuntime {
    fn name(&self) -> &'static str {
        "http"
    }

    fn start<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(self.post_action(ctx, lab_ref, "start"))
    }

    fn stop<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(self.post_action(ctx, lab_ref, "stop"))
    }

    fn get_state<'a>(
        &'a self,
        ctx: &'a RuntimeContext,
        lab_ref: &'a str,
    ) -> RuntimeFuture<'a, RuntimeState> {
        Box::pin(async move {
            let url = self.endpoint(lab_ref, "state")?;
            let response = self.send(ctx, self.client.get(url)).await?;
            let body: StateResponse = response.json().await.map_err(|e| {
                RuntimeFailure::unavailable(format!("malformed state response: {e}"))
            })?;
            Ok(RuntimeState::parse(&body.state))
        })
    }
}

//! Lab runtime control: the remote service that starts and stops labs.
//!
//! Clients receive credentials through an explicit [`RuntimeContext`] on every
//! call; there is no ambient session. [`RuntimeGateway`] wraps a client with a
//! per-call timeout and maps failures into [`ExternalError`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ExternalError, Result};
use crate::model::RuntimeState;

/// Service name used in errors and logs.
pub const RUNTIME_SERVICE: &str = "lab-runtime";

/// Credentials for the lab-control service. The token never appears in
/// `Debug` output.
#[derive(Clone, Default)]
pub struct RuntimeCredentials {
    token: Option<String>,
}

impl RuntimeCredentials {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Debug for RuntimeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeCredentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Per-call context passed to every runtime operation.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub credentials: RuntimeCredentials,
    /// Correlates remote calls with local log lines.
    pub request_id: String,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(credentials: RuntimeCredentials) -> Self {
        Self {
            credentials,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Failure reported by a runtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    /// Remote status code, when the service answered.
    pub status: Option<u16>,
    pub message: String,
}

impl RuntimeFailure {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Runtime client future type.
pub type RuntimeFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, RuntimeFailure>> + Send + 'a>>;

/// Async lab-control interface.
pub trait LabRuntimeClient: Send + Sync {
    /// Client identifier used in logs.
    fn name(&self) -> &'static str;

    fn start<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()>;

    fn stop<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()>;

    fn get_state<'a>(
        &'a self,
        ctx: &'a RuntimeContext,
        lab_ref: &'a str,
    ) -> RuntimeFuture<'a, RuntimeState>;
}

/// Timeout-enforcing wrapper around a [`LabRuntimeClient`].
#[derive(Clone)]
pub struct RuntimeGateway {
    client: Arc<dyn LabRuntimeClient>,
    credentials: RuntimeCredentials,
    timeout: Duration,
}

impl fmt::Debug for RuntimeGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeGateway")
            .field("client", &self.client.name())
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RuntimeGateway {
    #[must_use]
    pub fn new(
        client: Arc<dyn LabRuntimeClient>,
        credentials: RuntimeCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            credentials,
            timeout,
        }
    }

    /// Fresh context for one logical operation.
    #[must_use]
    pub fn context(&self) -> RuntimeContext {
        RuntimeContext::new(self.credentials.clone())
    }

    pub async fn start(&self, ctx: &RuntimeContext, lab_ref: &str) -> Result<()> {
        self.call("start", ctx, lab_ref, self.client.start(ctx, lab_ref))
            .await
    }

    pub async fn stop(&self, ctx: &RuntimeContext, lab_ref: &str) -> Result<()> {
        self.call("stop", ctx, lab_ref, self.client.stop(ctx, lab_ref))
            .await
    }

    pub async fn get_state(&self, ctx: &RuntimeContext, lab_ref: &str) -> Result<RuntimeState> {
        self.call("get_state", ctx, lab_ref, self.client.get_state(ctx, lab_ref))
            .await
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        ctx: &RuntimeContext,
        lab_ref: &str,
        future: RuntimeFuture<'_, T>,
    ) -> Result<T> {
        debug!(
            client = self.client.name(),
            operation,
            lab_ref,
            request_id = %ctx.request_id,
            "Calling lab runtime"
        );
        match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => {
                warn!(
                    operation,
                    lab_ref,
                    request_id = %ctx.request_id,
                    status = ?failure.status,
                    error = %failure.message,
                    "Lab runtime call failed"
                );
                Err(match failure.status {
                    Some(status) => ExternalError::Rejected {
                        service: RUNTIME_SERVICE.to_string(),
                        status: Some(status),
                        message: failure.message,
                    },
                    None => ExternalError::Unavailable {
                        service: RUNTIME_SERVICE.to_string(),
                        message: failure.message,
                    },
                }
                .into())
            }
            Err(_) => {
                warn!(
                    operation,
                    lab_ref,
                    request_id = %ctx.request_id,
                    timeout_ms = self.timeout_ms(),
                    "Lab runtime call timed out"
                );
                Err(ExternalError::Timeout {
                    service: RUNTIME_SERVICE.to_string(),
                    operation: operation.to_string(),
                    timeout_ms: self.timeout_ms(),
                }
                .into())
            }
        }
    }
}

// =============================================================================
// Simulated runtime
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeOp {
    Start,
    Stop,
    GetState,
}

/// One call observed by [`SimulatedLabRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeCall {
    pub op: RuntimeOp,
    pub lab_ref: String,
    pub request_id: String,
}

#[derive(Default)]
struct SimulatedState {
    labs: HashMap<String, RuntimeState>,
    calls: Vec<RuntimeCall>,
    failures: HashMap<RuntimeOp, VecDeque<RuntimeFailure>>,
    delay: Option<Duration>,
}

/// In-process lab runtime: labs flip between `STOPPED` and `RUNNING`.
///
/// Starting a lab that is not stopped is rejected with status 409, like the
/// real service. Failures and latency can be injected per operation.
#[derive(Clone, Default)]
pub struct SimulatedLabRuntime {
    inner: Arc<Mutex<SimulatedState>>,
}

impl fmt::Debug for SimulatedLabRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedLabRuntime").finish_non_exhaustive()
    }
}

impl SimulatedLabRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, lab_ref: &str, state: RuntimeState) {
        self.lock().labs.insert(lab_ref.to_string(), state);
    }

    /// Current simulated state; labs never touched are `STOPPED`.
    #[must_use]
    pub fn state(&self, lab_ref: &str) -> RuntimeState {
        self.lock()
            .labs
            .get(lab_ref)
            .copied()
            .unwrap_or(RuntimeState::Stopped)
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: RuntimeOp, failure: RuntimeFailure) {
        self.lock().failures.entry(op).or_default().push_back(failure);
    }

    /// Delay every call by `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self, op: RuntimeOp, lab_ref: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op == op && call.lab_ref == lab_ref)
            .count()
    }

    fn record(
        &self,
        op: RuntimeOp,
        ctx: &RuntimeContext,
        lab_ref: &str,
    ) -> (Option<Duration>, Option<RuntimeFailure>) {
        let mut state = self.lock();
        state.calls.push(RuntimeCall {
            op,
            lab_ref: lab_ref.to_string(),
            request_id: ctx.request_id.clone(),
        });
        let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        (state.delay, failure)
    }

    fn apply(&self, op: RuntimeOp, lab_ref: &str) -> std::result::Result<RuntimeState, RuntimeFailure> {
        let mut state = self.lock();
        let current = state
            .labs
            .get(lab_ref)
            .copied()
            .unwrap_or(RuntimeState::Stopped);
        match op {
            RuntimeOp::Start => {
                if !matches!(current, RuntimeState::Stopped | RuntimeState::Unknown) {
                    return Err(RuntimeFailure::rejected(
                        409,
                        format!("lab {lab_ref} is {current}"),
                    ));
                }
                state.labs.insert(lab_ref.to_string(), RuntimeState::Running);
                Ok(RuntimeState::Running)
            }
            RuntimeOp::Stop => {
                state.labs.insert(lab_ref.to_string(), RuntimeState::Stopped);
                Ok(RuntimeState::Stopped)
            }
            RuntimeOp::GetState => Ok(current),
        }
    }

    async fn run(
        &self,
        op: RuntimeOp,
        ctx: &RuntimeContext,
        lab_ref: &str,
    ) -> std::result::Result<RuntimeState, RuntimeFailure> {
        let (delay, failure) = self.record(op, ctx, lab_ref);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = failure {
            return Err(failure);
        }
        self.apply(op, lab_ref)
    }
}

impl LabRuntimeClient for SimulatedLabRuntime {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn start<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move { self.run(RuntimeOp::Start, ctx, lab_ref).await.map(|_| ()) })
    }

    fn stop<'a>(&'a self, ctx: &'a RuntimeContext, lab_ref: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move { self.run(RuntimeOp::Stop, ctx, lab_ref).await.map(|_| ()) })
    }

    fn get_state<'a>(
        &'a self,
        ctx: &'a RuntimeContext,
        lab_ref: &'a str,
    ) -> RuntimeFuture<'a, RuntimeState> {
        Box::pin(async move { self.run(RuntimeOp::GetState, ctx, lab_ref).await })
    }
}

//! Health probing with retries.
//!
//! A probe either succeeds, fails in a way worth retrying, or fails fatally.
//! `retry` keeps calling it on a fixed interval until it succeeds, a fatal
//! failure occurs, the timeout elapses, or the caller cancels.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Interval between probes of the same dependency.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Failure reported by a single probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Not ready yet; the probe will be called again.
    #[error("{0:#}")]
    Retryable(anyhow::Error),
    /// Will never become ready; stop waiting immediately.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl ProbeError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        ProbeError::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        ProbeError::Fatal(err.into())
    }
}

/// An application exposing a readiness check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Runs a single health check.
    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), ProbeError>;
}

/// Outcome of an unsuccessful `retry`.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("timed out{}", last_reason(.last))]
    Timeout { last: Option<anyhow::Error> },
    #[error("{0:#}")]
    Fatal(anyhow::Error),
    #[error("cancelled")]
    Cancelled,
}

fn last_reason(last: &Option<anyhow::Error>) -> String {
    match last {
        Some(err) => format!(", last error: {err:#}"),
        None => String::new(),
    }
}

/// A dependency waited on with its own timeout.
#[derive(Clone)]
pub struct WaitStep {
    pub label: String,
    pub timeout: Duration,
    pub dependency: Arc<dyn HealthCheck>,
}

/// Calls `probe` every `interval` until it succeeds or `timeout` elapses.
pub async fn retry<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<(), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ProbeError>>,
{
    let deadline = Instant::now() + timeout;
    let mut last = None;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = probe() => outcome,
            _ = tokio::time::sleep_until(deadline) => return Err(RetryError::Timeout { last }),
        };
        match outcome {
            Ok(()) => return Ok(()),
            Err(ProbeError::Fatal(err)) => return Err(RetryError::Fatal(err)),
            Err(ProbeError::Retryable(err)) => {
                debug!(error = %format!("{err:#}"), "Probe failed, will retry");
                last = Some(err);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::Timeout { last });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep_until((now + interval).min(deadline)) => {}
        }
    }
}

/// Waits for every dependency in turn, all sharing one `timeout`.
pub async fn wait_until_healthy(
    cancel: &CancellationToken,
    timeout: Duration,
    dependencies: &[Arc<dyn HealthCheck>],
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    for dependency in dependencies {
        wait_one(cancel, deadline, dependency.as_ref(), None).await?;
    }
    Ok(())
}

/// Waits for each step in turn, each under its own timeout.
pub async fn wait_steps(cancel: &CancellationToken, steps: &[WaitStep]) -> Result<()> {
    for step in steps {
        let deadline = Instant::now() + step.timeout;
        wait_one(
            cancel,
            deadline,
            step.dependency.as_ref(),
            Some(step.label.as_str()),
        )
        .await?;
    }
    Ok(())
}

async fn wait_one(
    cancel: &CancellationToken,
    deadline: Instant,
    dependency: &dyn HealthCheck,
    label: Option<&str>,
) -> Result<()> {
    let name = match label {
        Some(label) => format!("{} ({})", dependency.name(), label),
        None => dependency.name().to_string(),
    };
    info!(app = %name, "Waiting until healthy");
    let timeout = deadline.saturating_duration_since(Instant::now());
    retry(cancel, timeout, PROBE_INTERVAL, || dependency.health_check(cancel))
        .await
        .map_err(|err| match err {
            RetryError::Timeout { last } => Error::DependencyUnavailable {
                reason: last
                    .map(|err| format!("{err:#}"))
                    .unwrap_or_else(|| "no probe completed before the timeout".to_string()),
                name,
            },
            RetryError::Fatal(err) => Error::HealthCheck {
                name,
                reason: format!("{err:#}"),
            },
            RetryError::Cancelled => Error::Cancelled,
        })?;
    debug!(app = %dependency.name(), "Healthy");
    Ok(())
}

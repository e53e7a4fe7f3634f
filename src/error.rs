//! Error types for localnet.
//!
//! Invariant violations (conflicting endpoints, app type changes) are not
//! represented here: they panic, because correct callers never trigger them.

use std::process::ExitStatus;

use thiserror::Error;

/// Errors produced while deploying, supervising, or persisting an environment.
#[derive(Error, Debug)]
pub enum Error {
    #[error("stored environment state belongs to {field} {stored:?}, but {requested:?} was requested")]
    SpecMismatch {
        field: &'static str,
        stored: String,
        requested: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no more IPs available")]
    IpPoolExhausted,

    #[error("dependency {name} did not become healthy: {reason}")]
    DependencyUnavailable { name: String, reason: String },

    #[error("health check of {name} failed: {reason}")]
    HealthCheck { name: String, reason: String },

    #[error("command {command} failed: {status}")]
    CommandFailed { command: String, status: ExitStatus },

    #[error("failed to start command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} executable not found in PATH")]
    ToolNotFound { tool: &'static str },

    #[error("failed to render template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Hook(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

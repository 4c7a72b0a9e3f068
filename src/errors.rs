//! Typed error hierarchy for the Forge pipeline core.
//!
//! Three top-level enums cover the subsystem boundaries:
//! - `ConfigError`: configuration loading and validation failures
//! - `AgentError`: agent process failures (spawn, timeout, exit)
//! - `GraphError`: dependency-graph construction failures
//!
//! Step-level failures inside the pipeline travel as `anyhow::Error` and are
//! wrapped by the step runner into the `step N (<name>): <detail>` form that
//! reaches the user.

use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    /// All validation failures, aggregated so the user sees every problem at
    /// once instead of fixing them one by one.
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Errors from running an agent process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // Display must contain "timed out" so the fallback wrapper treats
    // timeouts as retryable.
    #[error("agent '{name}' timed out after {seconds}s")]
    TimedOut { name: String, seconds: u64 },

    #[error("agent '{name}' exited with code {code}: {detail}")]
    NonZeroExit {
        name: String,
        code: i32,
        detail: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from dependency-graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The cycle path lists the participants in walk order, e.g.
    /// `#1 → #2 → #1`.
    #[error("dependency cycle: {path}")]
    Cycle { path: String },
}

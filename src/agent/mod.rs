//! Agent runners: the capability the pipeline drives, the CLI-process
//! implementation, and the pool with retryable-error fallback.

pub mod cli;
pub mod pool;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use cli::CliAgent;
pub use pool::{AgentPool, FallbackAgent, is_retryable_error};

/// A coding agent the pipeline can point at a working directory.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Display label, e.g. `claude` or `codex`.
    fn name(&self) -> &str;

    /// Provider-specific instructions appended to every prompt.
    fn prompt_suffix(&self) -> &str;

    /// Run the agent in `dir` with `prompt`, streaming raw output to
    /// `log_path`. Returns the agent's final output.
    async fn run(&self, dir: &Path, prompt: &str, log_path: &Path) -> Result<String>;
}

//! Agent pool: round-robin assignment plus fallback-on-retryable-error.
//!
//! `FallbackAgent` is a decorator satisfying the `Agent` trait, so the
//! pipeline never knows whether it is talking to one agent or a rotating
//! pool.

use super::Agent;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Error-message fragments that mark an agent failure as worth retrying on
/// the next agent in the pool: rate limiting, quota, auth, timeout.
const RETRYABLE_MARKERS: [&str; 8] = [
    "rate limit",
    "429",
    "quota",
    "exceeded",
    "unauthorized",
    "403",
    "credentials",
    "timed out",
];

/// Whether an agent error should rotate to the next agent. Classification
/// is by message content: provider CLIs surface these conditions as text,
/// not as structured codes.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| msg.contains(marker))
}

/// A fixed set of agents with display names, assigned round-robin.
pub struct AgentPool {
    agents: Vec<Arc<dyn Agent>>,
    names: Vec<String>,
}

impl AgentPool {
    pub fn new(agents: Vec<Arc<dyn Agent>>, names: Vec<String>) -> Result<Self> {
        if agents.is_empty() {
            bail!("agent pool must not be empty");
        }
        if agents.len() != names.len() {
            bail!(
                "agent pool has {} agents but {} names",
                agents.len(),
                names.len()
            );
        }
        Ok(Self { agents, names })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agent for assignment ordinal `i` (round-robin).
    pub fn assign(&self, i: usize) -> &Arc<dyn Agent> {
        &self.agents[i % self.agents.len()]
    }

    /// Display name for assignment ordinal `i`.
    pub fn assign_name(&self, i: usize) -> &str {
        &self.names[i % self.names.len()]
    }
}

/// Decorator over the pool: starts at a seed index and advances to the next
/// agent on retryable errors until one succeeds or the pool is exhausted.
pub struct FallbackAgent {
    pool: Arc<AgentPool>,
    start: usize,
}

impl FallbackAgent {
    pub fn new(pool: Arc<AgentPool>, start: usize) -> Self {
        Self { pool, start }
    }
}

#[async_trait]
impl Agent for FallbackAgent {
    fn name(&self) -> &str {
        self.pool.assign_name(self.start)
    }

    fn prompt_suffix(&self) -> &str {
        self.pool.assign(self.start).prompt_suffix()
    }

    async fn run(&self, dir: &Path, prompt: &str, log_path: &Path) -> Result<String> {
        let len = self.pool.len();
        for offset in 0..len {
            let idx = self.start + offset;
            let agent = self.pool.assign(idx);
            let name = self.pool.assign_name(idx);

            match agent.run(dir, prompt, log_path).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    let last = offset + 1 == len;
                    if !last && is_retryable_error(&err) {
                        tracing::warn!(
                            agent = name,
                            error = %format!("{err:#}"),
                            "retryable agent error, falling back to next agent"
                        );
                        continue;
                    }
                    return Err(anyhow!("agent {name}: {err:#}"));
                }
            }
        }
        unreachable!("agent pool is never empty")
    }
}

//! CLI-process agent runner.
//!
//! Spawns the agent CLI in the worktree, writes the prompt to stdin, and
//! streams stdout line by line into the per-step log file. Providers that
//! emit a stream-JSON envelope get their final `result` extracted; anything
//! else falls back to the accumulated raw output.

use super::Agent;
use crate::config::AgentConfig;
use crate::errors::AgentError;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// One event in the provider's stream-JSON output. Only the terminal
/// `result` event matters here; everything else is passthrough.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

pub struct CliAgent {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    prompt_suffix: String,
}

impl CliAgent {
    /// Claude Code in non-interactive mode.
    pub fn claude(config: &AgentConfig) -> Self {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if !config.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(config.allowed_tools.join(","));
        }
        Self {
            name: "claude".to_string(),
            program: "claude".to_string(),
            args,
            timeout: config.timeout,
            prompt_suffix: "\n\nMake every change directly in the working tree; do not describe \
                            changes without applying them."
                .to_string(),
        }
    }

    /// OpenAI Codex CLI in exec mode.
    pub fn codex(config: &AgentConfig) -> Self {
        Self {
            name: "codex".to_string(),
            program: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "--full-auto".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            timeout: config.timeout,
            prompt_suffix: "\n\nApply all edits to the files on disk before finishing.".to_string(),
        }
    }

    /// Resolve a provider label from config.
    pub fn from_provider(provider: &str, config: &AgentConfig) -> Result<Self> {
        match provider {
            "claude" => Ok(Self::claude(config)),
            "codex" => Ok(Self::codex(config)),
            other => bail!("unknown agent provider '{other}'"),
        }
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn prompt_suffix(&self) -> &str {
        &self.prompt_suffix
    }

    async fn run(&self, dir: &Path, prompt: &str, log_path: &Path) -> Result<String> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut log = tokio::fs::File::create(log_path)
            .await
            .with_context(|| format!("failed to create agent log {}", log_path.display()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                name: self.name.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A fast-failing agent can close stdin before the prompt lands;
            // the exit status below carries the real diagnosis.
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take().context("failed to take agent stdout")?;

        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulated = String::new();
            let mut final_result: Option<String> = None;
            let mut is_error = false;

            while let Some(line) = lines.next_line().await? {
                log.write_all(line.as_bytes()).await?;
                log.write_all(b"\n").await?;

                match serde_json::from_str::<StreamEvent>(&line) {
                    Ok(StreamEvent::Result { result, is_error: err }) => {
                        final_result = result;
                        is_error = err;
                    }
                    Ok(StreamEvent::Other) => {}
                    Err(_) => {
                        // Plain-text provider output
                        accumulated.push_str(&line);
                        accumulated.push('\n');
                    }
                }
            }

            let status = child.wait().await?;
            anyhow::Ok((status, final_result, is_error, accumulated))
        };

        let (status, final_result, is_error, accumulated) =
            match tokio::time::timeout(self.timeout, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AgentError::TimedOut {
                        name: self.name.clone(),
                        seconds: self.timeout.as_secs(),
                    }
                    .into());
                }
            };

        let output = final_result.unwrap_or(accumulated);

        if !status.success() {
            return Err(AgentError::NonZeroExit {
                name: self.name.clone(),
                code: status.code().unwrap_or(-1),
                detail: crate::util::tail(&output, 500).to_string(),
            }
            .into());
        }
        if is_error {
            bail!(
                "agent '{}' reported an error: {}",
                self.name,
                crate::util::tail(&output, 500)
            );
        }

        Ok(output)
    }
}

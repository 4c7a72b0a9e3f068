//! Pre-commit hook execution with agent-assisted retries.
//!
//! The hook is a shell command run in the worktree. When it fails and an
//! agent is available, the tail of the hook's output is fed back to the
//! agent as a fix prompt and the hook is re-run, up to a bounded number of
//! attempts.

use crate::agent::Agent;
use crate::util::tail;
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// How much hook output survives into the fix prompt.
const OUTPUT_TAIL_CHARS: usize = 4000;

struct HookOutcome {
    success: bool,
    /// Combined stdout + stderr.
    output: String,
}

async fn execute(hook_cmd: &str, dir: &Path) -> Result<HookOutcome> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(hook_cmd)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run pre-commit hook '{hook_cmd}'"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(HookOutcome {
        success: output.status.success(),
        output: combined,
    })
}

fn fix_prompt(hook_cmd: &str, output: &str) -> String {
    format!(
        "The pre-commit hook for this repository failed. Fix the issues it \
         reports, then stop.\n\nHook command:\n\n    {hook_cmd}\n\nHook \
         output (tail):\n\n{}\n",
        tail(output, OUTPUT_TAIL_CHARS)
    )
}

/// Run the hook; on failure, let the agent attempt fixes up to
/// `max_retries` times. `log_path` receives the agent output of the fix
/// attempts.
pub async fn run_pre_commit(
    hook_cmd: &str,
    dir: &Path,
    agent: Option<&dyn Agent>,
    max_retries: u32,
    log_path: &Path,
) -> Result<()> {
    let mut outcome = execute(hook_cmd, dir).await?;
    if outcome.success {
        return Ok(());
    }

    let Some(agent) = agent else {
        bail!(
            "pre-commit hook failed: {}",
            tail(&outcome.output, OUTPUT_TAIL_CHARS).trim()
        );
    };

    for attempt in 1..=max_retries {
        tracing::warn!(
            attempt,
            max_retries,
            "pre-commit hook failed, asking agent to fix"
        );
        let prompt = format!("{}{}", fix_prompt(hook_cmd, &outcome.output), agent.prompt_suffix());
        agent
            .run(dir, &prompt, log_path)
            .await
            .with_context(|| format!("agent fix attempt {attempt} failed"))?;

        outcome = execute(hook_cmd, dir).await?;
        if outcome.success {
            return Ok(());
        }
    }

    bail!(
        "pre-commit hook failed after {max_retries} retries: {}",
        tail(&outcome.output, OUTPUT_TAIL_CHARS).trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Agent whose "fix" is to run a canned shell command in the dir.
    struct FixerAgent {
        fix_cmd: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Agent for FixerAgent {
        fn name(&self) -> &str {
            "fixer"
        }

        fn prompt_suffix(&self) -> &str {
            ""
        }

        async fn run(&self, dir: &Path, prompt: &str, _log: &Path) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(cmd) = &self.fix_cmd {
                let status = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .current_dir(dir)
                    .status()
                    .unwrap();
                if !status.success() {
                    return Err(anyhow!("fix command failed"));
                }
            }
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn test_passing_hook_needs_no_agent() {
        let dir = tempdir().unwrap();
        run_pre_commit("true", dir.path(), None, 3, &dir.path().join("log"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_hook_without_agent_errors() {
        let dir = tempdir().unwrap();
        let err = run_pre_commit(
            "echo lint broke >&2; false",
            dir.path(),
            None,
            3,
            &dir.path().join("log"),
        )
        .await
        .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("pre-commit hook failed"));
        assert!(msg.contains("lint broke"));
    }

    #[tokio::test]
    async fn test_agent_fix_makes_hook_pass() {
        let dir = tempdir().unwrap();
        // Hook passes once the marker file exists; the agent's fix creates it.
        let agent = FixerAgent {
            fix_cmd: Some("touch fixed.marker".to_string()),
            prompts: Mutex::new(Vec::new()),
        };

        run_pre_commit(
            "test -f fixed.marker",
            dir.path(),
            Some(&agent),
            2,
            &dir.path().join("log"),
        )
        .await
        .unwrap();

        let prompts = agent.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("pre-commit hook"));
        assert!(prompts[0].contains("test -f fixed.marker"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_wraps_error() {
        let dir = tempdir().unwrap();
        let agent = FixerAgent {
            fix_cmd: None,
            prompts: Mutex::new(Vec::new()),
        };

        let err = run_pre_commit(
            "echo still broken; false",
            dir.path(),
            Some(&agent),
            2,
            &dir.path().join("log"),
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("pre-commit hook failed after 2 retries"));
        assert_eq!(agent.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hook_output_is_tail_bounded() {
        let dir = tempdir().unwrap();
        let agent = FixerAgent {
            fix_cmd: None,
            prompts: Mutex::new(Vec::new()),
        };

        // 100k of output, far beyond the 4k tail.
        let _ = run_pre_commit(
            "yes error-line | head -n 20000; false",
            dir.path(),
            Some(&agent),
            1,
            &dir.path().join("log"),
        )
        .await;

        let prompts = agent.prompts.lock().unwrap();
        assert!(prompts[0].len() < 6000);
    }
}

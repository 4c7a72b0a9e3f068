//! Layered configuration read from `.forge/forge.toml`.
//!
//! Every section is optional in the file; absent fields take the defaults
//! below. Validation aggregates all problems into one error so the user
//! fixes everything in a single pass. Config errors never reach the engine:
//! the CLI validates before constructing providers.
//!
//! ```toml
//! [vcs]
//! provider = "github"
//! repo = "acme/widgets"
//! base_branch = "main"
//!
//! [agent]
//! provider = "claude"
//! timeout = "45m"
//!
//! [cr]
//! enabled = true
//! poll_timeout = "5m"
//! poll_interval = "15s"
//! comment_pattern = "Claude finished"
//! fix_strategy = "amend"
//! ```

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Version-control / code-host settings. Required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Code-host provider (currently `github`).
    #[serde(default = "default_vcs_provider")]
    pub provider: String,
    /// `owner/repo` slug.
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_vcs_provider() -> String {
    "github".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            provider: default_vcs_provider(),
            repo: String::new(),
            base_branch: default_base_branch(),
        }
    }
}

/// Agent runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_provider")]
    pub provider: String,
    #[serde(with = "humantime_serde", default = "default_agent_timeout")]
    pub timeout: Duration,
    /// Tool allowlist passed through to the agent CLI.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Agent providers for batch runs; falls back to `[provider]` when empty.
    #[serde(default)]
    pub pool: Vec<String>,
}

fn default_agent_provider() -> String {
    "claude".to_string()
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_agent_provider(),
            timeout: default_agent_timeout(),
            allowed_tools: Vec::new(),
            pool: Vec::new(),
        }
    }
}

/// Worktree manager settings. Empty commands select the built-in
/// `git worktree` implementation; non-empty commands are shell templates
/// with `{{.Branch}}`, `{{.BaseBranch}}` and `{{.Path}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    #[serde(default)]
    pub create_cmd: String,
    #[serde(default)]
    pub remove_cmd: String,
    /// Remove the worktree when a run completes successfully.
    #[serde(default = "default_true")]
    pub cleanup: bool,
    /// Let the reaper remove worktrees of merged PRs.
    #[serde(default = "default_true")]
    pub cleanup_on_merge: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            create_cmd: String::new(),
            remove_cmd: String::new(),
            cleanup: true,
            cleanup_on_merge: true,
        }
    }
}

/// Issue tracker settings. Enabled iff `provider` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub board_id: String,
}

impl TrackerConfig {
    pub fn enabled(&self) -> bool {
        !self.provider.is_empty()
    }
}

/// Chat notifier settings. Enabled iff `provider` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub webhook_url: String,
}

impl NotifierConfig {
    pub fn enabled(&self) -> bool {
        !self.provider.is_empty()
    }
}

/// Run-state retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Completed runs older than this are swept by `cleanup`.
    #[serde(with = "humantime_serde", default = "default_retention")]
    pub retention: Duration,
}

fn default_retention() -> Duration {
    Duration::from_secs(168 * 3600)
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// How the CR fix lands on the PR branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FixStrategy {
    /// Amend the last commit and force-push with a lease.
    #[default]
    #[serde(rename = "amend")]
    Amend,
    /// Add a new commit and push normally.
    #[serde(rename = "new-commit")]
    NewCommit,
}

impl std::fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixStrategy::Amend => write!(f, "amend"),
            FixStrategy::NewCommit => write!(f, "new-commit"),
        }
    }
}

/// Code-review feedback loop settings (steps 7-9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Regex a PR comment must match to count as review feedback.
    /// Required when `enabled`.
    #[serde(default)]
    pub comment_pattern: String,
    #[serde(default)]
    pub fix_strategy: FixStrategy,
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

impl Default for CrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_timeout: default_poll_timeout(),
            poll_interval: default_poll_interval(),
            comment_pattern: String::new(),
            fix_strategy: FixStrategy::default(),
        }
    }
}

/// Shell hooks run around pipeline steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Shell command run before `commit and push`; failures are fed back to
    /// the agent for a bounded number of fix attempts.
    #[serde(default)]
    pub pre_commit: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub cr: CrConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl Config {
    /// Default config file location relative to the repo root.
    pub const DEFAULT_PATH: &str = ".forge/forge.toml";

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the filesystem. Used by tests.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant and report all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.vcs.provider.is_empty() {
            errors.push("vcs.provider is required".to_string());
        }
        if self.vcs.repo.is_empty() {
            errors.push("vcs.repo is required".to_string());
        }
        if self.vcs.base_branch.is_empty() {
            errors.push("vcs.base_branch is required".to_string());
        }

        if self.cr.enabled {
            if self.cr.comment_pattern.is_empty() {
                errors.push("cr.comment_pattern is required when cr.enabled".to_string());
            } else if let Err(err) = regex::Regex::new(&self.cr.comment_pattern) {
                errors.push(format!("cr.comment_pattern is not a valid regex: {err}"));
            }
        }

        if self.notifier.enabled() && self.notifier.webhook_url.is_empty() {
            errors.push("notifier.webhook_url is required when notifier.provider is set".to_string());
        }

        if self.tracker.enabled() {
            if self.tracker.project.is_empty() {
                errors.push("tracker.project is required when tracker.provider is set".to_string());
            }
            if self.tracker.base_url.is_empty() {
                errors.push("tracker.base_url is required when tracker.provider is set".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Agent providers for the batch pool, in assignment order.
    pub fn agent_pool_providers(&self) -> Vec<String> {
        if self.agent.pool.is_empty() {
            vec![self.agent.provider.clone()]
        } else {
            self.agent.pool.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
[vcs]
repo = "acme/widgets"
"#
    }

    #[test]
    fn test_minimal_config_takes_defaults() {
        let config = Config::from_toml(minimal()).unwrap();
        assert_eq!(config.vcs.provider, "github");
        assert_eq!(config.vcs.base_branch, "main");
        assert_eq!(config.agent.provider, "claude");
        assert_eq!(config.agent.timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.state.retention, Duration::from_secs(168 * 3600));
        assert!(!config.cr.enabled);
        assert_eq!(config.cr.poll_interval, Duration::from_secs(15));
        assert_eq!(config.cr.fix_strategy, FixStrategy::Amend);
        assert!(config.worktree.cleanup);
        assert!(!config.tracker.enabled());
        assert!(!config.notifier.enabled());
    }

    #[test]
    fn test_durations_parse_human_readable() {
        let config = Config::from_toml(
            r#"
[vcs]
repo = "acme/widgets"

[agent]
timeout = "10m"

[cr]
enabled = true
poll_timeout = "90s"
poll_interval = "1s"
comment_pattern = "finished"

[state]
retention = "24h"
"#,
        )
        .unwrap();
        assert_eq!(config.agent.timeout, Duration::from_secs(600));
        assert_eq!(config.cr.poll_timeout, Duration::from_secs(90));
        assert_eq!(config.state.retention, Duration::from_secs(86400));
    }

    #[test]
    fn test_missing_repo_is_invalid() {
        let err = Config::from_toml("").unwrap_err();
        assert!(err.to_string().contains("vcs.repo is required"));
    }

    #[test]
    fn test_validation_aggregates_all_errors() {
        let err = Config::from_toml(
            r#"
[cr]
enabled = true

[notifier]
provider = "slack"
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vcs.repo is required"));
        assert!(msg.contains("cr.comment_pattern is required"));
        assert!(msg.contains("notifier.webhook_url is required"));
    }

    #[test]
    fn test_invalid_comment_pattern_rejected() {
        let err = Config::from_toml(
            r#"
[vcs]
repo = "acme/widgets"

[cr]
enabled = true
comment_pattern = "(["
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a valid regex"));
    }

    #[test]
    fn test_invalid_fix_strategy_rejected() {
        let err = Config::from_toml(
            r#"
[vcs]
repo = "acme/widgets"

[cr]
fix_strategy = "rebase"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn test_fix_strategy_new_commit_parses() {
        let config = Config::from_toml(
            r#"
[vcs]
repo = "acme/widgets"

[cr]
fix_strategy = "new-commit"
"#,
        )
        .unwrap();
        assert_eq!(config.cr.fix_strategy, FixStrategy::NewCommit);
    }

    #[test]
    fn test_agent_pool_defaults_to_primary() {
        let config = Config::from_toml(minimal()).unwrap();
        assert_eq!(config.agent_pool_providers(), vec!["claude".to_string()]);

        let config = Config::from_toml(
            r#"
[vcs]
repo = "acme/widgets"

[agent]
pool = ["claude", "codex"]
"#,
        )
        .unwrap();
        assert_eq!(config.agent_pool_providers(), vec!["claude", "codex"]);
    }
}

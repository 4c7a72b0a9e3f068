//! Provider capabilities the pipeline core consumes.
//!
//! Every external collaborator is a capability set behind a trait: the code
//! host, the optional issue tracker, the optional chat notifier and the
//! worktree manager. The engine only ever sees these traits; concrete
//! implementations are selected once from config by [`from_config`].

pub mod github;
pub mod jira;
pub mod slack;
pub mod worktree;

use crate::config::Config;
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A created pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub url: String,
    pub number: u64,
}

/// A PR comment, in the host's natural (creation) order.
#[derive(Debug, Clone, Deserialize)]
pub struct PrComment {
    pub id: u64,
    pub author: String,
    pub body: String,
}

/// An issue as the code host reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
}

/// An issue created in the external tracker.
#[derive(Debug, Clone)]
pub struct TrackedIssue {
    pub key: String,
    pub url: String,
}

/// Code-host operations: git plumbing plus the PR/issue API.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Whether the working tree at `dir` has uncommitted changes
    /// (untracked files included).
    fn has_changes(&self, dir: &Path) -> Result<bool>;

    /// Name of the branch currently checked out at `dir`.
    fn current_branch(&self, dir: &Path) -> Result<String>;

    async fn commit_and_push(&self, dir: &Path, branch: &str, message: &str) -> Result<()>;

    async fn push(&self, dir: &Path, branch: &str) -> Result<()>;

    /// Amend the last commit (keeping its message when `message` is `None`)
    /// and force-push with a lease.
    async fn amend_and_force_push(
        &self,
        dir: &Path,
        branch: &str,
        message: Option<&str>,
    ) -> Result<()>;

    async fn fetch_and_rebase(&self, dir: &Path, base_branch: &str) -> Result<()>;

    async fn create_pr(
        &self,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    async fn pr_comments(&self, number: u64) -> Result<Vec<PrComment>>;

    async fn post_pr_comment(&self, number: u64, body: &str) -> Result<()>;

    /// Upper-case PR state as the host reports it (`OPEN`, `MERGED`, ...).
    async fn pr_state(&self, number: u64) -> Result<String>;

    async fn get_issue(&self, number: u64) -> Result<Issue>;

    async fn list_issues(&self, state: &str, label: &str) -> Result<Vec<Issue>>;
}

/// External issue tracker (e.g. Jira). Optional.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, title: &str, body: &str) -> Result<TrackedIssue>;
}

/// Chat notifier (e.g. Slack webhook). Optional.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Isolated-working-copy lifecycle.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Create a worktree bound to `branch`, branched from `base_branch`.
    /// Returns its path.
    async fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf>;

    async fn remove(&self, path: &Path) -> Result<()>;
}

/// The provider bundle handed to the pipeline and batch executors.
#[derive(Clone)]
pub struct Providers {
    pub host: Arc<dyn CodeHost>,
    pub tracker: Option<Arc<dyn IssueTracker>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub worktree: Arc<dyn WorktreeManager>,
}

/// Construct the configured providers for a repo rooted at `repo_root`.
pub fn from_config(config: &Config, repo_root: &Path) -> Result<Providers> {
    let host: Arc<dyn CodeHost> = match config.vcs.provider.as_str() {
        "github" => Arc::new(github::GithubHost::new(&config.vcs.repo)),
        other => bail!("unknown vcs provider '{other}'"),
    };

    let tracker: Option<Arc<dyn IssueTracker>> = if config.tracker.enabled() {
        match config.tracker.provider.as_str() {
            "jira" => Some(Arc::new(jira::JiraTracker::new(&config.tracker)?)),
            other => bail!("unknown tracker provider '{other}'"),
        }
    } else {
        None
    };

    let notifier: Option<Arc<dyn Notifier>> = if config.notifier.enabled() {
        match config.notifier.provider.as_str() {
            "slack" => Some(Arc::new(slack::SlackNotifier::new(
                &config.notifier.webhook_url,
            ))),
            other => bail!("unknown notifier provider '{other}'"),
        }
    } else {
        None
    };

    let worktree: Arc<dyn WorktreeManager> = if config.worktree.create_cmd.is_empty() {
        Arc::new(worktree::GitWorktree::new(repo_root))
    } else {
        Arc::new(worktree::CommandWorktree::new(
            repo_root,
            &config.worktree.create_cmd,
            &config.worktree.remove_cmd,
        ))
    };

    Ok(Providers {
        host,
        tracker,
        notifier,
        worktree,
    })
}

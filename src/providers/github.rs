//! GitHub code host: `git` for repository plumbing, `gh` for the PR and
//! issue API. All network operations shell out; local change detection uses
//! libgit2 so it works without spawning a process.

use super::{CodeHost, Issue, PrComment, PullRequest};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

pub struct GithubHost {
    /// `owner/repo` slug, passed to every `gh` invocation so host calls do
    /// not depend on the working directory.
    repo: String,
}

impl GithubHost {
    pub fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        run_command("git", args, Some(dir)).await
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let mut full: Vec<&str> = args.to_vec();
        full.push("--repo");
        full.push(self.repo.as_str());
        run_command("gh", &full, None).await
    }
}

async fn run_command(program: &str, args: &[&str], dir: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Deserialize)]
struct GhComment {
    id: u64,
    #[serde(default)]
    body: String,
    user: GhUser,
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    url: String,
}

impl From<GhIssue> for Issue {
    fn from(issue: GhIssue) -> Self {
        Issue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            url: issue.url,
        }
    }
}

#[derive(Deserialize)]
struct GhPrState {
    state: String,
}

#[async_trait]
impl CodeHost for GithubHost {
    fn has_changes(&self, dir: &Path) -> Result<bool> {
        let repo = git2::Repository::open(dir)
            .with_context(|| format!("failed to open git repository at {}", dir.display()))?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("failed to read git status")?;
        Ok(!statuses.is_empty())
    }

    fn current_branch(&self, dir: &Path) -> Result<String> {
        let repo = git2::Repository::open(dir)
            .with_context(|| format!("failed to open git repository at {}", dir.display()))?;
        let head = repo.head().context("failed to resolve HEAD")?;
        head.shorthand()
            .map(str::to_string)
            .context("HEAD is not a branch")
    }

    async fn commit_and_push(&self, dir: &Path, branch: &str, message: &str) -> Result<()> {
        self.git(dir, &["add", "-A"]).await?;
        self.git(dir, &["commit", "-m", message]).await?;
        self.git(dir, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn push(&self, dir: &Path, branch: &str) -> Result<()> {
        self.git(dir, &["push", "origin", branch]).await?;
        Ok(())
    }

    async fn amend_and_force_push(
        &self,
        dir: &Path,
        branch: &str,
        message: Option<&str>,
    ) -> Result<()> {
        self.git(dir, &["add", "-A"]).await?;
        match message {
            Some(msg) => self.git(dir, &["commit", "--amend", "-m", msg]).await?,
            None => self.git(dir, &["commit", "--amend", "--no-edit"]).await?,
        };
        self.git(dir, &["push", "--force-with-lease", "origin", branch])
            .await?;
        Ok(())
    }

    async fn fetch_and_rebase(&self, dir: &Path, base_branch: &str) -> Result<()> {
        self.git(dir, &["fetch", "origin", base_branch]).await?;
        self.git(dir, &["rebase", &format!("origin/{base_branch}")])
            .await?;
        Ok(())
    }

    async fn create_pr(
        &self,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let stdout = self
            .gh(&[
                "pr",
                "create",
                "--head",
                branch,
                "--base",
                base_branch,
                "--title",
                title,
                "--body",
                body,
            ])
            .await?;
        // gh prints the PR URL as the last line of stdout.
        let url = stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .context("gh pr create printed no PR URL")?
            .trim()
            .to_string();
        let number = parse_pr_number(&url)
            .with_context(|| format!("could not parse PR number from URL '{url}'"))?;
        Ok(PullRequest { url, number })
    }

    async fn pr_comments(&self, number: u64) -> Result<Vec<PrComment>> {
        let path = format!("repos/{}/issues/{}/comments", self.repo, number);
        let stdout = run_command("gh", &["api", &path], None).await?;
        let comments: Vec<GhComment> =
            serde_json::from_str(&stdout).context("failed to decode PR comments")?;
        Ok(comments
            .into_iter()
            .map(|c| PrComment {
                id: c.id,
                author: c.user.login,
                body: c.body,
            })
            .collect())
    }

    async fn post_pr_comment(&self, number: u64, body: &str) -> Result<()> {
        self.gh(&["pr", "comment", &number.to_string(), "--body", body])
            .await?;
        Ok(())
    }

    async fn pr_state(&self, number: u64) -> Result<String> {
        let stdout = self
            .gh(&["pr", "view", &number.to_string(), "--json", "state"])
            .await?;
        let state: GhPrState =
            serde_json::from_str(&stdout).context("failed to decode PR state")?;
        Ok(state.state)
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        let stdout = self
            .gh(&[
                "issue",
                "view",
                &number.to_string(),
                "--json",
                "number,title,body,url",
            ])
            .await?;
        let issue: GhIssue = serde_json::from_str(&stdout).context("failed to decode issue")?;
        Ok(issue.into())
    }

    async fn list_issues(&self, state: &str, label: &str) -> Result<Vec<Issue>> {
        let mut args = vec![
            "issue",
            "list",
            "--state",
            state,
            "--json",
            "number,title,body,url",
            "--limit",
            "500",
        ];
        if !label.is_empty() {
            args.push("--label");
            args.push(label);
        }
        let stdout = self.gh(&args).await?;
        let issues: Vec<GhIssue> =
            serde_json::from_str(&stdout).context("failed to decode issue list")?;
        Ok(issues.into_iter().map(Issue::from).collect())
    }
}

/// PR number from a GitHub PR URL (`.../pull/123`).
fn parse_pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pr_number() {
        assert_eq!(
            parse_pr_number("https://github.com/acme/widgets/pull/123"),
            Some(123)
        );
        assert_eq!(parse_pr_number("https://github.com/acme/widgets"), None);
    }

    #[test]
    fn test_gh_issue_null_body_decodes_empty() {
        let issue: GhIssue =
            serde_json::from_str(r#"{"number": 4, "title": "T", "body": null, "url": "u"}"#)
                .unwrap();
        let issue: Issue = issue.into();
        assert_eq!(issue.body, "");
    }
}

//! Worktree managers.
//!
//! `GitWorktree` is the built-in implementation over `git worktree`.
//! `CommandWorktree` runs operator-supplied shell templates, substituting
//! `{{.Branch}}`, `{{.BaseBranch}}` and `{{.Path}}`.

use super::WorktreeManager;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Where worktrees live relative to the repo root.
const WORKTREES_SUBDIR: &str = ".forge/worktrees";

fn worktree_path(repo_root: &Path, branch: &str) -> PathBuf {
    repo_root
        .join(WORKTREES_SUBDIR)
        .join(branch.replace('/', "-"))
}

async fn run_shell(script: &str, dir: &Path) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run '{script}'"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("'{script}' failed: {}", stderr.trim());
    }
    Ok(())
}

/// Built-in manager shelling out to `git worktree`.
pub struct GitWorktree {
    repo_root: PathBuf,
}

impl GitWorktree {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }
}

#[async_trait]
impl WorktreeManager for GitWorktree {
    async fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf> {
        let path = worktree_path(&self.repo_root, branch);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                branch,
                path.to_string_lossy().as_ref(),
                base_branch,
            ])
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run git worktree add")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree add failed: {}", stderr.trim());
        }
        Ok(path)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let output = Command::new("git")
            .args([
                "worktree",
                "remove",
                "--force",
                path.to_string_lossy().as_ref(),
            ])
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run git worktree remove")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree remove failed: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Manager running operator-supplied shell templates.
pub struct CommandWorktree {
    repo_root: PathBuf,
    create_cmd: String,
    remove_cmd: String,
}

impl CommandWorktree {
    pub fn new(repo_root: &Path, create_cmd: &str, remove_cmd: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            create_cmd: create_cmd.to_string(),
            remove_cmd: remove_cmd.to_string(),
        }
    }
}

/// Substitute the worktree template placeholders.
pub fn render_template(template: &str, branch: &str, base_branch: &str, path: &str) -> String {
    template
        .replace("{{.Branch}}", branch)
        .replace("{{.BaseBranch}}", base_branch)
        .replace("{{.Path}}", path)
}

#[async_trait]
impl WorktreeManager for CommandWorktree {
    async fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf> {
        let path = worktree_path(&self.repo_root, branch);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let script = render_template(
            &self.create_cmd,
            branch,
            base_branch,
            path.to_string_lossy().as_ref(),
        );
        run_shell(&script, &self.repo_root).await?;
        Ok(path)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        if self.remove_cmd.is_empty() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            return Ok(());
        }
        let script = render_template(&self.remove_cmd, "", "", path.to_string_lossy().as_ref());
        run_shell(&script, &self.repo_root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_substitutes_all_placeholders() {
        let rendered = render_template(
            "wt create {{.Branch}} --from {{.BaseBranch}} --at {{.Path}}",
            "forge/auth",
            "main",
            "/tmp/wt/forge-auth",
        );
        assert_eq!(
            rendered,
            "wt create forge/auth --from main --at /tmp/wt/forge-auth"
        );
    }

    #[test]
    fn test_worktree_path_flattens_branch_separators() {
        let path = worktree_path(Path::new("/repo"), "forge/add-auth");
        assert_eq!(path, Path::new("/repo/.forge/worktrees/forge-add-auth"));
    }

    #[tokio::test]
    async fn test_command_worktree_runs_template() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("created.txt");
        let create_cmd = format!("echo {{{{.Branch}}}} > {}", marker.display());
        let manager = CommandWorktree::new(dir.path(), &create_cmd, "");

        let path = manager.create("forge/x", "main").await.unwrap();
        assert!(path.ends_with(".forge/worktrees/forge-x"));
        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content.trim(), "forge/x");
    }
}

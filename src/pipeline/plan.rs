//! Plan documents: markdown with optional YAML frontmatter.
//!
//! Only the `title:` key of the frontmatter is consumed; a missing or
//! malformed block falls back to a title derived from the file name. Plan
//! text is never persisted in the ledger; resume re-reads it from disk.

use crate::util::title_from_stem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An in-memory plan: the prompt material for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDoc {
    pub title: String,
    /// Plan text with the frontmatter block stripped.
    pub body: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    title: Option<String>,
}

/// Read a plan file, resolving the title from frontmatter or file name.
pub fn load(path: &Path) -> Result<PlanDoc> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan at {}", path.display()))?;

    let (frontmatter, body) = split_frontmatter(&raw);
    let title = frontmatter
        .and_then(|block| serde_yaml::from_str::<Frontmatter>(block).ok())
        .and_then(|fm| fm.title)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("plan");
            title_from_stem(stem)
        });

    Ok(PlanDoc {
        title,
        body: body.to_string(),
    })
}

/// Write a temp plan for an issue-sourced run: `title:` frontmatter plus the
/// issue body.
pub fn write_issue_plan(path: &Path, title: &str, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let frontmatter = serde_yaml::to_string(&Frontmatter {
        title: Some(title.to_string()),
    })
    .context("failed to serialize plan frontmatter")?;
    let content = format!("---\n{frontmatter}---\n\n{body}\n");
    std::fs::write(path, content)
        .with_context(|| format!("failed to write plan at {}", path.display()))
}

/// Split a leading `---` fenced frontmatter block from the body.
fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return (None, raw);
    };
    for fence in ["\n---\n", "\n---\r\n"] {
        if let Some(end) = rest.find(fence) {
            let body = &rest[end + fence.len()..];
            return (Some(&rest[..end]), body.trim_start_matches('\n'));
        }
    }
    // Unterminated fence: treat the whole file as body.
    (None, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_plan(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_plain_plan_titles_from_filename() {
        let dir = tempdir().unwrap();
        let path = write_plan(dir.path(), "auth.md", "implement auth");

        let plan = load(&path).unwrap();
        assert_eq!(plan.title, "Auth");
        assert_eq!(plan.body, "implement auth");
    }

    #[test]
    fn test_load_frontmatter_title_wins() {
        let dir = tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            "x.md",
            "---\ntitle: Deploy Server\n---\n\nroll out the new server",
        );

        let plan = load(&path).unwrap();
        assert_eq!(plan.title, "Deploy Server");
        assert_eq!(plan.body, "roll out the new server");
    }

    #[test]
    fn test_load_malformed_frontmatter_falls_back() {
        let dir = tempdir().unwrap();
        let path = write_plan(dir.path(), "deploy-server.md", "---\n{{bad\n---\nbody");

        let plan = load(&path).unwrap();
        assert_eq!(plan.title, "Deploy Server");
        assert_eq!(plan.body, "body");
    }

    #[test]
    fn test_load_unterminated_fence_is_body() {
        let dir = tempdir().unwrap();
        let path = write_plan(dir.path(), "x.md", "--- not frontmatter\nbody");

        let plan = load(&path).unwrap();
        assert_eq!(plan.body, "--- not frontmatter\nbody");
    }

    #[test]
    fn test_issue_plan_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run-plan.md");

        write_issue_plan(&path, "Add metrics: phase 2", "Depends on #1\n\ndetails").unwrap();
        let plan = load(&path).unwrap();
        assert_eq!(plan.title, "Add metrics: phase 2");
        assert!(plan.body.contains("Depends on #1"));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("absent.md")).is_err());
    }
}

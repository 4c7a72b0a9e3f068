//! Process-wide path handles and the cross-repo registry.
//!
//! Exactly two pieces of global mutable state exist in the engine: the runs
//! directory and the registry file path. Both are set once at startup; the
//! setters exist for tests and for tools that aggregate several repos.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static RUNS_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);
static REGISTRY_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Directory holding run ledgers, temp plans and agent step logs.
/// Defaults to `.forge/runs` relative to the working directory.
pub fn runs_dir() -> PathBuf {
    RUNS_DIR
        .read()
        .expect("runs dir lock poisoned")
        .clone()
        .unwrap_or_else(|| PathBuf::from(".forge/runs"))
}

/// Override the runs directory for this process.
pub fn set_runs_dir(path: impl Into<PathBuf>) {
    *RUNS_DIR.write().expect("runs dir lock poisoned") = Some(path.into());
}

/// Path of the registry file listing repos that have produced runs.
/// Defaults to `~/.forge/registry.yaml`.
pub fn registry_path() -> PathBuf {
    REGISTRY_PATH
        .read()
        .expect("registry path lock poisoned")
        .clone()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".forge")
                .join("registry.yaml")
        })
}

/// Override the registry file path for this process.
pub fn set_registry_path(path: impl Into<PathBuf>) {
    *REGISTRY_PATH.write().expect("registry path lock poisoned") = Some(path.into());
}

/// Repos known to the registry. Missing or unreadable registry reads as empty.
pub fn registered_repos() -> Vec<PathBuf> {
    let path = registry_path();
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    serde_yaml::from_str(&content).unwrap_or_default()
}

/// Record a repo root in the registry, deduplicated. Best-effort callers
/// ignore the error; the write itself is atomic (tmp + rename).
pub fn register_repo(root: &Path) -> Result<()> {
    let root = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    let mut repos = registered_repos();
    if repos.contains(&root) {
        return Ok(());
    }
    repos.push(root);

    let path = registry_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create registry dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("yaml.tmp");
    let content = serde_yaml::to_string(&repos).context("failed to serialize registry")?;
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write registry temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to replace registry at {}", path.display()))?;
    Ok(())
}

/// Serializes unit tests that touch the process-wide path handles. Every
/// test module that calls `set_runs_dir` or `set_registry_path` must hold
/// this lock for its whole body.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

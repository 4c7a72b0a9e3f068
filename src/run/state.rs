//! Durable per-run ledger.
//!
//! One `RunState` file per run under the runs directory. Every step
//! transition is persisted before execution continues, so a crash at any
//! point leaves a valid, re-loadable record. Saves are atomic (write to
//! `<id>.yaml.tmp`, rename over the target): a concurrent reader sees the
//! prior or the next version, never a torn write.

use crate::run::registry::runs_dir;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Canonical step names, in execution order. The indices are the wire
/// contract for `resume --from`.
pub const STEP_NAMES: [&str; 11] = [
    "read plan",
    "create issue",
    "generate branch",
    "create worktree",
    "run agent",
    "commit and push",
    "create pr",
    "poll cr",
    "fix cr",
    "push cr fix",
    "notify",
];

pub const READ_PLAN: usize = 0;
pub const CREATE_ISSUE: usize = 1;
pub const GENERATE_BRANCH: usize = 2;
pub const CREATE_WORKTREE: usize = 3;
pub const RUN_AGENT: usize = 4;
pub const COMMIT_AND_PUSH: usize = 5;
pub const CREATE_PR: usize = 6;
pub const POLL_CR: usize = 7;
pub const FIX_CR: usize = 8;
pub const PUSH_CR_FIX: usize = 9;
pub const NOTIFY: usize = 10;

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

/// One entry in the step ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    /// Empty unless the step failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// The durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    /// Empty in push mode.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_path: String,
    /// `""` for plan mode, `"push"` for push mode.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default)]
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Artifacts accumulated by steps. Once set by their owning step they are
    // only overwritten by an explicit re-execution of that step.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worktree_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pr_url: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pr_number: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cr_feedback: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cr_fix_summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_title: String,
    /// Originating issue number when the plan was fetched from the host.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub source_issue: u64,

    /// Always exactly 11 entries, mirroring `STEP_NAMES`.
    pub steps: Vec<StepState>,
}

impl RunState {
    /// Build a fresh plan-mode run with all steps pending.
    pub fn new(id: impl Into<String>, plan_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan_path: plan_path.into(),
            mode: String::new(),
            status: RunStatus::Active,
            created_at: now,
            updated_at: now,
            branch: String::new(),
            worktree_path: String::new(),
            pr_url: String::new(),
            pr_number: 0,
            issue_key: String::new(),
            issue_url: String::new(),
            cr_feedback: String::new(),
            cr_fix_summary: String::new(),
            plan_title: String::new(),
            source_issue: 0,
            steps: STEP_NAMES
                .iter()
                .map(|name| StepState {
                    name: (*name).to_string(),
                    status: StepStatus::Pending,
                    error: String::new(),
                })
                .collect(),
        }
    }

    /// Build a push-mode run: no plan file, `mode = "push"`.
    pub fn new_push(id: impl Into<String>) -> Self {
        let mut rs = Self::new(id, "");
        rs.mode = "push".to_string();
        rs
    }

    pub fn is_push_mode(&self) -> bool {
        self.mode == "push"
    }

    /// Ledger file for this run.
    pub fn path(&self) -> PathBuf {
        ledger_path(&self.id)
    }

    /// Atomically persist this run, refreshing `updated_at`. Creates the
    /// runs directory if absent.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = Utc::now();
        let dir = runs_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create runs dir {}", dir.display()))?;

        let target = self.path();
        let tmp = dir.join(format!("{}.yaml.tmp", self.id));
        let content = serde_yaml::to_string(self).context("failed to serialize run state")?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("failed to replace {}", target.display()))?;
        Ok(())
    }

    /// Load a run by id from the runs directory.
    pub fn load(id: &str) -> Result<Self> {
        Self::load_file(&ledger_path(id))
    }

    /// Load a run from an arbitrary path.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("run not found at {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to decode run state at {}", path.display()))
    }

    /// All runs in the runs directory, newest first. Unreadable or
    /// undecodable files are skipped, never fatal.
    pub fn list() -> Vec<Self> {
        let dir = runs_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut runs: Vec<Self> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "yaml"))
            .filter_map(|e| match Self::load_file(&e.path()) {
                Ok(rs) => Some(rs),
                Err(err) => {
                    tracing::debug!(path = %e.path().display(), error = %err, "skipping unreadable run file");
                    None
                }
            })
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Delete completed runs whose `updated_at` is older than `retention`,
    /// together with their sibling artifacts (temp plan, agent step logs).
    /// Best-effort; returns the number of deleted runs.
    pub fn cleanup(retention: std::time::Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut removed = 0;

        for rs in Self::list() {
            if rs.status != RunStatus::Completed || rs.updated_at >= cutoff {
                continue;
            }
            if std::fs::remove_file(rs.path()).is_ok() {
                removed += 1;
            }
            let _ = std::fs::remove_file(plan_path_for(&rs.id));
            for step in 0..STEP_NAMES.len() {
                let _ = std::fs::remove_file(agent_log_path(&rs.id, step));
            }
        }
        removed
    }

    /// Resolve a step name to its index. Case-insensitive; accepts hyphens
    /// in place of spaces (`poll-cr` and `Poll CR` both resolve).
    pub fn step_index(name: &str) -> Option<usize> {
        let normalized = name.trim().to_lowercase().replace('-', " ");
        STEP_NAMES.iter().position(|n| *n == normalized)
    }

    /// Force steps `[0, idx)` to completed and `[idx, ..)` back to pending,
    /// clearing errors; the run becomes active again. Used by
    /// `resume --from`.
    pub fn reset_from(&mut self, idx: usize) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.status = if i < idx {
                StepStatus::Completed
            } else {
                StepStatus::Pending
            };
            step.error.clear();
        }
        self.status = RunStatus::Active;
    }

    /// Recompute run status from the step ledger: any failed step fails the
    /// run, all-completed completes it, anything else is active.
    pub fn refresh_status(&mut self) {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            self.status = RunStatus::Failed;
        } else if self.steps.iter().all(|s| s.status == StepStatus::Completed) {
            self.status = RunStatus::Completed;
        } else {
            self.status = RunStatus::Active;
        }
    }

    /// Index of the first step that has not completed, if any.
    pub fn current_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
    }
}

/// `<runsDir>/<id>.yaml`
pub fn ledger_path(id: &str) -> PathBuf {
    runs_dir().join(format!("{id}.yaml"))
}

/// `<runsDir>/<id>-plan.md`, the temp plan for issue-sourced runs.
pub fn plan_path_for(id: &str) -> PathBuf {
    runs_dir().join(format!("{id}-plan.md"))
}

/// `<runsDir>/<id>-agent-step<N>.log`, the streamed agent output per step.
pub fn agent_log_path(id: &str, step: usize) -> PathBuf {
    runs_dir().join(format!("{id}-agent-step{step}.log"))
}

/// Mint a run id: `<UTC YYYYMMDD-HHMMSS>-<slug>`.
pub fn new_run_id(slug: &str) -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::registry::{set_runs_dir, test_guard};
    use tempfile::tempdir;

    #[test]
    fn test_new_run_has_canonical_steps() {
        let rs = RunState::new("20260101-000000-auth", "plans/auth.md");
        assert_eq!(rs.steps.len(), 11);
        for (i, step) in rs.steps.iter().enumerate() {
            assert_eq!(step.name, STEP_NAMES[i]);
            assert_eq!(step.status, StepStatus::Pending);
            assert!(step.error.is_empty());
        }
        assert_eq!(rs.status, RunStatus::Active);
        assert_eq!(rs.created_at, rs.updated_at);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-auth", "plans/auth.md");
        rs.branch = "forge/auth".to_string();
        rs.pr_number = 7;
        rs.steps[0].status = StepStatus::Completed;
        rs.save().unwrap();

        let loaded = RunState::load(&rs.id).unwrap();
        assert_eq!(loaded, rs);

        // The temp file must not survive a successful save.
        assert!(!dir.path().join("20260101-000000-auth.yaml.tmp").exists());
    }

    #[test]
    fn test_save_refreshes_updated_at() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        let created = rs.created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        rs.save().unwrap();
        assert!(rs.updated_at >= created);
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-good", "good.md");
        rs.save().unwrap();
        std::fs::write(dir.path().join("garbage.yaml"), "{{{not yaml").unwrap();

        let runs = RunState::list();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, "20260101-000000-good");
    }

    #[test]
    fn test_list_sorted_newest_first() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut old = RunState::new("20260101-000000-old", "old.md");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        old.save().unwrap();
        let mut new = RunState::new("20260101-000001-new", "new.md");
        new.save().unwrap();

        let runs = RunState::list();
        assert_eq!(runs[0].id, "20260101-000001-new");
        assert_eq!(runs[1].id, "20260101-000000-old");
    }

    #[test]
    fn test_cleanup_removes_only_old_completed() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let week = std::time::Duration::from_secs(7 * 24 * 3600);

        let mut stale = RunState::new("20260101-000000-stale", "s.md");
        stale.status = RunStatus::Completed;
        stale.save().unwrap();
        // Age it past the retention window after save refreshed the stamp.
        stale.updated_at = Utc::now() - chrono::Duration::days(8);
        let content = serde_yaml::to_string(&stale).unwrap();
        std::fs::write(stale.path(), content).unwrap();
        std::fs::write(plan_path_for(&stale.id), "body").unwrap();
        std::fs::write(agent_log_path(&stale.id, 4), "log").unwrap();

        let mut fresh = RunState::new("20260101-000001-fresh", "f.md");
        fresh.status = RunStatus::Completed;
        fresh.save().unwrap();

        let mut failed = RunState::new("20260101-000002-failed", "x.md");
        failed.status = RunStatus::Failed;
        failed.save().unwrap();
        failed.updated_at = Utc::now() - chrono::Duration::days(30);
        let content = serde_yaml::to_string(&failed).unwrap();
        std::fs::write(failed.path(), content).unwrap();

        let removed = RunState::cleanup(week);
        assert_eq!(removed, 1);
        assert!(!stale.path().exists());
        assert!(!plan_path_for(&stale.id).exists());
        assert!(!agent_log_path(&stale.id, 4).exists());
        assert!(fresh.path().exists());
        assert!(failed.path().exists());
    }

    #[test]
    fn test_step_index_accepts_hyphens_and_case() {
        assert_eq!(RunState::step_index("poll cr"), Some(POLL_CR));
        assert_eq!(RunState::step_index("poll-cr"), Some(POLL_CR));
        assert_eq!(RunState::step_index("Poll CR"), Some(POLL_CR));
        assert_eq!(RunState::step_index("COMMIT-AND-PUSH"), Some(COMMIT_AND_PUSH));
        assert_eq!(RunState::step_index("nonsense"), None);
    }

    #[test]
    fn test_reset_from() {
        let mut rs = RunState::new("20260101-000000-x", "x.md");
        for step in &mut rs.steps {
            step.status = StepStatus::Completed;
        }
        rs.steps[6].status = StepStatus::Failed;
        rs.steps[6].error = "boom".to_string();
        rs.status = RunStatus::Failed;

        rs.reset_from(4);

        for (i, step) in rs.steps.iter().enumerate() {
            if i < 4 {
                assert_eq!(step.status, StepStatus::Completed, "step {i}");
            } else {
                assert_eq!(step.status, StepStatus::Pending, "step {i}");
            }
            assert!(step.error.is_empty());
        }
        assert_eq!(rs.status, RunStatus::Active);
    }

    #[test]
    fn test_refresh_status() {
        let mut rs = RunState::new("20260101-000000-x", "x.md");
        rs.refresh_status();
        assert_eq!(rs.status, RunStatus::Active);

        for step in &mut rs.steps {
            step.status = StepStatus::Completed;
        }
        rs.refresh_status();
        assert_eq!(rs.status, RunStatus::Completed);

        rs.steps[5].status = StepStatus::Failed;
        rs.refresh_status();
        assert_eq!(rs.status, RunStatus::Failed);
    }
}

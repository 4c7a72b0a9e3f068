//! Step runner: checkpointed state transitions around step execution.
//!
//! The protocol is save-at-every-transition: running is persisted before the
//! step body executes, and the outcome is persisted before the error (if
//! any) propagates. A process crash therefore always leaves a ledger the
//! next invocation can re-enter.

use crate::run::state::{RunState, STEP_NAMES, StepStatus};
use anyhow::{Result, anyhow};

/// Completed steps are skipped outright; this is how resume works.
pub fn should_skip(rs: &RunState, idx: usize) -> bool {
    if rs.steps[idx].status == StepStatus::Completed {
        tracing::info!(run = %rs.id, step = STEP_NAMES[idx], "skipping completed step");
        return true;
    }
    false
}

/// Mark a step running, clear any stale error, persist.
pub fn begin(rs: &mut RunState, idx: usize) -> Result<()> {
    rs.steps[idx].status = StepStatus::Running;
    rs.steps[idx].error.clear();
    rs.save()
}

/// Record the step outcome and persist. A failure marks the run failed and
/// returns the error wrapped as `step <N> (<name>): <detail>` with external
/// 1-based numbering.
pub fn settle(rs: &mut RunState, idx: usize, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => {
            rs.steps[idx].status = StepStatus::Completed;
            rs.refresh_status();
            rs.save()?;
            Ok(())
        }
        Err(err) => {
            let detail = format!("{err:#}");
            rs.steps[idx].status = StepStatus::Failed;
            rs.steps[idx].error = detail.clone();
            rs.refresh_status();
            rs.save()?;
            Err(anyhow!("step {} ({}): {}", idx + 1, STEP_NAMES[idx], detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::registry::{set_runs_dir, test_guard};
    use crate::run::state::RunStatus;
    use tempfile::tempdir;

    #[test]
    fn test_begin_persists_running() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        begin(&mut rs, 0).unwrap();

        let on_disk = RunState::load(&rs.id).unwrap();
        assert_eq!(on_disk.steps[0].status, StepStatus::Running);
    }

    #[test]
    fn test_settle_success_persists_completed() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        begin(&mut rs, 0).unwrap();
        settle(&mut rs, 0, Ok(())).unwrap();

        let on_disk = RunState::load(&rs.id).unwrap();
        assert_eq!(on_disk.steps[0].status, StepStatus::Completed);
        assert_eq!(on_disk.status, RunStatus::Active);
    }

    #[test]
    fn test_settle_failure_records_error_and_fails_run() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        begin(&mut rs, 6).unwrap();
        let err = settle(&mut rs, 6, Err(anyhow!("boom"))).unwrap_err();

        assert_eq!(err.to_string(), "step 7 (create pr): boom");

        let on_disk = RunState::load(&rs.id).unwrap();
        assert_eq!(on_disk.steps[6].status, StepStatus::Failed);
        assert_eq!(on_disk.steps[6].error, "boom");
        assert_eq!(on_disk.status, RunStatus::Failed);
    }

    #[test]
    fn test_begin_clears_previous_error() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        begin(&mut rs, 4).unwrap();
        let _ = settle(&mut rs, 4, Err(anyhow!("first failure")));

        rs.steps[4].status = StepStatus::Pending;
        begin(&mut rs, 4).unwrap();
        assert!(rs.steps[4].error.is_empty());
    }

    #[test]
    fn test_should_skip_only_completed() {
        let mut rs = RunState::new("20260101-000000-x", "x.md");
        assert!(!should_skip(&rs, 0));
        rs.steps[0].status = StepStatus::Completed;
        assert!(should_skip(&rs, 0));
        rs.steps[0].status = StepStatus::Failed;
        assert!(!should_skip(&rs, 0));
    }

    #[test]
    fn test_all_step_completions_complete_the_run() {
        let _guard = test_guard();
        let dir = tempdir().unwrap();
        set_runs_dir(dir.path());

        let mut rs = RunState::new("20260101-000000-x", "x.md");
        for idx in 0..STEP_NAMES.len() {
            begin(&mut rs, idx).unwrap();
            settle(&mut rs, idx, Ok(())).unwrap();
        }
        assert_eq!(rs.status, RunStatus::Completed);
    }
}

//! Merged-worktree reaper: reconcile durable run state with remote PR
//! status, removing worktrees whose PRs have merged.

use crate::providers::{CodeHost, WorktreeManager};
use anyhow::Result;
use std::path::Path;

/// Sweep every persisted run: worktrees belonging to merged PRs are removed
/// and their paths cleared on disk. Individual failures are logged and do
/// not abort the sweep. Returns the number of removed worktrees.
pub async fn reap_merged(host: &dyn CodeHost, worktree: &dyn WorktreeManager) -> Result<usize> {
    let mut removed = 0;

    for mut rs in crate::run::RunState::list() {
        if rs.pr_number == 0 || rs.worktree_path.is_empty() {
            continue;
        }

        let state = match host.pr_state(rs.pr_number).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    run = %rs.id,
                    pr = rs.pr_number,
                    error = %format!("{err:#}"),
                    "could not fetch PR state, skipping"
                );
                continue;
            }
        };
        if state != "MERGED" {
            continue;
        }

        let path = rs.worktree_path.clone();
        if let Err(err) = worktree.remove(Path::new(&path)).await {
            tracing::warn!(
                run = %rs.id,
                path = %path,
                error = %format!("{err:#}"),
                "failed to remove merged worktree"
            );
            continue;
        }

        rs.worktree_path.clear();
        if let Err(err) = rs.save() {
            tracing::warn!(
                run = %rs.id,
                error = %format!("{err:#}"),
                "failed to persist worktree removal"
            );
            continue;
        }

        tracing::info!(run = %rs.id, pr = rs.pr_number, path = %path, "reaped merged worktree");
        removed += 1;
    }

    Ok(removed)
}

//! Batch executor: run a set of issues as dependency-ordered pipelines.
//!
//! Levels come from the topological sort; a level of independent issues runs
//! as parallel peer tasks and the next level starts only after the previous
//! one fully joins. Failures are fail-fast-after-join: in-flight peers
//! finish, then the batch aborts and downstream issues are reported blocked.

use crate::agent::{Agent, AgentPool, FallbackAgent};
use crate::batch::deps::{blocked_downstream, parse_deps, topsort};
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::providers::{Issue, Providers};
use crate::run::state::RunState;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Only fetch open issues carrying this label; empty means all open.
    pub label: String,
    /// Log the execution plan without running anything.
    pub dry_run: bool,
}

pub struct BatchRunner {
    config: Arc<Config>,
    providers: Providers,
    pool: Arc<AgentPool>,
    repo_root: PathBuf,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(
        config: Arc<Config>,
        providers: Providers,
        pool: Arc<AgentPool>,
        repo_root: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            providers,
            pool,
            repo_root: repo_root.into(),
            cancel,
        }
    }

    pub async fn run(&self, opts: &BatchOptions) -> Result<()> {
        let mut issues = self
            .providers
            .host
            .list_issues("open", &opts.label)
            .await
            .context("failed to list issues")?;
        if issues.is_empty() {
            tracing::info!(label = %opts.label, "no open issues to process");
            return Ok(());
        }

        // With a label filter, referenced dependencies may sit outside the
        // filtered set; pull them in so ordering still holds.
        if !opts.label.is_empty() {
            self.expand_dependencies(&mut issues).await?;
        }

        let deps: HashMap<u64, Vec<u64>> = issues
            .iter()
            .map(|i| (i.number, parse_deps(&i.body)))
            .collect();
        let numbers: Vec<u64> = issues.iter().map(|i| i.number).collect();
        let levels = topsort(&numbers, &deps).map_err(|err| anyhow!(err))?;

        let by_number: HashMap<u64, Issue> =
            issues.into_iter().map(|i| (i.number, i)).collect();

        if opts.dry_run {
            tracing::info!(levels = levels.len(), "dry run: execution plan");
            for (level_idx, level) in levels.iter().enumerate() {
                for number in level {
                    tracing::info!(
                        level = level_idx + 1,
                        issue = number,
                        title = %by_number[number].title,
                        "planned"
                    );
                }
            }
            return Ok(());
        }

        let mut ordinal = 0usize;
        for (level_idx, level) in levels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                bail!("batch cancelled before level {}", level_idx + 1);
            }
            tracing::info!(
                level = level_idx + 1,
                issues = ?level,
                "starting batch level"
            );

            if let Some((number, err)) = self.run_level(level, &by_number, &mut ordinal).await {
                return Err(self.report_failure(number, err, &deps).await);
            }
        }

        tracing::info!("batch completed");
        Ok(())
    }

    /// Run one level to completion. Returns the first failure in level
    /// order, if any, after every peer has joined.
    async fn run_level(
        &self,
        level: &[u64],
        by_number: &HashMap<u64, Issue>,
        ordinal: &mut usize,
    ) -> Option<(u64, anyhow::Error)> {
        if let [number] = level {
            let issue = by_number[number].clone();
            let start = *ordinal % self.pool.len();
            *ordinal += 1;
            return match self.execute_issue(issue, start).await {
                Ok(_) => None,
                Err(err) => Some((*number, err)),
            };
        }

        let mut handles = Vec::with_capacity(level.len());
        for number in level {
            let issue = by_number[number].clone();
            let start = *ordinal % self.pool.len();
            *ordinal += 1;

            let config = Arc::clone(&self.config);
            let providers = self.providers.clone();
            let pool = Arc::clone(&self.pool);
            let repo_root = self.repo_root.clone();
            let cancel = self.cancel.clone();

            handles.push((
                *number,
                tokio::spawn(async move {
                    let agent: Arc<dyn Agent> = Arc::new(FallbackAgent::new(pool, start));
                    let mut pipeline =
                        Pipeline::new(config, providers, agent, repo_root, cancel);
                    pipeline.run_issue(&issue).await
                }),
            ));
        }

        // Barrier: every peer joins before the failure decision.
        let mut first_failure: Option<(u64, anyhow::Error)> = None;
        for (number, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow!("issue task panicked: {join_err}")),
            };
            match outcome {
                Ok(rs) => {
                    tracing::info!(issue = number, run = %rs.id, pr = %rs.pr_url, "issue completed");
                }
                Err(err) if first_failure.is_none() => first_failure = Some((number, err)),
                Err(err) => {
                    tracing::error!(issue = number, error = %format!("{err:#}"), "issue failed");
                }
            }
        }
        first_failure
    }

    async fn execute_issue(&self, issue: Issue, start: usize) -> Result<RunState> {
        let agent: Arc<dyn Agent> = Arc::new(FallbackAgent::new(Arc::clone(&self.pool), start));
        let mut pipeline = Pipeline::new(
            Arc::clone(&self.config),
            self.providers.clone(),
            agent,
            self.repo_root.clone(),
            self.cancel.clone(),
        );
        pipeline.run_issue(&issue).await
    }

    /// Iteratively fetch dependencies referenced by the current set until a
    /// round adds nothing new. Unfetchable references downgrade to external.
    async fn expand_dependencies(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let mut known: HashSet<u64> = issues.iter().map(|i| i.number).collect();
        let mut external: HashSet<u64> = HashSet::new();

        loop {
            let mut missing: BTreeSet<u64> = BTreeSet::new();
            for issue in issues.iter() {
                for dep in parse_deps(&issue.body) {
                    if !known.contains(&dep) && !external.contains(&dep) {
                        missing.insert(dep);
                    }
                }
            }
            if missing.is_empty() {
                return Ok(());
            }

            for number in missing {
                match self.providers.host.get_issue(number).await {
                    Ok(issue) => {
                        tracing::info!(
                            issue = number,
                            "pulled in dependency from outside the label filter"
                        );
                        known.insert(number);
                        issues.push(issue);
                    }
                    Err(err) => {
                        tracing::warn!(
                            issue = number,
                            error = %format!("{err:#}"),
                            "dependency could not be fetched, treating as external"
                        );
                        external.insert(number);
                    }
                }
            }
        }
    }

    /// Log the failing issue, notify about blocked downstream work, and
    /// build the batch-fatal error.
    async fn report_failure(
        &self,
        number: u64,
        err: anyhow::Error,
        deps: &HashMap<u64, Vec<u64>>,
    ) -> anyhow::Error {
        let blocked = blocked_downstream(number, deps);
        tracing::error!(
            issue = number,
            blocked = ?blocked,
            error = %format!("{err:#}"),
            "batch aborting on failed issue"
        );

        if let Some(notifier) = &self.providers.notifier {
            let blocked_list = blocked
                .iter()
                .map(|n| format!("#{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let message = if blocked.is_empty() {
                format!("forge batch: issue #{number} failed: {err:#}")
            } else {
                format!(
                    "forge batch: issue #{number} failed: {err:#}. Blocked: [{blocked_list}]"
                )
            };
            if let Err(notify_err) = notifier.notify(&message).await {
                tracing::warn!(
                    error = %format!("{notify_err:#}"),
                    "batch failure notification could not be sent"
                );
            }
        }

        anyhow!("issue #{number} failed: {err:#}")
    }
}

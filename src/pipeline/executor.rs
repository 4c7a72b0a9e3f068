//! The single-run pipeline: an 11-step linear state machine over one plan.
//!
//! Each step executes through the step runner, so every transition is
//! checkpointed and completed steps short-circuit on re-entry; that is the
//! whole resume mechanism. External side effects (issue, branch, PR,
//! force-push) happen at most once per step via the completed guard.

use crate::agent::Agent;
use crate::config::{Config, FixStrategy};
use crate::pipeline::{cr, hooks, plan};
use crate::providers::Providers;
use crate::run::state::{self, RunState, RunStatus, StepStatus};
use crate::run::step;
use crate::util::slugify;
use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bounded agent-fix attempts for a failing pre-commit hook.
const PRE_COMMIT_MAX_RETRIES: u32 = 2;

pub struct Pipeline {
    config: Arc<Config>,
    providers: Providers,
    agent: Arc<dyn Agent>,
    repo_root: PathBuf,
    cancel: CancellationToken,
    /// Plan text for this run, re-read from disk on resume. Never persisted.
    plan: Option<plan::PlanDoc>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        providers: Providers,
        agent: Arc<dyn Agent>,
        repo_root: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            providers,
            agent,
            repo_root: repo_root.into(),
            cancel,
            plan: None,
        }
    }

    /// Start a fresh plan-mode run.
    pub async fn run_plan(&mut self, plan_path: &Path) -> Result<RunState> {
        let stem = plan_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plan");
        let id = state::new_run_id(&slugify(stem));
        let mut rs = RunState::new(id, plan_path.to_string_lossy().into_owned());
        rs.save()?;

        self.run(&mut rs).await?;
        Ok(rs)
    }

    /// Start a fresh push-mode run over the current branch.
    pub async fn run_push(&mut self) -> Result<RunState> {
        let id = state::new_run_id("push");
        let mut rs = RunState::new_push(id);
        rs.save()?;

        self.run(&mut rs).await?;
        Ok(rs)
    }

    /// Start a fresh run from a host issue: writes the temp plan file and
    /// records the source issue so the PR closes it.
    pub async fn run_issue(&mut self, issue: &crate::providers::Issue) -> Result<RunState> {
        let id = state::new_run_id(&format!("issue-{}", issue.number));
        let plan_path = state::plan_path_for(&id);
        plan::write_issue_plan(&plan_path, &issue.title, &issue.body)?;

        let mut rs = RunState::new(id, plan_path.to_string_lossy().into_owned());
        rs.source_issue = issue.number;
        rs.save()?;

        self.run(&mut rs).await?;
        Ok(rs)
    }

    /// Resume an existing run, optionally forcing re-execution from a step
    /// given by name or index.
    pub async fn resume(&mut self, id: &str, from: Option<&str>) -> Result<RunState> {
        let mut rs = RunState::load(id)?;

        match from {
            Some(step_ref) => {
                let idx = parse_step_ref(step_ref)
                    .ok_or_else(|| anyhow!("unknown step '{step_ref}'"))?;
                rs.reset_from(idx);
                rs.save()?;
            }
            None => match rs.status {
                RunStatus::Completed => {
                    bail!("run {id} already completed; pass --from <step> to re-run")
                }
                RunStatus::Failed => {
                    for step in &mut rs.steps {
                        if step.status == StepStatus::Failed {
                            step.status = StepStatus::Pending;
                            step.error.clear();
                        }
                    }
                    rs.status = RunStatus::Active;
                    rs.save()?;
                }
                RunStatus::Active => {}
            },
        }

        self.run(&mut rs).await?;
        Ok(rs)
    }

    /// Drive a run to completion, then apply the success/failure cleanup
    /// semantics: remove the worktree on success, preserve it on failure,
    /// and send a best-effort failure notification.
    pub async fn run(&mut self, rs: &mut RunState) -> Result<()> {
        self.restore_worktree(rs).await?;

        match self.drive(rs).await {
            Ok(()) => {
                tracing::info!(run = %rs.id, pr = %rs.pr_url, "run completed");
                self.cleanup_worktree(rs).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(run = %rs.id, error = %format!("{err:#}"), "run failed");
                if let Some(notifier) = &self.providers.notifier {
                    let message = format!("forge pipeline failed: {err:#}");
                    if let Err(notify_err) = notifier.notify(&message).await {
                        tracing::warn!(
                            error = %format!("{notify_err:#}"),
                            "failure notification could not be sent"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self, rs: &mut RunState) -> Result<()> {
        for idx in 0..state::STEP_NAMES.len() {
            if step::should_skip(rs, idx) {
                continue;
            }
            step::begin(rs, idx)?;
            let outcome = if self.cancel.is_cancelled() {
                Err(anyhow!("cancelled"))
            } else {
                self.execute(idx, rs).await
            };
            step::settle(rs, idx, outcome)?;
        }
        Ok(())
    }

    async fn execute(&mut self, idx: usize, rs: &mut RunState) -> Result<()> {
        match idx {
            state::READ_PLAN => self.read_plan(rs).await,
            state::CREATE_ISSUE => self.create_issue(rs).await,
            state::GENERATE_BRANCH => self.generate_branch(rs),
            state::CREATE_WORKTREE => self.create_worktree(rs).await,
            state::RUN_AGENT => self.run_agent(rs).await,
            state::COMMIT_AND_PUSH => self.commit_and_push(rs).await,
            state::CREATE_PR => self.create_pr(rs).await,
            state::POLL_CR => self.poll_cr(rs).await,
            state::FIX_CR => self.fix_cr(rs).await,
            state::PUSH_CR_FIX => self.push_cr_fix(rs).await,
            state::NOTIFY => self.notify(rs).await,
            _ => unreachable!("step index out of range"),
        }
    }

    // Step 0
    async fn read_plan(&mut self, rs: &mut RunState) -> Result<()> {
        let plan = self.load_plan(rs)?;
        rs.plan_title = plan.title.clone();
        self.plan = Some(plan);
        Ok(())
    }

    // Step 1
    async fn create_issue(&mut self, rs: &mut RunState) -> Result<()> {
        let Some(tracker) = self.providers.tracker.clone() else {
            tracing::debug!("no tracker configured, skipping issue creation");
            return Ok(());
        };
        let plan = self.ensure_plan(rs)?;
        let (title, body) = (plan.title.clone(), plan.body.clone());
        let issue = tracker.create_issue(&title, &body).await?;
        tracing::info!(key = %issue.key, "tracker issue created");
        rs.issue_key = issue.key;
        rs.issue_url = issue.url;
        Ok(())
    }

    // Step 2
    fn generate_branch(&mut self, rs: &mut RunState) -> Result<()> {
        if rs.is_push_mode() {
            rs.branch = self.providers.host.current_branch(&self.repo_root)?;
            return Ok(());
        }
        let slug = slugify(&rs.plan_title);
        rs.branch = if rs.issue_key.is_empty() {
            format!("forge/{slug}")
        } else {
            format!("{}-{slug}", rs.issue_key)
        };
        Ok(())
    }

    // Step 3
    async fn create_worktree(&mut self, rs: &mut RunState) -> Result<()> {
        if rs.is_push_mode() {
            rs.worktree_path = self.repo_root.to_string_lossy().into_owned();
            return Ok(());
        }
        let path = self
            .providers
            .worktree
            .create(&rs.branch, &self.config.vcs.base_branch)
            .await?;
        rs.worktree_path = path.to_string_lossy().into_owned();
        Ok(())
    }

    // Step 4
    async fn run_agent(&mut self, rs: &mut RunState) -> Result<()> {
        if rs.is_push_mode() {
            return Ok(());
        }
        let (title, body) = {
            let plan = self.ensure_plan(rs)?;
            (plan.title.clone(), plan.body.clone())
        };
        let prompt = format!(
            "You are implementing the following development plan in the \
             current working directory.\n\n# {title}\n\n{body}\n{}",
            self.agent.prompt_suffix()
        );
        let dir = PathBuf::from(&rs.worktree_path);
        let log = state::agent_log_path(&rs.id, state::RUN_AGENT);

        let output = tokio::select! {
            () = self.cancel.cancelled() => bail!("cancelled while agent was running"),
            result = self.agent.run(&dir, &prompt, &log) => result?,
        };
        tracing::debug!(chars = output.len(), "agent finished");

        if !self.providers.host.has_changes(&dir)? {
            bail!("agent produced no file changes");
        }
        Ok(())
    }

    // Step 5
    async fn commit_and_push(&mut self, rs: &mut RunState) -> Result<()> {
        let dir = PathBuf::from(&rs.worktree_path);
        let message = format!("forge: {}", rs.branch);

        if rs.is_push_mode() {
            if self.providers.host.has_changes(&dir)? {
                self.providers
                    .host
                    .commit_and_push(&dir, &rs.branch, &message)
                    .await?;
            } else {
                self.providers.host.push(&dir, &rs.branch).await?;
            }
            return Ok(());
        }

        if !self.config.hooks.pre_commit.is_empty() {
            let log = state::agent_log_path(&rs.id, state::COMMIT_AND_PUSH);
            hooks::run_pre_commit(
                &self.config.hooks.pre_commit,
                &dir,
                Some(self.agent.as_ref()),
                PRE_COMMIT_MAX_RETRIES,
                &log,
            )
            .await?;
        }

        self.providers
            .host
            .commit_and_push(&dir, &rs.branch, &message)
            .await
    }

    // Step 6
    async fn create_pr(&mut self, rs: &mut RunState) -> Result<()> {
        let plan = self.ensure_plan(rs)?;
        let (title, mut body) = (plan.title.clone(), plan.body.clone());
        if rs.source_issue != 0 {
            body = format!("{body}\n\nCloses #{}", rs.source_issue);
        }
        let pr = self
            .providers
            .host
            .create_pr(&rs.branch, &self.config.vcs.base_branch, &title, &body)
            .await?;
        tracing::info!(url = %pr.url, number = pr.number, "pull request created");
        rs.pr_url = pr.url;
        rs.pr_number = pr.number;
        Ok(())
    }

    // Step 7
    async fn poll_cr(&mut self, rs: &mut RunState) -> Result<()> {
        if !self.config.cr.enabled {
            return Ok(());
        }
        let pattern = Regex::new(&self.config.cr.comment_pattern)
            .context("invalid cr.comment_pattern")?;
        let feedback = cr::poll_for_feedback(
            self.providers.host.as_ref(),
            rs.pr_number,
            &pattern,
            self.config.cr.poll_interval,
            self.config.cr.poll_timeout,
            &self.cancel,
        )
        .await?;
        rs.cr_feedback = feedback;
        Ok(())
    }

    // Step 8
    async fn fix_cr(&mut self, rs: &mut RunState) -> Result<()> {
        if !self.config.cr.enabled || rs.is_push_mode() {
            return Ok(());
        }
        let prompt = format!(
            "{}{}",
            cr::fix_prompt(&rs.cr_feedback),
            self.agent.prompt_suffix()
        );
        let dir = PathBuf::from(&rs.worktree_path);
        let log = state::agent_log_path(&rs.id, state::FIX_CR);

        let output = tokio::select! {
            () = self.cancel.cancelled() => bail!("cancelled while agent was fixing review feedback"),
            result = self.agent.run(&dir, &prompt, &log) => result?,
        };
        rs.cr_fix_summary = cr::extract_summary(&output).unwrap_or_default();
        Ok(())
    }

    // Step 9
    async fn push_cr_fix(&mut self, rs: &mut RunState) -> Result<()> {
        if !self.config.cr.enabled || rs.is_push_mode() {
            return Ok(());
        }
        let dir = PathBuf::from(&rs.worktree_path);
        match self.config.cr.fix_strategy {
            FixStrategy::Amend => {
                let message = format!("forge: {}", rs.branch);
                self.providers
                    .host
                    .amend_and_force_push(&dir, &rs.branch, Some(&message))
                    .await?;
            }
            FixStrategy::NewCommit => {
                self.providers
                    .host
                    .commit_and_push(&dir, &rs.branch, "forge: address review feedback")
                    .await?;
            }
        }

        let reply = if rs.cr_fix_summary.is_empty() {
            cr::FALLBACK_REPLY.to_string()
        } else {
            rs.cr_fix_summary.clone()
        };
        self.providers
            .host
            .post_pr_comment(rs.pr_number, &reply)
            .await
    }

    // Step 10
    async fn notify(&mut self, rs: &mut RunState) -> Result<()> {
        let Some(notifier) = &self.providers.notifier else {
            return Ok(());
        };
        let mut message = format!("PR ready for review: {}", rs.pr_url);
        if !rs.issue_url.is_empty() {
            message.push_str(&format!(" (issue: {})", rs.issue_url));
        }
        notifier.notify(&message).await
    }

    /// Load the plan for this run: from the plan file in plan mode, or
    /// synthesized from the current branch in push mode.
    fn load_plan(&self, rs: &RunState) -> Result<plan::PlanDoc> {
        if rs.is_push_mode() {
            let branch = self.providers.host.current_branch(&self.repo_root)?;
            return Ok(plan::PlanDoc {
                title: crate::util::title_from_stem(&branch.replace('/', "-")),
                body: String::new(),
            });
        }
        plan::load(Path::new(&rs.plan_path))
    }

    /// Plan text is not persisted; when resume skipped step 0, re-read it.
    fn ensure_plan(&mut self, rs: &RunState) -> Result<&plan::PlanDoc> {
        if self.plan.is_none() {
            self.plan = Some(self.load_plan(rs)?);
        }
        Ok(self.plan.as_ref().expect("plan just loaded"))
    }

    /// If the worktree step already completed but the directory is gone
    /// (machine cleanup, manual delete), re-create it so resume can re-enter
    /// the agent step.
    async fn restore_worktree(&mut self, rs: &mut RunState) -> Result<()> {
        if rs.is_push_mode()
            || rs.worktree_path.is_empty()
            || rs.steps[state::CREATE_WORKTREE].status != StepStatus::Completed
            || Path::new(&rs.worktree_path).is_dir()
        {
            return Ok(());
        }
        tracing::warn!(
            run = %rs.id,
            path = %rs.worktree_path,
            "worktree directory missing, re-creating"
        );
        let path = self
            .providers
            .worktree
            .create(&rs.branch, &self.config.vcs.base_branch)
            .await?;
        rs.worktree_path = path.to_string_lossy().into_owned();
        rs.save()
    }

    /// Worktree removal is deferred to successful completion; failures keep
    /// the worktree so resume can re-enter without rebuilding state.
    async fn cleanup_worktree(&mut self, rs: &mut RunState) {
        if rs.is_push_mode() || !self.config.worktree.cleanup || rs.worktree_path.is_empty() {
            return;
        }
        let path = PathBuf::from(&rs.worktree_path);
        match self.providers.worktree.remove(&path).await {
            Ok(()) => {
                rs.worktree_path.clear();
                if let Err(err) = rs.save() {
                    tracing::warn!(error = %format!("{err:#}"), "failed to persist worktree removal");
                }
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "failed to remove worktree"
                );
            }
        }
    }
}

/// Resolve a `--from` argument: a 0-based index or a step name (spaces or
/// hyphens).
pub fn parse_step_ref(step_ref: &str) -> Option<usize> {
    if let Ok(idx) = step_ref.parse::<usize>() {
        return (idx < state::STEP_NAMES.len()).then_some(idx);
    }
    RunState::step_index(step_ref)
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge::agent::{Agent, AgentPool, CliAgent};
use forge::batch::{BatchOptions, BatchRunner};
use forge::config::Config;
use forge::pipeline::Pipeline;
use forge::providers::{self, Providers};
use forge::run::{RunState, registry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "AI-powered development orchestrator")]
struct Cli {
    /// Path to the config file (default: .forge/forge.toml under the project dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository root (default: current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the pipeline over a plan file to a reviewed PR
    Run {
        /// Markdown plan, optionally with `title:` frontmatter
        plan: PathBuf,
    },
    /// Create a PR from the current branch and local changes
    Push,
    /// Resume a run from its ledger, optionally from a specific step
    Resume {
        /// Run id (see `forge runs`)
        id: String,
        /// Step index or name to re-execute from (e.g. `4` or `run-agent`)
        #[arg(long)]
        from: Option<String>,
    },
    /// Run the pipeline over a single host issue
    Issue { number: u64 },
    /// Run all open issues as a dependency-ordered batch
    Batch {
        /// Only process issues carrying this label
        #[arg(long, default_value = "")]
        label: String,
        /// Log the execution plan without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List runs in the ledger
    Runs,
    /// Remove worktrees whose PRs have merged
    Reap,
    /// Delete completed runs older than the retention window
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    registry::set_runs_dir(repo_root.join(".forge").join("runs"));

    // The ledger listing needs no config or providers.
    if matches!(cli.command, Commands::Runs) {
        return cmd_runs();
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| repo_root.join(Config::DEFAULT_PATH));
    let config = Arc::new(Config::load(&config_path)?);
    let providers = providers::from_config(&config, &repo_root)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    if let Err(err) = registry::register_repo(&repo_root) {
        tracing::debug!(error = %format!("{err:#}"), "could not update repo registry");
    }

    match &cli.command {
        Commands::Run { plan } => {
            let mut pipeline = build_pipeline(&config, &providers, &repo_root, &cancel)?;
            let rs = pipeline.run_plan(plan).await?;
            println!("run {} completed: {}", rs.id, rs.pr_url);
        }
        Commands::Push => {
            let mut pipeline = build_pipeline(&config, &providers, &repo_root, &cancel)?;
            let rs = pipeline.run_push().await?;
            println!("run {} completed: {}", rs.id, rs.pr_url);
        }
        Commands::Resume { id, from } => {
            let mut pipeline = build_pipeline(&config, &providers, &repo_root, &cancel)?;
            let rs = pipeline.resume(id, from.as_deref()).await?;
            println!("run {} completed: {}", rs.id, rs.pr_url);
        }
        Commands::Issue { number } => {
            let issue = providers.host.get_issue(*number).await?;
            let mut pipeline = build_pipeline(&config, &providers, &repo_root, &cancel)?;
            let rs = pipeline.run_issue(&issue).await?;
            println!("run {} completed: {}", rs.id, rs.pr_url);
        }
        Commands::Batch { label, dry_run } => {
            let pool = build_pool(&config)?;
            let runner = BatchRunner::new(
                Arc::clone(&config),
                providers.clone(),
                pool,
                &repo_root,
                cancel.clone(),
            );
            runner
                .run(&BatchOptions {
                    label: label.clone(),
                    dry_run: *dry_run,
                })
                .await?;
        }
        Commands::Reap => {
            if !config.worktree.cleanup_on_merge {
                println!("worktree.cleanup_on_merge is disabled; nothing to do");
                return Ok(());
            }
            let removed =
                forge::reaper::reap_merged(providers.host.as_ref(), providers.worktree.as_ref())
                    .await?;
            println!("removed {removed} merged worktree(s)");
        }
        Commands::Cleanup => {
            let removed = RunState::cleanup(config.state.retention);
            println!("removed {removed} completed run(s)");
        }
        Commands::Runs => unreachable!("handled above"),
    }

    Ok(())
}

fn cmd_runs() -> Result<()> {
    let runs = RunState::list();
    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }
    for rs in runs {
        let step = match rs.current_step() {
            Some(idx) => forge::run::STEP_NAMES[idx],
            None => "done",
        };
        println!(
            "{}  {:9}  {:16}  {}",
            rs.id,
            format!("{:?}", rs.status).to_lowercase(),
            step,
            rs.pr_url
        );
    }
    Ok(())
}

fn build_pipeline(
    config: &Arc<Config>,
    providers: &Providers,
    repo_root: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<Pipeline> {
    let agent: Arc<dyn Agent> = Arc::new(CliAgent::from_provider(
        &config.agent.provider,
        &config.agent,
    )?);
    Ok(Pipeline::new(
        Arc::clone(config),
        providers.clone(),
        agent,
        repo_root,
        cancel.clone(),
    ))
}

fn build_pool(config: &Config) -> Result<Arc<AgentPool>> {
    let names = config.agent_pool_providers();
    let agents = names
        .iter()
        .map(|provider| {
            CliAgent::from_provider(provider, &config.agent)
                .map(|agent| Arc::new(agent) as Arc<dyn Agent>)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(AgentPool::new(agents, names)?))
}

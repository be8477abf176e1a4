use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_orchestrator::{
    AgentTask, Orchestrator, RoutingStrategy, SwitchyardConfig, TaskStatus,
};
use switchyard_registry::{AgentFilter, ManifestLoader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every agent manifest in a directory
    Validate {
        /// Manifest directory
        dir: PathBuf,
    },
    /// List or search the agents declared in a directory
    Agents {
        /// Manifest directory
        dir: PathBuf,
        /// Rank agents by relevance to this term
        #[arg(long)]
        search: Option<String>,
        /// Only agents of this type
        #[arg(long = "type")]
        agent_type: Option<String>,
        /// Only agents with this tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Deploy the agents in a directory and run a task file against them
    Run {
        /// Manifest directory
        dir: PathBuf,
        /// Task file (`[[tasks]]` tables)
        tasks: PathBuf,
        /// Run agents in-process instead of launching their entrypoints
        #[arg(long)]
        simulate: bool,
        /// Run tasks one after another
        #[arg(long)]
        sequential: bool,
        /// Cancel the remaining tasks after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Routing strategy (overrides config)
        #[arg(long)]
        strategy: Option<RoutingStrategy>,
        /// Instances started per agent
        #[arg(long, default_value_t = 1)]
        instances: usize,
    },
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<AgentTask>,
}

fn read_tasks(path: &Path) -> anyhow::Result<Vec<AgentTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file '{}'", path.display()))?;
    let file: TaskFile = toml::from_str(&raw)
        .with_context(|| format!("Invalid task file '{}'", path.display()))?;
    Ok(file.tasks)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }

    let config = SwitchyardConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate { dir } => {
            let checks = ManifestLoader::validate_dir(&dir)?;
            let mut invalid = 0;
            for check in &checks {
                match &check.result {
                    Ok(agent_id) => println!("ok      {}  ({})", check.path.display(), agent_id),
                    Err(e) => {
                        invalid += 1;
                        println!("invalid {}  {}", check.path.display(), e);
                    }
                }
            }
            println!("{} manifest(s), {} invalid", checks.len(), invalid);
            if invalid > 0 {
                anyhow::bail!("{invalid} invalid manifest(s) in {}", dir.display());
            }
        }
        Commands::Agents {
            dir,
            search,
            agent_type,
            tag,
        } => {
            let orchestrator = Orchestrator::builder().config(config).simulated().build();
            let loader = ManifestLoader::new(&dir);
            for manifest in loader.load_all().await? {
                orchestrator
                    .agents()
                    .register_with_capabilities(
                        manifest.agent.clone(),
                        manifest.capabilities.clone(),
                    )
                    .await?;
            }

            let listing = match search {
                Some(term) => orchestrator
                    .agents()
                    .search(&term, 20)
                    .into_iter()
                    .map(|hit| json!({ "score": hit.score, "agent": hit.agent.as_ref() }))
                    .collect::<Vec<_>>(),
                None => {
                    let filter = AgentFilter {
                        agent_type,
                        tag,
                        ..AgentFilter::default()
                    };
                    orchestrator
                        .agents()
                        .list_agents(&filter)
                        .await
                        .into_iter()
                        .map(|agent| json!(agent.as_ref()))
                        .collect()
                }
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Commands::Run {
            dir,
            tasks,
            simulate,
            sequential,
            fail_fast,
            strategy,
            instances,
        } => {
            let mut config = config;
            if let Some(strategy) = strategy {
                config.executor.default_strategy = strategy;
            }
            let tasks = read_tasks(&tasks)?;
            let builder = Orchestrator::builder().config(config);
            let orchestrator = if simulate {
                builder.simulated().build()
            } else {
                builder.build()
            };

            let loader = ManifestLoader::new(&dir);
            for manifest in loader.load_all().await? {
                orchestrator
                    .deploy(
                        manifest.agent.clone(),
                        manifest.capabilities.clone(),
                        instances,
                    )
                    .await
                    .with_context(|| format!("Failed to deploy agent '{}'", manifest.agent.id))?;
            }
            orchestrator.start();
            info!(tasks = tasks.len(), simulate, "running task file");

            let report = if tasks.iter().any(|t| !t.dependencies.is_empty()) {
                run_scheduled(&orchestrator, tasks).await?
            } else {
                let outcome = orchestrator
                    .executor()
                    .execute_batch(tasks, !sequential, fail_fast)
                    .await?;
                let tasks: Vec<&AgentTask> = outcome.tasks.iter().map(AsRef::as_ref).collect();
                json!({
                    "status": outcome.status,
                    "tasks": tasks,
                    "errors": outcome.errors,
                })
            };
            orchestrator.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Queue everything and drive the scheduler until every task is terminal.
async fn run_scheduled(
    orchestrator: &Orchestrator,
    tasks: Vec<AgentTask>,
) -> anyhow::Result<serde_json::Value> {
    let executor = orchestrator.executor();
    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for task in tasks {
        executor.queue_task(task)?;
    }

    loop {
        executor.scheduler_pass();
        let finished = ids
            .iter()
            .filter_map(|id| executor.get_task(id))
            .all(|t| t.status.is_terminal());
        if finished {
            break;
        }
        if executor.store().queue_len() == 0
            && executor.list_tasks(Some(TaskStatus::Running)).is_empty()
            && executor.list_tasks(Some(TaskStatus::Retrying)).is_empty()
        {
            warn!("no runnable tasks left; stopping");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let snapshots: Vec<_> = ids.iter().filter_map(|id| executor.get_task(id)).collect();
    let errors: Vec<_> = snapshots.iter().filter_map(|t| t.error.clone()).collect();
    let status = switchyard_orchestrator::batch_status(snapshots.iter().map(|t| t.status));
    let tasks: Vec<&AgentTask> = snapshots.iter().map(AsRef::as_ref).collect();
    Ok(json!({ "status": status, "tasks": tasks, "errors": errors }))
}

//! CLI interface for relayflow

use crate::codec::PersistedFlow;
use crate::dag::DependencyGraph;
use crate::flow::{Flow, SeedArgs};
use crate::jobs::{FlowRegistry, JobId, JobRunner, JobStore, SqliteJobStore};
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::models::{FlowStatus, NodeOutcome, RunnerConfig, WorkflowConfig};
use crate::parser::parse_workflow_file;
use crate::workflow::build_flow;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// relayflow - resumable dependency-graph task runner
#[derive(Parser, Debug)]
#[command(name = "relayflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable dependency-graph task runner", long_about = None)]
pub struct Cli {
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,

    /// Job database path
    #[arg(long, default_value = "relayflow.db", global = true)]
    pub db_path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate workflow YAML and print its rounds
    Validate {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },

    /// Run a workflow in-process until it is done
    Run {
        /// Path to workflow YAML file
        workflow: PathBuf,

        /// Seed argument, KEY=VALUE (VALUE is JSON, or a plain string)
        #[arg(short, long = "arg", value_parser = parse_seed_arg)]
        args: Vec<(String, Value)>,
    },

    /// Seed a workflow and store it as a pending job
    Submit {
        /// Path to workflow YAML file
        workflow: PathBuf,

        /// Seed argument, KEY=VALUE (VALUE is JSON, or a plain string)
        #[arg(short, long = "arg", value_parser = parse_seed_arg)]
        args: Vec<(String, Value)>,
    },

    /// Execute stored jobs until interrupted
    Worker {
        /// Workflow YAML files this worker can execute
        #[arg(short, long = "workflow", required = true)]
        workflows: Vec<PathBuf>,

        /// Maximum number of jobs running at once
        #[arg(long, default_value_t = RunnerConfig::default().batch_size)]
        batch_size: usize,

        /// Sleep between polls of an empty queue
        #[arg(long, default_value_t = RunnerConfig::default().poll_interval_ms)]
        poll_interval_ms: u64,
    },

    /// Show a job's state and its nodes
    Status {
        job_id: JobId,
    },
}

/// Parse `key=value`; the value is read as JSON when it parses as JSON
pub fn parse_seed_arg(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig {
            level: self.log_level,
            format: self.log_format,
        })
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Validate { workflow } => self.validate_workflow(workflow),
            Commands::Run { workflow, args } => self.run_workflow(workflow, args).await,
            Commands::Submit { workflow, args } => self.submit_workflow(workflow, args).await,
            Commands::Worker {
                workflows,
                batch_size,
                poll_interval_ms,
            } => {
                let config = RunnerConfig {
                    batch_size: *batch_size,
                    poll_interval_ms: *poll_interval_ms,
                };
                self.run_worker(workflows, config).await
            }
            Commands::Status { job_id } => self.show_status(job_id).await,
        }
    }

    /// Validate a workflow without executing
    fn validate_workflow(&self, workflow_path: &Path) -> anyhow::Result<()> {
        info!("Validating workflow: {:?}", workflow_path);

        let config = parse_workflow_file(workflow_path)?;
        let flow = build_flow(&config)?;
        let rounds = flow.plan()?;
        let order = DependencyGraph::build(
            config
                .nodes
                .iter()
                .map(|n| (n.name.as_str(), n.depends_on.as_slice())),
        )?
        .topological_sort()?;

        println!("Workflow '{}' is valid", config.name);
        println!("Nodes: {}", flow.len());
        println!("Execution order: {}", order.join(" -> "));
        for (i, round) in rounds.iter().enumerate() {
            println!("Round {}: {}", i + 1, round.join(", "));
        }

        Ok(())
    }

    /// Seed and advance a workflow in-process
    async fn run_workflow(&self, workflow_path: &Path, args: &[(String, Value)]) -> anyhow::Result<()> {
        info!("Loading workflow from: {:?}", workflow_path);
        let config = parse_workflow_file(workflow_path)?;
        let mut flow = build_flow(&config)?;

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling running nodes");
                interrupt.cancel();
            }
        });

        flow.seed(seed_args(args), &cancel).await?;
        while !flow.is_done()? && !cancel.is_cancelled() {
            flow.advance(&cancel).await?;
        }

        print_outcomes(&flow)?;

        match flow.status()? {
            FlowStatus::Succeeded => {
                info!("Workflow '{}' completed successfully", config.name);
                Ok(())
            }
            status => {
                error!("Workflow '{}' finished as {}", config.name, status);
                std::process::exit(1);
            }
        }
    }

    /// Seed a workflow and enqueue it for a worker
    async fn submit_workflow(&self, workflow_path: &Path, args: &[(String, Value)]) -> anyhow::Result<()> {
        let config = parse_workflow_file(workflow_path)?;
        let name = config.name.clone();

        let mut registry = FlowRegistry::new();
        register_workflow(&mut registry, config);

        let store = Arc::new(SqliteJobStore::new(&self.db_path)?);
        let runner = JobRunner::new(store, registry, RunnerConfig::default());
        let job_id = runner.start_flow(&name, seed_args(args)).await?;

        println!("{}", job_id);
        Ok(())
    }

    /// Recover interrupted jobs, then poll until Ctrl+C
    async fn run_worker(&self, workflow_paths: &[PathBuf], config: RunnerConfig) -> anyhow::Result<()> {
        let mut registry = FlowRegistry::new();
        for path in workflow_paths {
            let workflow = parse_workflow_file(path)?;
            info!("Registered workflow '{}' from {:?}", workflow.name, path);
            register_workflow(&mut registry, workflow);
        }

        let store = Arc::new(SqliteJobStore::new(&self.db_path)?);
        let recovered = store.recover_interrupted()?;
        if !recovered.is_empty() {
            info!("Recovered {} interrupted jobs", recovered.len());
        }

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });

        let runner = JobRunner::new(store, registry, config);
        runner.run(cancel).await?;
        Ok(())
    }

    /// Print a stored job's state and per-node states
    async fn show_status(&self, job_id: &JobId) -> anyhow::Result<()> {
        let store = SqliteJobStore::new(&self.db_path)?;
        let record = store.load(job_id).await?;

        println!("Job: {}", record.id);
        println!("  Flow: {}", record.flow_name);
        println!("  State: {}", record.state);
        println!("  Created: {}", record.created_at);
        println!("  Updated: {}", record.updated_at);

        match PersistedFlow::from_slice(&record.payload) {
            Ok(persisted) => {
                println!("  Nodes:");
                for (key, node) in &persisted.nodes {
                    if node.error.is_empty() {
                        println!("    - {} [{}]", key, node.state);
                    } else {
                        println!("    - {} [{}] {}", key, node.state, node.error);
                    }
                }
            }
            Err(err) => println!("  Payload unreadable: {}", err),
        }

        Ok(())
    }
}

fn register_workflow(registry: &mut FlowRegistry, config: WorkflowConfig) {
    let name = config.name.clone();
    let config = Arc::new(config);
    registry.register(name, move || build_flow(&config));
}

fn seed_args(args: &[(String, Value)]) -> SeedArgs {
    args.iter().cloned().collect()
}

fn print_outcomes(flow: &Flow) -> anyhow::Result<()> {
    println!("Workflow '{}': {}", flow.name(), flow.status()?);
    for summary in flow.summaries()? {
        match summary.outcome {
            Some(NodeOutcome::Success) => println!("  - {} [success]", summary.key),
            Some(NodeOutcome::Failed(message)) => {
                println!("  - {} [failed] {}", summary.key, message)
            }
            None => println!("  - {} [{}]", summary.key, summary.state),
        }
    }
    Ok(())
}

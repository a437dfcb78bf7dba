//! `taskmesh` command-line runner.

mod handlers;
mod workflow_file;

use clap::{Parser, Subcommand};
use handlers::BuiltinHandler;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskmesh_orchestrator::{AgentRole, Engine, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmesh", about = "Taskmesh: agent task scheduling and DAG workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskmesh.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion and print its final status
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Parse and validate a workflow without running it
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
}

#[derive(Debug, Default, Deserialize)]
struct TaskmeshConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentConfig {
    name: String,
    #[serde(default = "default_role")]
    role: AgentRole,
    #[serde(default)]
    specialties: Vec<String>,
    #[serde(default)]
    handler: BuiltinHandler,
}

fn default_role() -> AgentRole {
    AgentRole::Worker
}

impl TaskmeshConfig {
    /// Read the config file; a missing file means all defaults.
    fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: TaskmeshConfig = toml::from_str(raw)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Agents to register: the configured ones, or two echo workers.
    fn agents(&self) -> Vec<AgentConfig> {
        if !self.agents.is_empty() {
            return self.agents.clone();
        }
        (1..=2)
            .map(|i| AgentConfig {
                name: format!("worker-{i}"),
                role: AgentRole::Worker,
                specialties: Vec::new(),
                handler: BuiltinHandler::Echo,
            })
            .collect()
    }
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    match cli.command {
        Commands::Validate { workflow } => {
            let parsed = workflow_file::load(&workflow).map_err(|e| {
                anyhow::anyhow!("Workflow '{}' is invalid: {}", workflow.display(), e)
            })?;
            info!(workflow = %parsed.name, nodes = parsed.nodes.len(), "Workflow is valid");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "name": parsed.name,
                    "nodes": parsed.nodes.keys().collect::<Vec<_>>(),
                    "valid": true,
                }))?
            );
        }
        Commands::Run {
            workflow,
            timeout_secs,
        } => {
            let config = TaskmeshConfig::load(&cli.config)?;
            let parsed = workflow_file::load(&workflow).map_err(|e| {
                anyhow::anyhow!("Workflow '{}' is invalid: {}", workflow.display(), e)
            })?;

            let engine = Engine::new(config.engine.clone())?;
            for agent in config.agents() {
                engine.register_agent(
                    agent.name,
                    agent.handler.build(),
                    agent.role,
                    agent.specialties,
                )?;
            }
            info!(agents = engine.agents().len(), "Agents registered");

            engine.start();
            let id = engine.submit_workflow(parsed)?;
            let status = engine
                .wait_workflow(id, timeout_secs.map(Duration::from_secs))
                .await?;
            engine.stop(true).await;

            let report = serde_json::json!({
                "workflow": status,
                "engine": engine.status().to_json(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

mod executors;
mod workflow;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskloom_core::{ExecutionContext, Task, TaskGraph, TaskId, TaskStatus};
use taskloom_engine::decomposer::materialize;
use taskloom_engine::{DecomposerRegistry, Engine, EngineConfig, Liveness};
use taskloom_store::{FileTaskStore, InMemoryTaskStore, TaskStore};
use tracing::info;
use tracing_subscriber::EnvFilter;
use workflow::Workflow;

#[derive(Parser)]
#[command(name = "taskloom", about = "Taskloom: dependency-aware task orchestration")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion and print the root task
    Run {
        /// Workflow file
        workflow: PathBuf,
        /// Engine config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Persist tasks, graphs and logs under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Decompose a workflow's root task and check its graph
    Validate {
        /// Workflow file
        workflow: PathBuf,
    },
    /// Print a persisted task and its execution log
    Inspect {
        task_id: TaskId,
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Run {
            workflow,
            config,
            data_dir,
        } => run(&workflow, config.as_deref(), data_dir).await,
        Commands::Validate { workflow } => validate(&workflow).await,
        Commands::Inspect { task_id, data_dir } => inspect(task_id, data_dir).await,
    }
}

async fn run(path: &Path, config: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let workflow = Workflow::from_file(path).await?;
    let config = match config {
        Some(path) => EngineConfig::from_file(path).await?,
        None => EngineConfig::default(),
    };
    let store: Arc<dyn TaskStore> = match data_dir {
        Some(dir) => Arc::new(FileTaskStore::new(dir).await?),
        None => Arc::new(InMemoryTaskStore::new()),
    };
    let context = ExecutionContext {
        values: workflow.context.clone(),
        ..ExecutionContext::default()
    };
    let engine = Engine::with_components(
        config,
        store,
        DecomposerRegistry::with_builtins(),
        context,
    )?;
    for executor in &workflow.executors {
        engine.register_executor(executor.build(), Liveness::Local);
    }

    let id = engine
        .submit_task(workflow.task.clone(), workflow.constraints.clone())
        .await?;
    info!(task_id = %id, "Waiting for workflow");
    let root = engine.wait_for(id).await?;
    let metrics = engine.monitor().metrics().await;
    let executors = engine.executors().list();
    engine.shutdown().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "task_id": root.id,
            "status": root.status,
            "result": root.result,
            "metrics": metrics,
            "executors": executors,
        }))?
    );
    if root.status != TaskStatus::Completed {
        anyhow::bail!("Workflow ended {}", root.status);
    }
    Ok(())
}

async fn validate(path: &Path) -> anyhow::Result<()> {
    let workflow = Workflow::from_file(path).await?;
    let root = Task::from_description(workflow.task, workflow.constraints);
    if !root.kind.is_composite() {
        println!("{} is atomic; nothing to decompose", root.name);
        return Ok(());
    }

    let context = ExecutionContext {
        root_id: Some(root.id),
        values: workflow.context,
        ..ExecutionContext::default()
    };
    let decomposition = DecomposerRegistry::with_builtins()
        .decompose(&root, &context)
        .await
        .context("Decomposition failed")?;
    let expansion = materialize(&root, decomposition, &mut 0).context("Invalid graph")?;

    let mut graph = TaskGraph::new(root.id);
    for node in expansion.nodes {
        graph.add_node(node);
    }
    for edge in expansion.edges {
        graph.add_edge(edge);
    }
    let name_of = |id: &TaskId| {
        graph
            .nodes
            .get(id)
            .map_or_else(|| id.to_string(), |n| n.name.clone())
    };
    let order: Vec<String> = graph.topological_order()?.iter().map(name_of).collect();
    let (path, length_ms) = graph.critical_path()?;
    let critical: Vec<String> = path.iter().map(name_of).collect();

    println!("{} decomposes by {} into {} subtasks", root.name, expansion.method, graph.len());
    println!("  order:         {}", order.join(" -> "));
    println!("  critical path: {} ({length_ms} ms estimated)", critical.join(" -> "));
    for subtask in expansion.subtasks.iter().filter(|t| t.kind.is_composite()) {
        println!("  {} is {}; decomposed when it becomes ready", subtask.name, subtask.kind);
    }
    Ok(())
}

async fn inspect(task_id: TaskId, data_dir: PathBuf) -> anyhow::Result<()> {
    let store = FileTaskStore::new(data_dir).await?;
    let task = store
        .get_task(task_id)
        .await?
        .with_context(|| format!("Task {task_id} not found"))?;
    let log = store.read_log(task_id).await?;
    let graph = if task.parent_id.is_none() {
        store.get_graph(task_id).await?
    } else {
        None
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "task": task,
            "log": log,
            "graph": graph,
        }))?
    );
    Ok(())
}

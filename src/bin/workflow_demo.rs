//! Workflow Demo
//!
//! Runs a small workflow through the superstep engine and prints every
//! event as it happens:
//!
//! ```text
//! echo ──▶ upper ──┬──▶ logger
//!                  └──▶ counter
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Default input
//! cargo run --bin workflow-demo
//!
//! # Several inputs, checkpoints written to ./checkpoints (zstd-compressed)
//! cargo run --bin workflow-demo -- --input hello --input world --checkpoint-dir ./checkpoints --compress
//!
//! # Print the graph as Mermaid and exit
//! cargo run --bin workflow-demo -- --mermaid
//! ```
//!
//! `RUST_LOG` controls engine logging, `WORKFLOW_*` variables the runner
//! configuration. Both may come from a `.env` file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use deepagents_workflow::{
    CheckpointCodec, CheckpointManager, Executor, ExecutorError, ExecutorId, FileCheckpointStore,
    FunctionExecutor, Message, MessageType, Run, RunOptions, RunnerConfig, Workflow,
    WorkflowBuilder, WorkflowContext, WorkflowEvent,
};

/// Workflow engine demo CLI
#[derive(Parser, Debug)]
#[command(name = "workflow-demo")]
#[command(about = "Runs the echo/upper/logger/counter workflow and prints its events")]
#[command(version)]
struct Args {
    /// Text sent to the workflow (repeat for several runs of the same workflow)
    #[arg(short, long, default_value = "hi")]
    input: Vec<String>,

    /// Directory for checkpoint files
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Compress checkpoints with zstd
    #[arg(long, requires = "checkpoint_dir")]
    compress: bool,

    /// Print the workflow as a Mermaid flowchart and exit
    #[arg(long)]
    mermaid: bool,
}

// =============================================================================
// Executors
// =============================================================================

/// Counts characters across every message it sees
struct CharCounter {
    id: ExecutorId,
    total: AtomicU64,
}

#[async_trait]
impl Executor for CharCounter {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![MessageType::of::<String>()]
    }

    async fn handle(&self, message: Message, ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
        let text: String = message.decode()?;
        let count = text.chars().count() as u64;
        let total = self.total.fetch_add(count, Ordering::SeqCst) + count;
        ctx.queue_shared_state_update("workflow", "characters", total)?;
        Ok(Some(Message::new(&total)?))
    }

    async fn snapshot(&self) -> Result<Option<Value>, ExecutorError> {
        Ok(Some(Value::from(self.total.load(Ordering::SeqCst))))
    }

    async fn restore(&self, state: Value) -> Result<(), ExecutorError> {
        let total = state
            .as_u64()
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("bad counter state: {}", state)))?;
        self.total.store(total, Ordering::SeqCst);
        Ok(())
    }
}

fn build_workflow() -> anyhow::Result<Workflow> {
    let workflow = WorkflowBuilder::new("echo")
        .name("shout")
        .add_executor(FunctionExecutor::new("echo", |s: String| async move { Ok(s) }))
        .add_executor(FunctionExecutor::new("upper", |s: String| async move {
            Ok(s.to_uppercase())
        }))
        .add_executor(FunctionExecutor::new("logger", |s: String| async move {
            tracing::info!(text = %s, "logger received message");
            Ok(format!("logged: {}", s))
        }))
        .add_executor(CharCounter {
            id: ExecutorId::new("counter"),
            total: AtomicU64::new(0),
        })
        .add_edge("echo", "upper")
        .add_fan_out_edge("upper", ["logger", "counter"])
        .with_output_from(["logger", "counter"])
        .build()?;
    Ok(workflow)
}

// =============================================================================
// Output Formatting
// =============================================================================

fn print_header(workflow: &Workflow, args: &Args) {
    let separator = "━".repeat(60);

    println!();
    println!("{}", separator.cyan());
    println!("{}", format!("Workflow Demo: {}", workflow.name()).cyan().bold());
    println!("{}", separator.cyan());
    println!();
    println!("{}", "Configuration:".white().bold());
    println!("   Inputs: {}", args.input.join(", ").green());
    match &args.checkpoint_dir {
        Some(dir) => println!(
            "   Checkpoints: {} ({})",
            dir.display().to_string().green(),
            if args.compress { "zstd" } else { "json" }
        ),
        None => println!("   Checkpoints: {}", "disabled".yellow()),
    }
    println!();
}

fn print_event(event: &WorkflowEvent) {
    let line = event.to_string();
    let colored = match event {
        WorkflowEvent::ExecutorInvoked { .. } => line.blue(),
        WorkflowEvent::ExecutorCompleted { .. } => line.green(),
        WorkflowEvent::ExecutorFailed { .. } => line.red().bold(),
        WorkflowEvent::RequestInfo(_) => line.yellow(),
        WorkflowEvent::WorkflowOutput { .. } => line.magenta().bold(),
        WorkflowEvent::Custom { .. } => line.white(),
    };
    println!("   {}", colored);
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let workflow = build_workflow().context("failed to build workflow")?;

    if args.mermaid {
        println!("{}", workflow.to_mermaid());
        return Ok(());
    }

    print_header(&workflow, &args);

    let config = RunnerConfig::from_env().context("invalid WORKFLOW_* configuration")?;
    let mut options = RunOptions::new().with_config(config);
    if let Some(dir) = &args.checkpoint_dir {
        let codec = CheckpointCodec::new().with_compression(args.compress).with_pretty(true);
        let manager = CheckpointManager::new(Arc::new(FileCheckpointStore::new(dir))).with_codec(codec);
        options = options.with_checkpoints(manager);
    }

    let mut inputs = args.input.iter();
    let first = inputs.next().context("at least one input is required")?;

    let mut run = Run::start(&workflow, first, options).await?;
    println!("{} {}", "Run".white().bold(), run.run_id().cyan());
    for event in run.new_events() {
        print_event(&event);
    }

    for input in inputs {
        println!();
        println!("{} {}", "Input".white().bold(), input.green());
        run.send_message(input).await?;
        for event in run.new_events() {
            print_event(&event);
        }
    }

    println!();
    println!("{} {}", "Status:".white().bold(), run.status().to_string().cyan());
    println!("{} {}", "Supersteps:".white().bold(), run.superstep());
    if !run.checkpoints().is_empty() {
        let ids: Vec<String> = run.checkpoints().iter().map(|info| info.checkpoint_id()).collect();
        println!("{} {}", "Checkpoints:".white().bold(), ids.join(", "));
    }

    let outcome = run.outcome();
    run.dispose().await?;
    match outcome {
        Ok(status) => {
            println!("{} {}", "Outcome:".white().bold(), format!("ok ({})", status).green());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "Outcome:".white().bold(), e.to_string().red());
            Err(e.into())
        }
    }
}

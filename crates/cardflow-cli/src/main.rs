//! CLI binary for running and validating card graphs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing_subscriber::EnvFilter;

use cardflow_engine::{
    default_registry, validate, validate_or_raise, CardExecutor, CardGraph, ExecutorConfig,
    RunEvent, RunRequest, RunStatus, Severity,
};
use cardflow_types::{CardId, ExecutionMode};

#[derive(Parser)]
#[command(name = "cardflow", version, about = "Graph-based card step executor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a card graph from a .json file
    Run {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Card to start from (default: lowest card id)
        #[arg(short, long)]
        start: Option<i64>,

        /// Executor configuration file (.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Retries allowed per card before it is routed as a failure
        #[arg(long)]
        max_retries: Option<u32>,

        /// Default wait between retries, in milliseconds
        #[arg(long)]
        retry_interval_ms: Option<u64>,

        /// Refuse to run a graph with validation errors
        #[arg(long)]
        strict: bool,

        /// Deliver input in background mode
        #[arg(long)]
        background: bool,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a card graph
    Validate {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Also check reachability from this card
        #[arg(short, long)]
        start: Option<i64>,
    },

    /// Show information about a card graph
    Info {
        /// Path to the graph .json file
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            graph,
            start,
            config,
            max_retries,
            retry_interval_ms,
            strict,
            background,
            json,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if max_retries.is_some() {
                cfg.max_retries = max_retries;
            }
            if let Some(ms) = retry_interval_ms {
                cfg.default_retry_interval_ms = ms;
            }
            let mode = if background {
                ExecutionMode::Background
            } else {
                ExecutionMode::Foreground
            };
            cmd_run(&graph, start, cfg, strict, mode, json).await?;
        }
        Commands::Validate { graph, start } => {
            cmd_validate(&graph, start)?;
        }
        Commands::Info { graph } => {
            cmd_info(&graph)?;
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<CardGraph> {
    Ok(CardGraph::load(path)?)
}

/// File values first, defaults for anything the file leaves out.
fn load_config(path: Option<&Path>) -> anyhow::Result<ExecutorConfig> {
    match path {
        Some(p) => {
            let source = std::fs::read_to_string(p)?;
            Ok(ExecutorConfig::from_json(&source)?)
        }
        None => Ok(ExecutorConfig::default()),
    }
}

fn default_start(graph: &CardGraph) -> anyhow::Result<CardId> {
    graph
        .all_cards()
        .first()
        .map(|c| c.id)
        .ok_or_else(|| anyhow::anyhow!("Graph '{}' has no cards", graph.name))
}

fn cmd_validate(path: &Path, start: Option<i64>) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let registry = default_registry();
    let diagnostics = validate(&graph, Some(&registry), start.map(CardId));

    if diagnostics.is_empty() {
        println!("Graph is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path)?;

    println!("Graph: {}", graph.name);
    println!("Cards: {}", graph.card_count());
    println!("Connections: {}", graph.connections().len());

    println!("\nCards:");
    for card in graph.all_cards() {
        let policy = &card.on_failure;
        let jump = policy
            .jump_target
            .map(|t| format!(" -> {t}"))
            .unwrap_or_default();
        println!(
            "  {} [{}] on_failure={}{}",
            card.id, card.task_type, policy.action, jump
        );
    }

    println!("\nConnections:");
    for conn in graph.connections() {
        println!("  {} -> {} ({:?})", conn.start, conn.end, conn.kind);
    }

    Ok(())
}

async fn cmd_run(
    path: &Path,
    start: Option<i64>,
    config: ExecutorConfig,
    strict: bool,
    mode: ExecutionMode,
    json: bool,
) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let start = match start {
        Some(id) => CardId(id),
        None => default_start(&graph)?,
    };

    let executor = CardExecutor::with_default_registry().with_config(config);
    if strict {
        if let Err(e) = validate_or_raise(&graph, Some(executor.registry()), Some(start)) {
            if !e.is_configuration() {
                return Err(e.into());
            }
            eprintln!("Refusing to run graph '{}': {e}", graph.name);
            std::process::exit(2);
        }
    }

    println!("Running graph: {} (start card {start})", graph.name);

    let events = executor.subscribe();
    tokio::spawn(print_progress(events));

    let handle = executor.spawn(Arc::new(graph), RunRequest::new(start).with_mode(mode));
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping run");
            cancel.cancel();
        }
    });

    let result = handle.join().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\nRun {}: {:?}", result.run_id, result.status);
        println!("{}", result.message);
        println!("Cards executed: {}", result.executed.len());
    }

    if result.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn progress_line(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::CardExecuting { card_id, task_type, .. } => {
            Some(format!("  -> card {card_id} [{task_type}]"))
        }
        RunEvent::CardRetrying { card_id, attempt, .. } => {
            Some(format!("  .. card {card_id} retry #{attempt}"))
        }
        RunEvent::StepDetail { text, .. } => Some(format!("     {text}")),
        RunEvent::Error { message, .. } => Some(format!("  !! {message}")),
        _ => None,
    }
}

/// Print run progress until the executor goes away. Returns the number of
/// lines printed.
async fn print_progress(mut events: Receiver<RunEvent>) -> usize {
    let mut printed = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress output fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Some(line) = progress_line(&event) {
            println!("{line}");
            printed += 1;
        }
    }
    printed
}

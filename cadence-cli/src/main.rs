//! Cadence CLI: drive the training loop from the terminal.
//!
//! Runs a synthetic demo through the full observer stack, sweeps learning
//! rates, prints schedule curves and inspects checkpoint manifests.

mod commands;
mod demo;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Cadence: a phase-driven training loop with pluggable observers
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.cadence/config.toml` and default run dirs)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a configuration value, e.g. `--set run.epochs=3`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the synthetic softmax-regression demo with every observer attached
    Train {
        /// Run the model in binary16 with an fp32 master copy
        #[arg(long)]
        fp16: bool,
        /// Number of epochs (overrides `run.epochs`)
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Run directory for checkpoints and scalar logs
        #[arg(long)]
        logdir: Option<PathBuf>,
        /// Checkpoint file to resume from
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Learning-rate policy
        #[arg(long, value_enum, default_value_t = LrPolicy::OneCycle)]
        schedule: LrPolicy,
        /// Single-epoch debug run
        #[arg(long)]
        debug: bool,
    },
    /// Evaluate a checkpoint on the demo loaders without updating weights
    Eval {
        /// Checkpoint file to load
        checkpoint: PathBuf,
    },
    /// Sweep the learning rate geometrically and report the loss per rate
    FindLr {
        /// Batches to sweep over (defaults to one training epoch)
        #[arg(long)]
        steps: Option<usize>,
        #[arg(long)]
        init_lr: Option<f64>,
        #[arg(long)]
        final_lr: Option<f64>,
    },
    /// Print a learning-rate/momentum curve
    Schedule {
        #[command(subcommand)]
        kind: ScheduleKind,
    },
    /// Print the retained-checkpoint manifest of a run directory
    Checkpoints {
        /// Run directory containing `checkpoints.json`
        logdir: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LrPolicy {
    /// Keep the optimizer's base rate
    Constant,
    /// Batch-level one-cycle policy
    OneCycle,
    /// Halve the rate every 3 epochs
    Step,
}

#[derive(clap::Subcommand, Debug)]
enum ScheduleKind {
    /// One-cycle curve over one cycle
    OneCycle {
        /// Batches per epoch
        #[arg(long, default_value = "100")]
        loader_len: usize,
    },
    /// Range-finder sweep
    RangeFinder {
        #[arg(long, default_value = "100")]
        steps: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the merged configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = cadence_core::config::data_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cadence.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides = cli
        .overrides
        .iter()
        .map(|raw| commands::parse_override(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let ctx = commands::Context {
        workspace,
        config_path: cli.config,
        overrides,
    };
    commands::handle_command(cli.command, &ctx)
}

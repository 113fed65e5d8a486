//! fitloop CLI: train an MNIST classifier and inspect saved checkpoints.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// fitloop: a small training harness with best-checkpoint selection
#[derive(Parser, Debug)]
#[command(name = "fitloop", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory (holds `.fitloop/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Train a classifier and save the best checkpoint
    Train(TrainArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the metadata and summary of a saved checkpoint
    Inspect {
        /// Checkpoint file written by `fitloop train`
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct TrainArgs {
    /// Output path of the best checkpoint
    #[arg(long)]
    pub model_fn: Option<PathBuf>,
    /// Directory with the MNIST IDX files
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Fraction of samples used for training, in (0, 1)
    #[arg(long)]
    pub train_ratio: Option<f64>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub n_epochs: Option<usize>,
    /// Number of linear layers in the classifier
    #[arg(long)]
    pub n_layers: Option<usize>,
    #[arg(long)]
    pub use_dropout: bool,
    #[arg(long)]
    pub dropout_p: Option<f32>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    /// Optimizer: sgd or adam_w
    #[arg(long)]
    pub optimizer: Option<String>,
    /// Report level: 0 silent, 1 per epoch, 2 per batch
    #[arg(long)]
    pub verbosity: Option<u8>,
    /// Seed for the split permutation and batch shuffling
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a default `.fitloop/config.toml`
    Init,
    /// Show the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr output plus JSON file logging
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

    let log_dir = directories::ProjectDirs::from("dev", "fitloop", "fitloop")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fitloop.log");
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
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace)
}

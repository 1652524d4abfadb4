#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mil_train::checkpoint::ArtifactCleaner;
use mil_train::config::{process_config, RunMetadata};
use mil_train::error::RunError;
use mil_train::orchestrator::{BurnEnvironment, Orchestrator};

type TrainBackend = Autodiff<Wgpu<f32, i32>>;

/// Train a multiple-instance classifier on feature bags.
#[derive(Parser)]
#[command(name = "train", about = "Train a MIL classifier on feature bags")]
struct Cli {
    /// Root directory for experiment outputs
    #[arg(short = 'o', long = "output-dir")]
    output_dir: PathBuf,

    /// Experiment name
    #[arg(long)]
    name: String,

    /// Cross-validation fold
    #[arg(long)]
    fold: usize,

    /// Path to TOML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Accelerators per node
    #[arg(long = "num-gpus-per-node", default_value_t = 1)]
    num_gpus: usize,

    /// Number of nodes
    #[arg(long, default_value_t = 1)]
    num_nodes: usize,

    /// Run index; offsets the seed and selects the version directory
    #[arg(long, allow_negative_numbers = true)]
    run: Option<i64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(run) = cli.run {
        if run < 0 {
            bail!("run number must be >= 0, got {run}");
        }
    }

    let meta = RunMetadata {
        name: cli.name.clone(),
        output_dir: cli.output_dir.clone(),
        fold: cli.fold,
        create_dirs: true,
        copy_config: true,
        version: cli.run.map(|r| r as usize),
    };
    let config = process_config(&cli.config, &meta)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    info!(
        name = %cli.name,
        fold = cli.fold,
        checkpoint_dir = %config.callbacks.checkpoint_dir.display(),
        "Fitting model on datamodule."
    );

    let env = BurnEnvironment::<TrainBackend>::new(WgpuDevice::default())
        .with_topology(cli.num_gpus, cli.num_nodes);
    let mut orchestrator = Orchestrator::new(&config, env, ArtifactCleaner::new())
        .with_indices(Some(cli.fold), cli.run);

    match orchestrator.run() {
        Ok(report) => {
            info!(
                seed = report.seed,
                attempts = report.attempts,
                val_loss = report.validation.loss,
                val_accuracy = report.validation.accuracy,
                final_checkpoint = %report.final_checkpoint.display(),
                "done"
            );
            Ok(())
        }
        Err(err @ RunError::TrainingExhausted { .. }) => Err(err).context("giving up on this run"),
        Err(err) => Err(err).context("training run failed"),
    }
}

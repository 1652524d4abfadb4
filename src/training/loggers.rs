use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::FitError;

/// Destination for per-epoch scalars.
pub trait MetricLogger {
    fn log_hyperparams(&mut self, _hyperparameters: &serde_json::Value) -> Result<(), FitError> {
        Ok(())
    }

    fn log_metrics(&mut self, epoch: usize, step: usize, metrics: &[(String, f64)]) -> Result<(), FitError>;

    fn finalize(&mut self) -> Result<(), FitError> {
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct MetricRow<'a> {
    epoch: usize,
    step: usize,
    metric: &'a str,
    value: f64,
}

/// Appends `epoch,step,metric,value` rows to `{log_dir}/metrics.csv` and
/// writes the hyperparameters to `{log_dir}/hparams.json`.
pub struct CsvLogger {
    log_dir: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvLogger {
    pub const METRICS_FILE: &'static str = "metrics.csv";
    pub const HPARAMS_FILE: &'static str = "hparams.json";

    pub fn new(log_dir: &Path) -> Result<Self, FitError> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(Self::METRICS_FILE);
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(["epoch", "step", "metric", "value"])?;
            writer.flush()?;
        }
        Ok(CsvLogger {
            log_dir: log_dir.to_path_buf(),
            writer,
        })
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.log_dir.join(Self::METRICS_FILE)
    }
}

impl MetricLogger for CsvLogger {
    fn log_hyperparams(&mut self, hyperparameters: &serde_json::Value) -> Result<(), FitError> {
        let body = serde_json::to_vec_pretty(hyperparameters)?;
        fs::write(self.log_dir.join(Self::HPARAMS_FILE), body)?;
        Ok(())
    }

    fn log_metrics(&mut self, epoch: usize, step: usize, metrics: &[(String, f64)]) -> Result<(), FitError> {
        for (metric, value) in metrics {
            self.writer.serialize(MetricRow {
                epoch,
                step,
                metric,
                value: *value,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), FitError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits each epoch's scalars as one `info!` event.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl MetricLogger for TracingLogger {
    fn log_metrics(&mut self, epoch: usize, step: usize, metrics: &[(String, f64)]) -> Result<(), FitError> {
        let summary = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(epoch, step, "{summary}");
        Ok(())
    }
}

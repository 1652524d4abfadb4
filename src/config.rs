use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::networks::{
    AdmilConfig, ClamConfig, CsmilConfig, DsmilConfig, DtfdConfig, MamilConfig, MilConfig,
    MinetConfig, MmilConfig, TransMilConfig,
};
use crate::models::{MultiresConfig, WeightInit};
use crate::training::callbacks::{Monitor, MonitorMode};

/// Fully resolved settings for one training run, loadable from TOML.
///
/// Built once by [`process_config`] and passed by reference afterwards; the
/// orchestrator keeps the seed offset separately instead of mutating it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub multires_aggregation: MultiresConfig,
    pub trainer: TrainerConfig,
    pub callbacks: CallbacksConfig,
    pub loggers: LoggersConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            seed: 42,
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            multires_aggregation: MultiresConfig::default(),
            trainer: TrainerConfig::default(),
            callbacks: CallbacksConfig::default(),
            loggers: LoggersConfig::default(),
        }
    }
}

/// Where the feature bags live and how to read them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub train_folder: PathBuf,
    pub val_folder: PathBuf,
    /// Feature columns read from every bag, one per resolution.
    pub data_cols: Vec<String>,
    /// Subtracted from every stored label.
    pub base_label: i64,
    pub num_classes: usize,
    /// Width of each instance feature vector.
    pub feature_size: usize,
    /// Metadata key (or `"label"`) used for inverse-frequency weighted sampling.
    pub sampling_key: Option<String>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            train_folder: PathBuf::from("data/train"),
            val_folder: PathBuf::from("data/val"),
            data_cols: vec!["features".to_string()],
            base_label: 0,
            num_classes: 2,
            feature_size: 1024,
            sampling_key: None,
        }
    }
}

/// Model family selection plus one parameter block per family.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub classifier: String,
    /// Root of a previous experiment to load pretrained weights from.
    pub checkpoint: Option<PathBuf>,
    pub initializer: Option<WeightInit>,
    pub compile: bool,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub clam: ClamConfig,
    pub transmil: TransMilConfig,
    pub admil: AdmilConfig,
    pub dsmil: DsmilConfig,
    pub mil: MilConfig,
    pub mamil: MamilConfig,
    pub minet: MinetConfig,
    pub dtfd: DtfdConfig,
    pub csmil: CsmilConfig,
    pub mmil: MmilConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            classifier: "admil".to_string(),
            checkpoint: None,
            initializer: None,
            compile: false,
            learning_rate: 2e-4,
            weight_decay: 1e-5,
            clam: ClamConfig::default(),
            transmil: TransMilConfig::default(),
            admil: AdmilConfig::default(),
            dsmil: DsmilConfig::default(),
            mil: MilConfig::default(),
            mamil: MamilConfig::default(),
            minet: MinetConfig::default(),
            dtfd: DtfdConfig::default(),
            csmil: CsmilConfig::default(),
            mmil: MmilConfig::default(),
        }
    }
}

/// Run-level trainer settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub precision: String,
    pub accumulate_grad_batches: usize,
    pub check_val_every_n_epoch: usize,
    /// 0 keeps the loaders built at attempt start for the whole run.
    pub reload_dataloaders_every_n_epochs: usize,
    pub max_attempts: usize,
    /// Resume from the trainer's `final.ckpt` in the checkpoint directory.
    pub resume: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            epochs: 50,
            batch_size: 1,
            num_workers: 4,
            shuffle: true,
            precision: "32".to_string(),
            accumulate_grad_batches: 1,
            check_val_every_n_epoch: 1,
            reload_dataloaders_every_n_epochs: 0,
            max_attempts: 1,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CallbacksConfig {
    /// Filled in by [`process_config`].
    pub checkpoint_dir: PathBuf,
    pub monitor: Monitor,
    pub mode: MonitorMode,
    pub save_last: bool,
    pub early_stopping_patience: Option<usize>,
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        CallbacksConfig {
            checkpoint_dir: PathBuf::from("checkpoints"),
            monitor: Monitor::ValLoss,
            mode: MonitorMode::Min,
            save_last: true,
            early_stopping_patience: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggersConfig {
    pub csv: bool,
    pub tracing: bool,
    /// Filled in by [`process_config`].
    pub log_dir: PathBuf,
}

impl Default for LoggersConfig {
    fn default() -> Self {
        LoggersConfig {
            csv: true,
            tracing: true,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl RunConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: RunConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// The classifier identifier is not checked here; the model factory owns
    /// that decision.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.data_cols.is_empty() {
            return Err(ConfigError::Validation(
                "dataset.data_cols must not be empty".into(),
            ));
        }
        if self.dataset.num_classes < 2 {
            return Err(ConfigError::Validation(
                "dataset.num_classes must be >= 2".into(),
            ));
        }
        if self.dataset.feature_size == 0 {
            return Err(ConfigError::Validation(
                "dataset.feature_size must be > 0".into(),
            ));
        }

        if self.model.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(
                "model.learning_rate must be > 0".into(),
            ));
        }
        if self.model.weight_decay < 0.0 {
            return Err(ConfigError::Validation(
                "model.weight_decay must be >= 0".into(),
            ));
        }

        if let Some(features) = &self.multires_aggregation.features {
            for feature in features {
                if !self.dataset.data_cols.contains(feature) {
                    return Err(ConfigError::Validation(format!(
                        "multires_aggregation.features entry '{feature}' is not in dataset.data_cols"
                    )));
                }
            }
        }

        if self.trainer.epochs == 0 {
            return Err(ConfigError::Validation("trainer.epochs must be > 0".into()));
        }
        if self.trainer.batch_size == 0 {
            return Err(ConfigError::Validation(
                "trainer.batch_size must be > 0".into(),
            ));
        }
        if self.trainer.accumulate_grad_batches == 0 {
            return Err(ConfigError::Validation(
                "trainer.accumulate_grad_batches must be > 0".into(),
            ));
        }
        if self.trainer.check_val_every_n_epoch == 0 {
            return Err(ConfigError::Validation(
                "trainer.check_val_every_n_epoch must be > 0".into(),
            ));
        }
        if self.trainer.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "trainer.max_attempts must be >= 1".into(),
            ));
        }
        if !matches!(self.trainer.precision.as_str(), "32" | "32-true") {
            return Err(ConfigError::Validation(format!(
                "trainer.precision '{}' is not supported (expected '32' or '32-true')",
                self.trainer.precision
            )));
        }

        if self.callbacks.early_stopping_patience == Some(0) {
            return Err(ConfigError::Validation(
                "callbacks.early_stopping_patience must be >= 1".into(),
            ));
        }

        self.model.clam.validate()?;
        self.model.transmil.validate()?;
        self.model.admil.validate()?;
        self.model.mil.validate()?;
        self.model.minet.validate()?;
        self.model.dtfd.validate()?;
        self.model.csmil.validate()?;
        self.model.mmil.validate()?;

        Ok(())
    }

    /// Generate a TOML string with all default values.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&RunConfig::default()).expect("default config serializes")
    }
}

/// Run metadata handed to [`process_config`] alongside the config path.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub name: String,
    pub output_dir: PathBuf,
    pub fold: usize,
    pub create_dirs: bool,
    pub copy_config: bool,
    /// Run index; `None` picks the next unused `version_N`.
    pub version: Option<usize>,
}

impl RunMetadata {
    /// `{output_dir}/{name}/{fold}_fold`.
    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir
            .join(&self.name)
            .join(format!("{}_fold", self.fold))
    }
}

/// Load, validate and resolve the configuration for one run.
///
/// Resolves `callbacks.checkpoint_dir` to
/// `{experiment}/checkpoints/version_{v}` and `loggers.log_dir` to
/// `{experiment}/logs/version_{v}`.
pub fn process_config(path: &Path, meta: &RunMetadata) -> Result<RunConfig, ConfigError> {
    let mut config = RunConfig::load(path)?;

    let experiment_dir = meta.experiment_dir();
    let version = match meta.version {
        Some(v) => v,
        None => next_version(&experiment_dir.join("checkpoints")),
    };
    let version_name = format!("version_{version}");
    config.callbacks.checkpoint_dir = experiment_dir.join("checkpoints").join(&version_name);
    config.loggers.log_dir = experiment_dir.join("logs").join(&version_name);

    if meta.create_dirs {
        for dir in [&config.callbacks.checkpoint_dir, &config.loggers.log_dir] {
            fs::create_dir_all(dir).map_err(|e| ConfigError::RunDir {
                path: dir.clone(),
                source: e,
            })?;
        }
    }

    if meta.copy_config {
        fs::create_dir_all(&experiment_dir).map_err(|e| ConfigError::RunDir {
            path: experiment_dir.clone(),
            source: e,
        })?;
        let target = experiment_dir.join("config.toml");
        fs::copy(path, &target).map_err(|e| ConfigError::RunDir {
            path: target,
            source: e,
        })?;
    }

    Ok(config)
}

/// Next unused `version_N` index under a checkpoints directory.
fn next_version(checkpoints_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(checkpoints_dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("version_"))
                .and_then(|n| n.parse::<usize>().ok())
        })
        .max()
        .map_or(0, |v| v + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("run.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{body}").unwrap();
        path
    }

    fn meta(output_dir: &Path, version: Option<usize>) -> RunMetadata {
        RunMetadata {
            name: "exp".to_string(),
            output_dir: output_dir.to_path_buf(),
            fold: 2,
            create_dirs: true,
            copy_config: true,
            version,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
seed = 7

[model]
classifier = "clam"

[model.clam]
gated = false
"#;
        let config: RunConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.model.classifier, "clam");
        assert!(!config.model.clam.gated);
        assert_eq!(config.trainer.max_attempts, 1);
        assert!(config.model.checkpoint.is_none());
        assert!(config.multires_aggregation.features.is_none());
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = RunConfig::default_toml();
        let config: RunConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }

    #[test]
    fn test_validation_rejects_zero_epochs() {
        let mut config = RunConfig::default();
        config.trainer.epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = RunConfig::default();
        config.trainer.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_half_precision() {
        let mut config = RunConfig::default();
        config.trainer.precision = "16-mixed".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_multires_column() {
        let mut config = RunConfig::default();
        config.multires_aggregation.features = Some(vec!["features_context".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_single_class() {
        let mut config = RunConfig::default();
        config.dataset.num_classes = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_classifier_passes_validation() {
        let mut config = RunConfig::default();
        config.model.classifier = "not-a-real-model".to_string();
        config.validate().expect("classifier is resolved by the factory");
    }

    #[test]
    fn test_process_config_resolves_run_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "seed = 3");
        let config = process_config(&path, &meta(dir.path(), Some(4))).unwrap();

        let experiment = dir.path().join("exp").join("2_fold");
        assert_eq!(
            config.callbacks.checkpoint_dir,
            experiment.join("checkpoints").join("version_4")
        );
        assert_eq!(config.loggers.log_dir, experiment.join("logs").join("version_4"));
        assert!(config.callbacks.checkpoint_dir.is_dir());
        assert!(config.loggers.log_dir.is_dir());
        assert!(experiment.join("config.toml").exists());
    }

    #[test]
    fn test_process_config_picks_next_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "");
        let checkpoints = dir.path().join("exp").join("2_fold").join("checkpoints");
        fs::create_dir_all(checkpoints.join("version_0")).unwrap();
        fs::create_dir_all(checkpoints.join("version_3")).unwrap();
        fs::create_dir_all(checkpoints.join("version_x")).unwrap();

        let config = process_config(&path, &meta(dir.path(), None)).unwrap();
        assert!(config.callbacks.checkpoint_dir.ends_with("version_4"));
    }

    #[test]
    fn test_process_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = process_config(&dir.path().join("missing.toml"), &meta(dir.path(), Some(0)))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs").join("admil.toml");
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.model.classifier, "admil");
        assert_eq!(config.model.admil.k, 1);
        assert_eq!(config.trainer.max_attempts, 3);
        assert_eq!(config.dataset.sampling_key.as_deref(), Some("label"));
    }
}

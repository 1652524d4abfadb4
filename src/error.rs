use std::path::PathBuf;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("failed to prepare run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint file not found: {0}")]
    NotFound(PathBuf),

    #[error("{path} is not a checkpoint file (bad magic)")]
    BadMagic { path: PathBuf },

    #[error("checkpoint {path} is truncated")]
    Truncated { path: PathBuf },

    #[error("failed to parse checkpoint header from {path}: {source}")]
    HeaderParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode model weights: {0}")]
    RecordEncode(String),

    #[error("failed to decode model weights: {0}")]
    RecordDecode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while resolving and constructing a model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown classifier '{0}'")]
    UnknownFamily(String),

    #[error("fold and run number must be provided for checkpoint loading (fold: {fold:?}, run: {run:?})")]
    MissingCheckpointIndices {
        fold: Option<usize>,
        run: Option<usize>,
    },

    #[error("checkpoint {path} holds a '{found}' model, expected '{expected}'")]
    FamilyMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl ModelError {
    /// Whether this error is a configuration problem rather than an I/O one.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ModelError::UnknownFamily(_) | ModelError::MissingCheckpointIndices { .. }
        )
    }
}

/// Errors raised by the bag dataset and loaders.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("dataset folder not found: {0}")]
    FolderNotFound(PathBuf),

    #[error("dataset folder {0} contains no bag files")]
    Empty(PathBuf),

    #[error("failed to read bag {path}: {source}")]
    BagRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse bag {path}: {source}")]
    BagParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("bag {path} has no column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("bag {path} is empty or ragged in column '{column}'")]
    MalformedColumn { path: PathBuf, column: String },

    #[error("bag {path} has label {label} below base label {base}")]
    LabelBelowBase { path: PathBuf, label: i64, base: i64 },

    #[error("bag {path} has label {label}, outside 0..{num_classes}")]
    LabelOutOfRange {
        path: PathBuf,
        label: usize,
        num_classes: usize,
    },

    #[error("bag {path} column '{column}' has width {found}, expected {expected}")]
    FeatureWidth {
        path: PathBuf,
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("bag {path} columns disagree on the number of instances")]
    MisalignedColumns { path: PathBuf },

    #[error("bag {path} has no value for sampling key '{key}'")]
    MissingSamplingKey { path: PathBuf, key: String },

    #[error("failed to start the bag reader pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors surfaced by a trainer's `fit`, `validate` or `save_checkpoint`.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("runtime failure: {0}")]
    Runtime(String),

    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { loss: f32, epoch: usize, step: usize },

    #[error("panic during training: {0}")]
    Panicked(String),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("metric logger error: {0}")]
    Logger(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize hyperparameters: {0}")]
    Hyperparameters(#[from] serde_json::Error),
}

impl FitError {
    /// Runtime failures are transient and worth another attempt; data and
    /// checkpoint problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FitError::Runtime(_) | FitError::NonFiniteLoss { .. } | FitError::Panicked(_)
        )
    }
}

/// Errors that terminate a training run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("training error: {0}")]
    Fit(#[from] FitError),

    #[error("training failed too many times ({attempts} attempts)")]
    TrainingExhausted { attempts: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_family_display() {
        let err = ModelError::UnknownFamily("not-a-real-model".to_string());
        assert_eq!(err.to_string(), "unknown classifier 'not-a-real-model'");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_checkpoint_model_error_is_not_configuration() {
        let err = ModelError::from(CheckpointError::NotFound(PathBuf::from("final.ckpt")));
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("trainer.epochs must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: trainer.epochs must be > 0"
        );
    }

    #[test]
    fn test_fit_error_retryable_classes() {
        assert!(FitError::Runtime("cuda busy".into()).is_retryable());
        assert!(FitError::NonFiniteLoss {
            loss: f32::NAN,
            epoch: 0,
            step: 3
        }
        .is_retryable());
        assert!(FitError::Panicked("index out of bounds".into()).is_retryable());
        assert!(!FitError::Data(DataError::Empty(PathBuf::from("train"))).is_retryable());
        assert!(!FitError::Checkpoint(CheckpointError::NotFound(PathBuf::from("x"))).is_retryable());
        assert!(!FitError::Io(std::io::Error::other("disk full")).is_retryable());
    }

    #[test]
    fn test_exhausted_display() {
        let err = RunError::TrainingExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "training failed too many times (3 attempts)");
    }
}

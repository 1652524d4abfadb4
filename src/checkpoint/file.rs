use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use burn::tensor::backend::AutodiffBackend;
use tracing::warn;

use crate::error::CheckpointError;
use crate::models::TrainableModel;

/// First bytes of every `.ckpt` file.
pub const CHECKPOINT_MAGIC: &[u8; 8] = b"MILCKPT1";

const PREAMBLE_LEN: usize = CHECKPOINT_MAGIC.len() + 8;

/// Training progress stored alongside the weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrainingProgress {
    /// Epochs completed.
    pub epoch: usize,
    pub global_step: usize,
    /// Best monitored validation score so far.
    pub best_score: Option<f64>,
}

/// JSON header of a checkpoint file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointHeader {
    /// Model family identifier.
    pub family: String,
    #[serde(flatten)]
    pub progress: TrainingProgress,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    pub hyperparameters: serde_json::Value,
    /// Length of the optimizer section at the end of the file. Zero when
    /// the file holds weights only.
    #[serde(default)]
    pub optimizer_len: u64,
}

impl CheckpointHeader {
    pub fn new(family: &str, progress: TrainingProgress, hyperparameters: serde_json::Value) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        CheckpointHeader {
            family: family.to_string(),
            progress,
            created_at,
            hyperparameters,
            optimizer_len: 0,
        }
    }
}

/// Everything needed to continue training: weights plus optimizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub header: CheckpointHeader,
    pub weights: Vec<u8>,
    /// Empty for weights-only files.
    pub optimizer: Vec<u8>,
}

/// Write a checkpoint: magic, little-endian header length, JSON header, the
/// serialized weights, then the optimizer state (possibly empty).
///
/// The file is written next to its destination and renamed into place, so a
/// crash never leaves a half-written `.ckpt` behind.
pub fn write_checkpoint(
    path: &Path,
    header: &CheckpointHeader,
    weights: &[u8],
    optimizer: &[u8],
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let header = CheckpointHeader {
        optimizer_len: optimizer.len() as u64,
        ..header.clone()
    };
    let header_json = serde_json::to_vec(&header)?;

    let tmp_path = path.with_extension("ckpt.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(CHECKPOINT_MAGIC)?;
        file.write_all(&(header_json.len() as u64).to_le_bytes())?;
        file.write_all(&header_json)?;
        file.write_all(weights)?;
        file.write_all(optimizer)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn split_checkpoint(path: &Path, bytes: &[u8]) -> Result<(CheckpointHeader, usize), CheckpointError> {
    if bytes.len() < CHECKPOINT_MAGIC.len() || &bytes[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
        return Err(CheckpointError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    if bytes.len() < PREAMBLE_LEN {
        return Err(CheckpointError::Truncated {
            path: path.to_path_buf(),
        });
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[CHECKPOINT_MAGIC.len()..PREAMBLE_LEN]);
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let weights_start = PREAMBLE_LEN.saturating_add(header_len);
    if weights_start > bytes.len() {
        return Err(CheckpointError::Truncated {
            path: path.to_path_buf(),
        });
    }

    let header = serde_json::from_slice(&bytes[PREAMBLE_LEN..weights_start]).map_err(|e| {
        CheckpointError::HeaderParse {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    Ok((header, weights_start))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, CheckpointError> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    Ok(fs::read(path)?)
}

/// Read a checkpoint's header, weights and optimizer state.
pub fn read_training_state(path: &Path) -> Result<TrainingState, CheckpointError> {
    let mut bytes = read_bytes(path)?;
    let (header, weights_start) = split_checkpoint(path, &bytes)?;
    let optimizer_len = usize::try_from(header.optimizer_len).unwrap_or(usize::MAX);
    let payload_len = bytes.len() - weights_start;
    if optimizer_len > payload_len {
        return Err(CheckpointError::Truncated {
            path: path.to_path_buf(),
        });
    }
    let optimizer = bytes.split_off(bytes.len() - optimizer_len);
    let weights = bytes.split_off(weights_start);
    Ok(TrainingState {
        header,
        weights,
        optimizer,
    })
}

/// Read a checkpoint's header and weights.
pub fn read_checkpoint(path: &Path) -> Result<(CheckpointHeader, Vec<u8>), CheckpointError> {
    let state = read_training_state(path)?;
    Ok((state.header, state.weights))
}

/// Read only the header of a checkpoint.
pub fn read_header(path: &Path) -> Result<CheckpointHeader, CheckpointError> {
    let bytes = read_bytes(path)?;
    split_checkpoint(path, &bytes).map(|(header, _)| header)
}

/// Snapshot a model's weights together with its optimizer state.
pub fn save_model<B: AutodiffBackend>(
    model: &dyn TrainableModel<B>,
    path: &Path,
    progress: TrainingProgress,
) -> Result<(), CheckpointError> {
    let weights = model.state_dict()?;
    let optimizer = model.optimizer_state()?;
    let header = CheckpointHeader::new(model.family().id(), progress, model.hyperparameters());
    write_checkpoint(path, &header, &weights, &optimizer)
}

/// Load weights from a checkpoint into `model`, returning its header. The
/// optimizer is left untouched.
pub fn load_model<B: AutodiffBackend>(
    model: &mut dyn TrainableModel<B>,
    path: &Path,
) -> Result<CheckpointHeader, CheckpointError> {
    let (header, weights) = read_checkpoint(path)?;
    model.load_state_dict(weights)?;
    Ok(header)
}

/// Restore weights and optimizer state so training continues where the
/// checkpoint left off.
pub fn resume_model<B: AutodiffBackend>(
    model: &mut dyn TrainableModel<B>,
    path: &Path,
) -> Result<CheckpointHeader, CheckpointError> {
    let state = read_training_state(path)?;
    model.load_state_dict(state.weights)?;
    if state.optimizer.is_empty() {
        warn!(path = %path.display(), "checkpoint has no optimizer state, optimizer starts fresh");
    } else {
        model.load_optimizer_state(state.optimizer)?;
    }
    Ok(state.header)
}

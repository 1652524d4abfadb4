mod cleaner;
mod file;

pub use cleaner::{ArtifactCleaner, ArtifactCleanup, ArtifactFs, CleanupOutcome, StdFs};
pub use file::{
    load_model, read_checkpoint, read_header, read_training_state, resume_model, save_model,
    write_checkpoint, CheckpointHeader, TrainingProgress, TrainingState, CHECKPOINT_MAGIC,
};

/// Weights as constructed, written before training starts.
pub const INITIAL_CHECKPOINT: &str = "initial.ckpt";
/// End-of-run snapshot; also the trainer's resumption point.
pub const FINAL_CHECKPOINT: &str = "final.ckpt";
/// Best monitored validation score.
pub const BEST_CHECKPOINT: &str = "best.ckpt";
/// Most recent validation.
pub const LAST_CHECKPOINT: &str = "last.ckpt";

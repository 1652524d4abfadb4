use std::path::{Path, PathBuf};

use tracing::info;

use crate::checkpoint::FINAL_CHECKPOINT;
use crate::error::RunError;
use crate::training::{CheckpointSelector, Trainer, ValidationMetrics};

/// After a successful fit: validate the best checkpoint, then write the
/// end-of-run `final.ckpt`.
#[derive(Debug, Clone)]
pub struct PostRunValidator {
    checkpoint_dir: PathBuf,
    verbose: bool,
}

impl PostRunValidator {
    pub fn new(checkpoint_dir: &Path) -> Self {
        PostRunValidator {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            verbose: true,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn final_checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(FINAL_CHECKPOINT)
    }

    pub fn finish<T: Trainer>(
        &self,
        trainer: &mut T,
        model: &mut T::Model,
        val: &T::Loader,
    ) -> Result<(ValidationMetrics, PathBuf), RunError> {
        let metrics = trainer.validate(model, val, CheckpointSelector::Best, self.verbose)?;
        let path = self.final_checkpoint_path();
        trainer.save_checkpoint(model, &path)?;
        info!(
            path = %path.display(),
            val_loss = metrics.loss,
            val_accuracy = metrics.accuracy,
            "saved final checkpoint"
        );
        Ok((metrics, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CheckpointError, FitError};

    #[derive(Default)]
    struct RecordingTrainer {
        calls: Vec<String>,
    }

    impl Trainer for RecordingTrainer {
        type Model = ();
        type Loader = ();

        fn fit(&mut self, _: &mut (), _: &mut (), _: &mut (), _: Option<&Path>) -> Result<(), FitError> {
            unreachable!("fit is not part of post-run validation")
        }

        fn validate(
            &mut self,
            _: &mut (),
            _: &(),
            selector: CheckpointSelector,
            verbose: bool,
        ) -> Result<ValidationMetrics, FitError> {
            self.calls.push(format!("validate {selector:?} {verbose}"));
            Ok(ValidationMetrics::score(0.3, &[vec![1.0, 0.0]], &[0], 2))
        }

        fn save_checkpoint(&self, _: &(), path: &Path) -> Result<(), CheckpointError> {
            std::fs::write(path, b"final")?;
            Ok(())
        }
    }

    #[test]
    fn test_validates_best_then_saves_final() {
        let dir = tempfile::tempdir().unwrap();
        let validator = PostRunValidator::new(dir.path());
        let mut trainer = RecordingTrainer::default();
        let (metrics, path) = validator.finish(&mut trainer, &mut (), &()).unwrap();
        assert_eq!(trainer.calls, vec!["validate Best true"]);
        assert_eq!(path, dir.path().join(FINAL_CHECKPOINT));
        assert!(path.exists());
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[test]
    fn test_quiet_validation() {
        let dir = tempfile::tempdir().unwrap();
        let validator = PostRunValidator::new(dir.path()).with_verbose(false);
        let mut trainer = RecordingTrainer::default();
        validator.finish(&mut trainer, &mut (), &()).unwrap();
        assert_eq!(trainer.calls, vec!["validate Best false"]);
    }
}

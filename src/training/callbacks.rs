use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use crate::checkpoint::{save_model, TrainingProgress, BEST_CHECKPOINT, LAST_CHECKPOINT};
use crate::error::FitError;
use crate::models::TrainableModel;
use crate::training::metrics::ValidationMetrics;

/// Validation metric a callback watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    #[default]
    ValLoss,
    ValAccuracy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

impl MonitorMode {
    /// Whether `candidate` beats `best`. Non-finite scores never do.
    pub fn is_improvement(self, candidate: f64, best: Option<f64>) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        match (self, best) {
            (_, None) => true,
            (MonitorMode::Min, Some(best)) => candidate < best,
            (MonitorMode::Max, Some(best)) => candidate > best,
        }
    }
}

/// Whether training should go on after a callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook invoked by the trainer around validation.
pub trait Callback<B: AutodiffBackend> {
    /// Called once before the first epoch, with restored progress on resume.
    fn on_fit_start(&mut self, _progress: &TrainingProgress) {}

    fn on_validation_end(
        &mut self,
        model: &dyn TrainableModel<B>,
        progress: &TrainingProgress,
        metrics: &ValidationMetrics,
    ) -> Result<CallbackAction, FitError>;

    /// Best monitored score seen so far, if this callback tracks one.
    fn best_score(&self) -> Option<f64> {
        None
    }
}

/// Writes `best.ckpt` whenever the monitored metric improves and
/// `last.ckpt` after every validation.
pub struct ModelCheckpoint {
    dir: PathBuf,
    monitor: Monitor,
    mode: MonitorMode,
    save_last: bool,
    best: Option<f64>,
}

impl ModelCheckpoint {
    pub fn new(dir: &Path, monitor: Monitor, mode: MonitorMode, save_last: bool) -> Self {
        ModelCheckpoint {
            dir: dir.to_path_buf(),
            monitor,
            mode,
            save_last,
            best: None,
        }
    }

    pub fn best_model_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }
}

impl<B: AutodiffBackend> Callback<B> for ModelCheckpoint {
    fn on_fit_start(&mut self, progress: &TrainingProgress) {
        self.best = progress.best_score;
    }

    fn on_validation_end(
        &mut self,
        model: &dyn TrainableModel<B>,
        progress: &TrainingProgress,
        metrics: &ValidationMetrics,
    ) -> Result<CallbackAction, FitError> {
        let score = metrics.monitored(self.monitor);
        if self.mode.is_improvement(score, self.best) {
            self.best = Some(score);
            let path = self.best_model_path();
            let progress = TrainingProgress {
                best_score: self.best,
                ..*progress
            };
            save_model(model, &path, progress)?;
            info!(monitor = ?self.monitor, score, path = %path.display(), "new best checkpoint");
        }
        if self.save_last {
            let path = self.dir.join(LAST_CHECKPOINT);
            let progress = TrainingProgress {
                best_score: self.best,
                ..*progress
            };
            save_model(model, &path, progress)?;
            debug!(path = %path.display(), "saved last checkpoint");
        }
        Ok(CallbackAction::Continue)
    }

    fn best_score(&self) -> Option<f64> {
        self.best
    }
}

/// Stops training after `patience` validations without improvement.
pub struct EarlyStopping {
    monitor: Monitor,
    mode: MonitorMode,
    patience: usize,
    best: Option<f64>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(monitor: Monitor, mode: MonitorMode, patience: usize) -> Self {
        EarlyStopping {
            monitor,
            mode,
            patience,
            best: None,
            wait: 0,
        }
    }
}

impl<B: AutodiffBackend> Callback<B> for EarlyStopping {
    fn on_fit_start(&mut self, progress: &TrainingProgress) {
        self.best = progress.best_score;
        self.wait = 0;
    }

    fn on_validation_end(
        &mut self,
        _model: &dyn TrainableModel<B>,
        progress: &TrainingProgress,
        metrics: &ValidationMetrics,
    ) -> Result<CallbackAction, FitError> {
        let score = metrics.monitored(self.monitor);
        if self.mode.is_improvement(score, self.best) {
            self.best = Some(score);
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }
        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                epoch = progress.epoch,
                patience = self.patience,
                best = ?self.best,
                "early stopping"
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::read_header;
    use crate::config::ModelConfig;
    use crate::models::networks::test_support::ctx;
    use crate::models::networks::admil;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn metrics(loss: f64) -> ValidationMetrics {
        ValidationMetrics {
            loss,
            accuracy: 1.0 - loss,
            balanced_accuracy: 1.0 - loss,
            per_class_recall: vec![],
            n: 4,
        }
    }

    fn model() -> Box<dyn TrainableModel<TestBackend>> {
        let mut config = ModelConfig::default();
        config.admil.size = 8;
        config.admil.attention_size = 4;
        admil::build::<TestBackend>(&config, &ctx(6, 2), &Default::default())
    }

    #[test]
    fn test_improvement_rules() {
        assert!(MonitorMode::Min.is_improvement(0.5, None));
        assert!(MonitorMode::Min.is_improvement(0.4, Some(0.5)));
        assert!(!MonitorMode::Min.is_improvement(0.5, Some(0.5)));
        assert!(MonitorMode::Max.is_improvement(0.9, Some(0.5)));
        assert!(!MonitorMode::Max.is_improvement(f64::NAN, None));
    }

    #[test]
    fn test_monitor_serde_names() {
        let m: Monitor = serde_json::from_str("\"val_accuracy\"").unwrap();
        assert_eq!(m, Monitor::ValAccuracy);
        assert_eq!(serde_json::to_string(&MonitorMode::Max).unwrap(), "\"max\"");
    }

    #[test]
    fn test_model_checkpoint_writes_best_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let model = model();
        let mut cb = ModelCheckpoint::new(dir.path(), Monitor::ValLoss, MonitorMode::Min, true);
        let progress = TrainingProgress {
            epoch: 1,
            global_step: 10,
            best_score: None,
        };

        Callback::<TestBackend>::on_validation_end(&mut cb, model.as_ref(), &progress, &metrics(0.6)).unwrap();
        assert_eq!(read_header(&cb.best_model_path()).unwrap().progress.best_score, Some(0.6));

        let progress = TrainingProgress { epoch: 2, ..progress };
        Callback::<TestBackend>::on_validation_end(&mut cb, model.as_ref(), &progress, &metrics(0.8)).unwrap();
        let best = read_header(&cb.best_model_path()).unwrap();
        assert_eq!(best.progress.epoch, 1);
        let last = read_header(&dir.path().join(LAST_CHECKPOINT)).unwrap();
        assert_eq!(last.progress.epoch, 2);
        assert_eq!(last.progress.best_score, Some(0.6));
        assert_eq!(Callback::<TestBackend>::best_score(&cb), Some(0.6));
    }

    #[test]
    fn test_early_stopping_patience() {
        let model = model();
        let mut cb = EarlyStopping::new(Monitor::ValLoss, MonitorMode::Min, 2);
        let progress = TrainingProgress::default();
        let mut run = |loss| {
            Callback::<TestBackend>::on_validation_end(&mut cb, model.as_ref(), &progress, &metrics(loss)).unwrap()
        };
        assert_eq!(run(0.5), CallbackAction::Continue);
        assert_eq!(run(0.6), CallbackAction::Continue);
        assert_eq!(run(0.4), CallbackAction::Continue);
        assert_eq!(run(0.45), CallbackAction::Continue);
        assert_eq!(run(0.41), CallbackAction::Stop);
    }
}

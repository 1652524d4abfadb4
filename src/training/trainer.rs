use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::checkpoint::{load_model, resume_model, save_model, TrainingProgress, BEST_CHECKPOINT};
use crate::config::RunConfig;
use crate::data::{BagBatch, BagLoader};
use crate::error::{CheckpointError, FitError};
use crate::models::networks::repeated_label_loss;
use crate::models::TrainableModel;
use crate::training::callbacks::{Callback, CallbackAction};
use crate::training::loggers::MetricLogger;
use crate::training::metrics::{TimingMetrics, TrainingMetrics, ValidationMetrics};
use crate::training::seed::{epoch_rng, host_rng};

/// Which weights [`Trainer::validate`] evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// The best checkpoint written during fit, or the current weights if
    /// none was written.
    Best,
    Current,
}

/// The optimisation engine driven by the orchestrator.
pub trait Trainer {
    type Model: ?Sized;
    type Loader;

    /// Train to completion. `resume_from` restores weights and progress
    /// from a previously saved checkpoint first.
    fn fit(
        &mut self,
        model: &mut Self::Model,
        train: &mut Self::Loader,
        val: &mut Self::Loader,
        resume_from: Option<&Path>,
    ) -> Result<(), FitError>;

    fn validate(
        &mut self,
        model: &mut Self::Model,
        val: &Self::Loader,
        selector: CheckpointSelector,
        verbose: bool,
    ) -> Result<ValidationMetrics, FitError>;

    /// Snapshot the model together with the trainer's progress.
    fn save_checkpoint(&self, model: &Self::Model, path: &Path) -> Result<(), CheckpointError>;
}

/// Run-level trainer settings.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub devices: usize,
    pub nodes: usize,
    pub precision: String,
    pub accumulate_grad_batches: usize,
    pub max_epochs: usize,
    pub check_val_every_n_epoch: usize,
    /// 0 never reloads.
    pub reload_dataloaders_every_n_epochs: usize,
    pub checkpoint_dir: PathBuf,
    pub n_classes: usize,
    /// Seeds the shuffling and sampling RNG.
    pub seed: u64,
}

impl TrainerSettings {
    pub fn from_config(config: &RunConfig, seed: u64, devices: usize, nodes: usize) -> Self {
        TrainerSettings {
            devices,
            nodes,
            precision: config.trainer.precision.clone(),
            accumulate_grad_batches: config.trainer.accumulate_grad_batches.max(1),
            max_epochs: config.trainer.epochs,
            check_val_every_n_epoch: config.trainer.check_val_every_n_epoch.max(1),
            reload_dataloaders_every_n_epochs: config.trainer.reload_dataloaders_every_n_epochs,
            checkpoint_dir: config.callbacks.checkpoint_dir.clone(),
            n_classes: config.dataset.num_classes,
            seed,
        }
    }
}

/// Trains any [`TrainableModel`] over [`BagLoader`]s on a single device.
pub struct BurnTrainer<B: AutodiffBackend> {
    settings: TrainerSettings,
    loggers: Vec<Box<dyn MetricLogger>>,
    callbacks: Vec<Box<dyn Callback<B>>>,
    progress: TrainingProgress,
    rng: StdRng,
    metrics: TrainingMetrics,
    timing: TimingMetrics,
    device: B::Device,
}

impl<B: AutodiffBackend> BurnTrainer<B> {
    pub fn new(
        settings: TrainerSettings,
        loggers: Vec<Box<dyn MetricLogger>>,
        callbacks: Vec<Box<dyn Callback<B>>>,
    ) -> Self {
        if settings.devices > 1 || settings.nodes > 1 {
            warn!(
                devices = settings.devices,
                nodes = settings.nodes,
                "multi-device training is not supported, running on a single device"
            );
        }
        let rng = host_rng(settings.seed);
        BurnTrainer {
            settings,
            loggers,
            callbacks,
            progress: TrainingProgress::default(),
            rng,
            metrics: TrainingMetrics::new(),
            timing: TimingMetrics::new(),
            device: B::Device::default(),
        }
    }

    /// Device the validation loss is computed on.
    pub fn with_device(mut self, device: B::Device) -> Self {
        self.device = device;
        self
    }

    pub fn progress(&self) -> TrainingProgress {
        self.progress
    }

    /// Forward and backward over one batch. Returns the mean bag loss.
    fn train_batch(
        &mut self,
        model: &mut dyn TrainableModel<B>,
        batch: &BagBatch<'_>,
    ) -> Result<f32, FitError> {
        let scale = (batch.len() * self.settings.accumulate_grad_batches) as f64;
        let mut total = 0.0;
        for bag in &batch.bags {
            let started = Instant::now();
            let output = model.forward(bag);
            let mut loss = repeated_label_loss(output.logits, bag.label).mul_scalar(output.bag_loss_weight);
            if let Some(instance_loss) = output.instance_loss {
                loss = loss + instance_loss;
            }
            let value: f32 = loss.clone().into_scalar().elem();
            if !value.is_finite() {
                return Err(FitError::NonFiniteLoss {
                    loss: value,
                    epoch: self.progress.epoch,
                    step: self.progress.global_step,
                });
            }
            model.backward(loss.div_scalar(scale));
            self.metrics.record_loss(value);
            self.timing.record_bag_time(started.elapsed());
            total += value;
        }
        Ok(total / batch.len().max(1) as f32)
    }

    fn apply_step(&mut self, model: &mut dyn TrainableModel<B>) {
        if model.step() {
            self.progress.global_step += 1;
        }
    }

    fn evaluate(
        &mut self,
        model: &dyn TrainableModel<B>,
        loader: &BagLoader,
    ) -> Result<ValidationMetrics, FitError> {
        let mut logits = Vec::new();
        let mut labels = Vec::new();
        for batch in loader.epoch_batches(&mut self.rng) {
            logits.extend(model.predict(&batch.bags)?);
            labels.extend(batch.labels());
        }
        Ok(ValidationMetrics::from_logits::<B::InnerBackend>(
            &logits,
            &labels,
            self.settings.n_classes,
            &self.device,
        ))
    }

    fn log(&mut self, epoch: usize, scalars: &[(String, f64)]) -> Result<(), FitError> {
        for logger in &mut self.loggers {
            logger.log_metrics(epoch, self.progress.global_step, scalars)?;
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> Trainer for BurnTrainer<B> {
    type Model = dyn TrainableModel<B>;
    type Loader = BagLoader;

    fn fit(
        &mut self,
        model: &mut Self::Model,
        train: &mut Self::Loader,
        val: &mut Self::Loader,
        resume_from: Option<&Path>,
    ) -> Result<(), FitError> {
        if let Some(path) = resume_from {
            let header = resume_model(model, path)?;
            self.progress = header.progress;
            info!(
                path = %path.display(),
                epoch = self.progress.epoch,
                global_step = self.progress.global_step,
                "resumed training"
            );
        }
        for callback in &mut self.callbacks {
            callback.on_fit_start(&self.progress);
        }
        let hyperparameters = model.hyperparameters();
        for logger in &mut self.loggers {
            logger.log_hyperparams(&hyperparameters)?;
        }

        info!(
            family = %model.family(),
            epochs = self.settings.max_epochs,
            train_batches = train.len(),
            val_batches = val.len(),
            accumulate = self.settings.accumulate_grad_batches,
            "starting fit"
        );

        let accumulate = self.settings.accumulate_grad_batches;
        for epoch in self.progress.epoch..self.settings.max_epochs {
            let reload = self.settings.reload_dataloaders_every_n_epochs;
            if reload > 0 && epoch > 0 && epoch % reload == 0 {
                train.reload()?;
                val.reload()?;
            }

            self.rng = epoch_rng(self.settings.seed, epoch);
            self.metrics.start_epoch();
            self.timing.reset_window();
            let mut pending = 0;
            for batch in train.epoch_batches(&mut self.rng) {
                let batch_loss = self.train_batch(model, &batch)?;
                debug!(epoch, loss = batch_loss, "batch");
                pending += 1;
                if pending == accumulate {
                    self.apply_step(model);
                    pending = 0;
                }
            }
            if pending > 0 {
                self.apply_step(model);
            }
            self.progress.epoch = epoch + 1;

            let mut scalars = vec![("train_loss".to_string(), self.metrics.epoch_loss())];
            let mut stop = false;
            if (epoch + 1) % self.settings.check_val_every_n_epoch == 0 {
                let started = Instant::now();
                let metrics = self.evaluate(model, val)?;
                for callback in &mut self.callbacks {
                    if callback.on_validation_end(model, &self.progress, &metrics)? == CallbackAction::Stop {
                        stop = true;
                    }
                }
                if let Some(best) = self.callbacks.iter().find_map(|c| c.best_score()) {
                    self.progress.best_score = Some(best);
                }
                self.timing.record_overhead(started.elapsed());
                scalars.extend(metrics.scalars());
            }
            info!(
                epoch = epoch + 1,
                train_loss = self.metrics.epoch_loss(),
                bag_ms = self.timing.avg_bag_ms(100),
                bags_per_sec = self.timing.bags_per_sec(),
                "epoch complete"
            );
            self.log(epoch, &scalars)?;
            if stop {
                break;
            }
        }

        for logger in &mut self.loggers {
            logger.finalize()?;
        }
        info!(
            epochs = self.progress.epoch,
            global_step = self.progress.global_step,
            bags = self.metrics.bags_seen(),
            "fit finished"
        );
        Ok(())
    }

    fn validate(
        &mut self,
        model: &mut Self::Model,
        val: &Self::Loader,
        selector: CheckpointSelector,
        verbose: bool,
    ) -> Result<ValidationMetrics, FitError> {
        if selector == CheckpointSelector::Best {
            let best = self.settings.checkpoint_dir.join(BEST_CHECKPOINT);
            if best.exists() {
                let header = load_model(model, &best)?;
                info!(path = %best.display(), epoch = header.progress.epoch, "validating best checkpoint");
            } else {
                warn!(path = %best.display(), "no best checkpoint, validating current weights");
            }
        }
        let metrics = self.evaluate(model, val)?;
        let epoch = self.progress.epoch;
        self.log(epoch, &metrics.scalars())?;
        for logger in &mut self.loggers {
            logger.finalize()?;
        }
        if verbose {
            println!("{}", metrics.table());
        }
        Ok(metrics)
    }

    fn save_checkpoint(&self, model: &Self::Model, path: &Path) -> Result<(), CheckpointError> {
        save_model(model, path, self.progress)?;
        info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }
}

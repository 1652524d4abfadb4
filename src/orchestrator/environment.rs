use std::path::Path;

use burn::tensor::backend::AutodiffBackend;

use crate::checkpoint::{save_model, TrainingProgress};
use crate::config::RunConfig;
use crate::data::{BagLoader, DataLoaders};
use crate::error::RunError;
use crate::models::{ModelFactory, ModelRegistry, TrainableModel};
use crate::orchestrator::run::RunEnvironment;
use crate::training::{
    seed_everything, BurnTrainer, Callback, CsvLogger, EarlyStopping, MetricLogger,
    ModelCheckpoint, TracingLogger, TrainerSettings,
};

/// Real components: bag loaders, registry-built models and the burn trainer.
pub struct BurnEnvironment<B: AutodiffBackend> {
    registry: ModelRegistry<B>,
    device: B::Device,
    devices: usize,
    nodes: usize,
}

impl<B: AutodiffBackend> BurnEnvironment<B> {
    pub fn new(device: B::Device) -> Self {
        Self::with_registry(ModelRegistry::with_default_families(), device)
    }

    pub fn with_registry(registry: ModelRegistry<B>, device: B::Device) -> Self {
        BurnEnvironment {
            registry,
            device,
            devices: 1,
            nodes: 1,
        }
    }

    /// Requested accelerator layout, forwarded to the trainer.
    pub fn with_topology(mut self, devices: usize, nodes: usize) -> Self {
        self.devices = devices;
        self.nodes = nodes;
        self
    }
}

/// Metric loggers enabled in `[loggers]`.
pub fn build_loggers(config: &RunConfig) -> Result<Vec<Box<dyn MetricLogger>>, RunError> {
    let mut loggers: Vec<Box<dyn MetricLogger>> = Vec::new();
    if config.loggers.csv {
        loggers.push(Box::new(CsvLogger::new(&config.loggers.log_dir)?));
    }
    if config.loggers.tracing {
        loggers.push(Box::new(TracingLogger));
    }
    Ok(loggers)
}

/// Checkpointing plus optional early stopping, from `[callbacks]`.
pub fn build_callbacks<B: AutodiffBackend>(config: &RunConfig) -> Vec<Box<dyn Callback<B>>> {
    let cb = &config.callbacks;
    let mut callbacks: Vec<Box<dyn Callback<B>>> = vec![Box::new(ModelCheckpoint::new(
        &cb.checkpoint_dir,
        cb.monitor,
        cb.mode,
        cb.save_last,
    ))];
    if let Some(patience) = cb.early_stopping_patience {
        callbacks.push(Box::new(EarlyStopping::new(cb.monitor, cb.mode, patience)));
    }
    callbacks
}

impl<B: AutodiffBackend> RunEnvironment for BurnEnvironment<B> {
    type Model = dyn TrainableModel<B>;
    type Loader = BagLoader;
    type Trainer = BurnTrainer<B>;

    fn seed_everything(&mut self, seed: u64) {
        seed_everything::<B>(seed);
    }

    fn build_loaders(&mut self, config: &RunConfig) -> Result<(BagLoader, BagLoader), RunError> {
        let loaders = DataLoaders::from_config(&config.dataset, &config.trainer)?;
        Ok((loaders.train, loaders.val))
    }

    fn build_model(
        &mut self,
        config: &RunConfig,
        fold: Option<usize>,
        run: Option<usize>,
    ) -> Result<Box<Self::Model>, RunError> {
        let factory = ModelFactory::new(&self.registry, self.device.clone());
        Ok(factory.build(config, config.model.compile, fold, run)?)
    }

    fn save_initial(&mut self, model: &Self::Model, path: &Path) -> Result<(), RunError> {
        save_model(model, path, TrainingProgress::default())?;
        Ok(())
    }

    fn build_trainer(&mut self, config: &RunConfig, seed: u64) -> Result<BurnTrainer<B>, RunError> {
        let settings = TrainerSettings::from_config(config, seed, self.devices, self.nodes);
        Ok(BurnTrainer::new(
            settings,
            build_loggers(config)?,
            build_callbacks::<B>(config),
        )
        .with_device(self.device.clone()))
    }
}

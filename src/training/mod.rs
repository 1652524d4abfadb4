//! Training infrastructure: the burn trainer, its callbacks and metric
//! loggers, validation metrics, and seeding.

pub mod callbacks;
pub mod loggers;
pub mod metrics;
mod seed;
pub mod trainer;

pub use callbacks::{Callback, CallbackAction, EarlyStopping, ModelCheckpoint, Monitor, MonitorMode};
pub use loggers::{CsvLogger, MetricLogger, TracingLogger};
pub use metrics::ValidationMetrics;
pub use seed::{epoch_rng, host_rng, seed_everything};
pub use trainer::{BurnTrainer, CheckpointSelector, Trainer, TrainerSettings};

//! The supported multiple-instance architectures.
//!
//! Each family module holds a serde parameter block (the `[model.<family>]`
//! table), the burn module, and a `build` function registered with the
//! [`ModelRegistry`](crate::models::ModelRegistry).

pub mod admil;
pub mod clam;
pub mod csmil;
pub mod dsmil;
pub mod dtfd;
pub mod mamil;
pub mod mil;
pub mod minet;
pub mod mmil;
pub mod transmil;

pub use admil::{Admil, AdmilConfig};
pub use clam::{Clam, ClamConfig, InstanceLossKind};
pub use csmil::{Csmil, CsmilConfig};
pub use dsmil::{Dsmil, DsmilConfig};
pub use dtfd::{Dtfd, DtfdConfig};
pub use mamil::{Mamil, MamilConfig};
pub use mil::{Mil, MilAggregate, MilConfig, MilType};
pub use minet::{Minet, MinetConfig, PoolingMode};
pub use mmil::{Mmil, MmilConfig, SubbagMode};
pub use transmil::{TransMil, TransMilConfig};

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::class_targets;
use crate::models::{Learner, MilNetwork, ModelContext, ModelFamily, TrainableModel};

/// Wrap a freshly built network in a [`Learner`], recording its parameters.
pub(crate) fn into_trainable<B, M, P>(
    family: ModelFamily,
    network: M,
    params: &P,
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + MilNetwork<B> + 'static,
    M::InnerModule: MilNetwork<B::InnerBackend>,
    P: serde::Serialize,
{
    let mut hyperparameters = serde_json::Map::new();
    hyperparameters.insert("classifier".into(), family.id().into());
    hyperparameters.insert("n_classes".into(), ctx.n_classes.into());
    hyperparameters.insert("feature_size".into(), ctx.feature_size.into());
    hyperparameters.insert(
        "multires_aggregation".into(),
        serde_json::to_value(&ctx.multires).unwrap_or_default(),
    );
    hyperparameters.insert(
        family.id().into(),
        serde_json::to_value(params).unwrap_or_default(),
    );

    Box::new(Learner::new(
        family,
        network,
        config.learning_rate,
        config.weight_decay,
        serde_json::Value::Object(hyperparameters),
        device,
    ))
}

/// Cross-entropy of `logits` (`[n, C]`) against one class index repeated
/// `n` times.
pub(crate) fn repeated_label_loss<B: Backend>(logits: Tensor<B, 2>, label: usize) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    let device = logits.device();
    let targets = class_targets::<B>(&vec![label; n], &device);
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}

pub(crate) fn check(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Validation(message.to_string()))
    }
}

pub(crate) fn check_dropout(dropout: f64, field: &str) -> Result<(), ConfigError> {
    check(
        (0.0..1.0).contains(&dropout),
        &format!("{field} must be in [0, 1)"),
    )
}

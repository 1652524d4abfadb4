//! Multiple-instance classifiers and the registry that builds them.
//!
//! Every family is a burn [`Module`](burn::module::Module) implementing
//! [`MilNetwork`]; the [`Learner`] wrapper turns any of them into a
//! [`TrainableModel`] that the trainer drives without knowing the family.

mod factory;
mod init;
pub(crate) mod layers;
mod learner;
mod multires;
pub mod networks;
mod registry;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

pub use factory::{pretrained_checkpoint_path, ModelFactory};
pub use init::{init_weights, WeightInit};
pub use learner::Learner;
pub use multires::{
    merge_resolutions, AggregationMethod, MultiresAggregator, MultiresConfig, MultiresSpec,
};
pub use registry::{
    BuildFn, FamilyDescriptor, ModelContext, ModelFamily, ModelRegistry,
    DEFAULT_CHECKPOINT_TEMPLATE,
};

use crate::data::BagItem;
use crate::error::{CheckpointError, FitError};

/// Output of one bag forward pass.
#[derive(Debug, Clone)]
pub struct MilOutput<B: Backend> {
    /// Bag-level logits, shape `[1, n_classes]`.
    pub logits: Tensor<B, 2>,
    /// Auxiliary instance-level loss, already scaled by the family's weight.
    pub instance_loss: Option<Tensor<B, 1>>,
    /// Weight applied to the bag-level classification loss.
    pub bag_loss_weight: f64,
}

impl<B: Backend> MilOutput<B> {
    /// Output with bag logits only.
    pub fn bag(logits: Tensor<B, 2>) -> Self {
        MilOutput {
            logits,
            instance_loss: None,
            bag_loss_weight: 1.0,
        }
    }
}

/// A multiple-instance network: one bag in, one set of class logits out.
pub trait MilNetwork<B: Backend>: Module<B> {
    /// Forward pass over one bag.
    ///
    /// `features` holds one `[n_instances, feature_size]` matrix per data
    /// column. `label` is the bag's class index during training and enables
    /// instance-level supervision in families that support it.
    fn forward(&self, features: Vec<Tensor<B, 2>>, label: Option<usize>) -> MilOutput<B>;
}

/// Family-independent capability interface used by the trainer and the
/// orchestrator.
pub trait TrainableModel<B: AutodiffBackend> {
    fn family(&self) -> ModelFamily;

    /// Training forward pass (autodiff graph attached).
    fn forward(&self, bag: &BagItem) -> MilOutput<B>;

    /// Inference logits for a set of bags, without an autodiff graph.
    fn predict(&self, bags: &[&BagItem]) -> Result<Vec<Vec<f32>>, FitError>;

    /// Backpropagate `loss` and accumulate the gradients.
    fn backward(&mut self, loss: Tensor<B, 1>);

    /// Apply the accumulated gradients. Returns false if nothing was pending.
    fn step(&mut self) -> bool;

    fn num_params(&self) -> usize;

    /// Constructor parameters, recorded in checkpoint headers.
    fn hyperparameters(&self) -> serde_json::Value;

    /// Serialize the weights.
    fn state_dict(&self) -> Result<Vec<u8>, CheckpointError>;

    /// Replace the weights with a serialized state dict.
    fn load_state_dict(&mut self, bytes: Vec<u8>) -> Result<(), CheckpointError>;

    /// Serialize the optimizer state (Adam moments and step counts).
    fn optimizer_state(&self) -> Result<Vec<u8>, CheckpointError>;

    /// Restore optimizer state written by [`optimizer_state`](Self::optimizer_state).
    fn load_optimizer_state(&mut self, bytes: Vec<u8>) -> Result<(), CheckpointError>;

    /// Re-draw all non-bias weights with the given scheme.
    fn initialize(&mut self, init: WeightInit);

    /// Whether [`TrainableModel::forward`] may return an instance loss.
    /// When disabled the bag loss carries full weight.
    fn set_instance_loss(&mut self, enabled: bool);

    /// Run a warm-up inference pass so backend kernels are compiled and tuned
    /// before training starts. Does not change weights or consume randomness.
    fn compile(&mut self, ctx: &ModelContext);
}

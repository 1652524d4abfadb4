use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::models::layers::{attention_pool, AttentionNet, AttentionNetConfig, FcBlock, FcBlockConfig};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::into_trainable;
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.mamil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MamilConfig {
    pub size: usize,
    pub dropout: f64,
}

impl Default for MamilConfig {
    fn default() -> Self {
        MamilConfig {
            size: 256,
            dropout: 0.25,
        }
    }
}

impl MamilConfig {
    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Mamil<B> {
        let hidden = (self.size / 2).max(1);
        Mamil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: FcBlockConfig::new(ctx.input_size(), self.size)
                .with_dropout(self.dropout)
                .init(device),
            context_attention: AttentionNetConfig::new(self.size, hidden)
                .with_dropout(self.dropout)
                .init(device),
            attention: AttentionNetConfig::new(2 * self.size, hidden)
                .with_dropout(self.dropout)
                .init(device),
            classifier: LinearConfig::new(self.size, ctx.n_classes).init(device),
        }
    }
}

/// Multi-attention MIL.
///
/// A first attention pass summarises the bag into a context vector; the
/// second pass scores each instance jointly with that context.
#[derive(Module, Debug)]
pub struct Mamil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: FcBlock<B>,
    context_attention: AttentionNet<B>,
    attention: AttentionNet<B>,
    classifier: Linear<B>,
}

impl<B: Backend> MilNetwork<B> for Mamil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let [n, _] = h.dims();

        let (context, _) = attention_pool(self.context_attention.forward(h.clone()), h.clone());
        let joint = Tensor::cat(vec![h.clone(), context.repeat_dim(0, n)], 1);
        let (pooled, _) = attention_pool(self.attention.forward(joint), h);

        MilOutput::bag(self.classifier.forward(pooled))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.mamil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Mamil, network, &config.mamil, config, ctx, device)
}

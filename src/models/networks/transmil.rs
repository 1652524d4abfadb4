use burn::module::Param;
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{FcBlock, FcBlockConfig};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.transmil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransMilConfig {
    pub size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub dropout: f64,
}

impl Default for TransMilConfig {
    fn default() -> Self {
        TransMilConfig {
            size: 512,
            num_heads: 8,
            num_layers: 2,
            dropout: 0.1,
        }
    }
}

impl TransMilConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.size > 0, "model.transmil.size must be > 0")?;
        check(self.num_layers > 0, "model.transmil.num_layers must be > 0")?;
        check(
            self.num_heads > 0 && self.size % self.num_heads == 0,
            "model.transmil.size must be divisible by model.transmil.num_heads",
        )?;
        check_dropout(self.dropout, "model.transmil.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> TransMil<B> {
        TransMil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: FcBlockConfig::new(ctx.input_size(), self.size).init(device),
            cls_token: Param::from_tensor(Tensor::random(
                [1, self.size],
                Distribution::Normal(0.0, 0.02),
                device,
            )),
            encoder: TransformerEncoderConfig::new(
                self.size,
                self.size * 4,
                self.num_heads,
                self.num_layers,
            )
            .with_dropout(self.dropout)
            .with_norm_first(true)
            .init(device),
            norm: LayerNormConfig::new(self.size).init(device),
            classifier: LinearConfig::new(self.size, ctx.n_classes).init(device),
        }
    }
}

/// Transformer MIL: a class token attends over all instance embeddings.
#[derive(Module, Debug)]
pub struct TransMil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: FcBlock<B>,
    cls_token: Param<Tensor<B, 2>>,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    classifier: Linear<B>,
}

impl<B: Backend> MilNetwork<B> for TransMil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let [n, size] = h.dims();

        let tokens = Tensor::cat(vec![self.cls_token.val(), h], 0).reshape([1, n + 1, size]);
        let encoded = self.encoder.forward(TransformerEncoderInput::new(tokens));
        let cls = encoded.slice([0..1, 0..1, 0..size]).reshape([1, size]);

        MilOutput::bag(self.classifier.forward(self.norm.forward(cls)))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.transmil.init::<B>(ctx, device);
    into_trainable(ModelFamily::TransMil, network, &config.transmil, config, ctx, device)
}

use burn::module::{Ignored, Param};
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{index_tensor, FcBlock, FcBlockConfig};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// How instances are distributed over sub-bags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubbagMode {
    /// Instance `i` goes to sub-bag `i % num_subbags`.
    #[default]
    Interleaved,
    /// Consecutive runs of instances form each sub-bag.
    Contiguous,
}

/// `[model.mmil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MmilConfig {
    pub size: usize,
    /// Message tokens prepended to every sub-bag.
    pub num_msg: usize,
    pub num_subbags: usize,
    pub mode: SubbagMode,
    /// Learned absolute position embedding per sub-bag.
    pub ape: bool,
    pub num_layers: usize,
    pub num_heads: usize,
    pub dropout: f64,
}

impl Default for MmilConfig {
    fn default() -> Self {
        MmilConfig {
            size: 256,
            num_msg: 1,
            num_subbags: 16,
            mode: SubbagMode::Interleaved,
            ape: true,
            num_layers: 2,
            num_heads: 4,
            dropout: 0.1,
        }
    }
}

impl MmilConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.size > 0, "model.mmil.size must be > 0")?;
        check(self.num_msg > 0, "model.mmil.num_msg must be > 0")?;
        check(self.num_subbags > 0, "model.mmil.num_subbags must be > 0")?;
        check(self.num_layers > 0, "model.mmil.num_layers must be > 0")?;
        check(
            self.num_heads > 0 && self.size % self.num_heads == 0,
            "model.mmil.size must be divisible by model.mmil.num_heads",
        )?;
        check_dropout(self.dropout, "model.mmil.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Mmil<B> {
        let token = |rows: usize| {
            Param::from_tensor(Tensor::random(
                [rows, self.size],
                Distribution::Normal(0.0, 0.02),
                device,
            ))
        };
        Mmil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: FcBlockConfig::new(ctx.input_size(), self.size)
                .with_dropout(self.dropout)
                .init(device),
            messages: token(self.num_msg),
            positions: self.ape.then(|| token(self.num_subbags)),
            encoder: TransformerEncoderConfig::new(
                self.size,
                self.size * 2,
                self.num_heads,
                self.num_layers,
            )
            .with_dropout(self.dropout)
            .init(device),
            norm: LayerNormConfig::new(self.size).init(device),
            classifier: LinearConfig::new(self.size, ctx.n_classes).init(device),
            num_msg: Ignored(self.num_msg),
            num_subbags: Ignored(self.num_subbags),
            mode: Ignored(self.mode),
        }
    }
}

/// Message-passing MIL over sub-bags.
///
/// Each sub-bag is encoded together with shared message tokens; the
/// resulting messages of all sub-bags are encoded once more and averaged
/// into the bag embedding.
#[derive(Module, Debug)]
pub struct Mmil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: FcBlock<B>,
    messages: Param<Tensor<B, 2>>,
    positions: Option<Param<Tensor<B, 2>>>,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    classifier: Linear<B>,
    num_msg: Ignored<usize>,
    num_subbags: Ignored<usize>,
    mode: Ignored<SubbagMode>,
}

impl<B: Backend> Mmil<B> {
    fn encode(&self, tokens: Tensor<B, 2>) -> Tensor<B, 2> {
        let [len, size] = tokens.dims();
        self.encoder
            .forward(TransformerEncoderInput::new(tokens.reshape([1, len, size])))
            .reshape([len, size])
    }

    fn subbags(&self, n: usize) -> Vec<Vec<usize>> {
        let count = self.num_subbags.0.min(n).max(1);
        match self.mode.0 {
            SubbagMode::Interleaved => (0..count)
                .map(|j| (j..n).step_by(count).collect())
                .collect(),
            SubbagMode::Contiguous => {
                let chunk = n.div_ceil(count);
                (0..n)
                    .collect::<Vec<_>>()
                    .chunks(chunk.max(1))
                    .map(|c| c.to_vec())
                    .collect()
            }
        }
    }
}

impl<B: Backend> MilNetwork<B> for Mmil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let [n, size] = h.dims();
        let device = h.device();
        let num_msg = self.num_msg.0;

        let mut messages = Vec::new();
        for (j, members) in self.subbags(n).into_iter().enumerate() {
            let mut tokens = self.messages.val();
            if let Some(positions) = &self.positions {
                tokens = tokens + positions.val().slice([j..j + 1, 0..size]);
            }
            let part = h.clone().select(0, index_tensor::<B>(&members, &device));
            let encoded = self.encode(Tensor::cat(vec![tokens, part], 0));
            messages.push(encoded.slice([0..num_msg, 0..size]));
        }

        let exchanged = self.encode(Tensor::cat(messages, 0));
        let pooled = self.norm.forward(exchanged.mean_dim(0));
        MilOutput::bag(self.classifier.forward(pooled))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.mmil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Mmil, network, &config.mmil, config, ctx, device)
}

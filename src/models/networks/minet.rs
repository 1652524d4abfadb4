use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{fc_stack, max_over_instances, FcBlock};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// MIL pooling operator of MI-Net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    #[default]
    Max,
    Mean,
    /// Log-sum-exp, a smooth maximum.
    Lse,
}

/// `[model.minet]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MinetConfig {
    pub size: Vec<usize>,
    pub dropout: f64,
    pub pooling_mode: PoolingMode,
}

impl Default for MinetConfig {
    fn default() -> Self {
        MinetConfig {
            size: vec![256, 128, 64],
            dropout: 0.0,
            pooling_mode: PoolingMode::Max,
        }
    }
}

impl MinetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            !self.size.is_empty() && self.size.iter().all(|&s| s > 0),
            "model.minet.size must hold at least one positive width",
        )?;
        check_dropout(self.dropout, "model.minet.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Minet<B> {
        let width = self.size.last().copied().unwrap_or_else(|| ctx.input_size());
        Minet {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            layers: fc_stack(ctx.input_size(), &self.size, self.dropout, device),
            classifier: LinearConfig::new(width, ctx.n_classes).init(device),
            pooling: Ignored(self.pooling_mode),
        }
    }
}

/// MI-Net: embedding-level MIL with a fixed pooling operator.
#[derive(Module, Debug)]
pub struct Minet<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    layers: Vec<FcBlock<B>>,
    classifier: Linear<B>,
    pooling: Ignored<PoolingMode>,
}

impl<B: Backend> MilNetwork<B> for Minet<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let mut h = merge_resolutions(&self.multires, features);
        for layer in &self.layers {
            h = layer.forward(h);
        }
        let pooled = match self.pooling.0 {
            PoolingMode::Max => max_over_instances(h),
            PoolingMode::Mean => h.mean_dim(0),
            PoolingMode::Lse => {
                let max = max_over_instances(h.clone().detach());
                (h - max.clone()).exp().mean_dim(0).log() + max
            }
        };
        MilOutput::bag(self.classifier.forward(pooled))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.minet.init::<B>(ctx, device);
    into_trainable(ModelFamily::Minet, network, &config.minet, config, ctx, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::networks::test_support::{bag, ctx};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_minet_pooling_modes() {
        let device = Default::default();
        for pooling_mode in [PoolingMode::Max, PoolingMode::Mean, PoolingMode::Lse] {
            let config = MinetConfig {
                size: vec![8, 4],
                dropout: 0.0,
                pooling_mode,
            };
            let net = config.init::<TestBackend>(&ctx(6, 2), &device);
            let out = net.forward(bag(5, 6, &device), None);
            assert_eq!(out.logits.shape().dims, [1, 2]);
            let logits: Vec<f32> = out.logits.into_data().to_vec().unwrap();
            assert!(logits.iter().all(|v| v.is_finite()), "{pooling_mode:?}");
        }
    }

    #[test]
    fn test_minet_validation() {
        assert!(MinetConfig::default().validate().is_ok());
        assert!(MinetConfig {
            size: vec![0],
            ..MinetConfig::default()
        }
        .validate()
        .is_err());
    }
}

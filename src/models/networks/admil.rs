use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{attention_pool, AttentionNet, AttentionNetConfig, FcBlock, FcBlockConfig};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.admil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AdmilConfig {
    /// Width of the instance embedding.
    pub size: usize,
    pub attention_size: usize,
    /// Number of attention branches.
    #[serde(alias = "K")]
    pub k: usize,
    pub gated: bool,
    pub dropout: f64,
}

impl Default for AdmilConfig {
    fn default() -> Self {
        AdmilConfig {
            size: 500,
            attention_size: 128,
            k: 1,
            gated: true,
            dropout: 0.25,
        }
    }
}

impl AdmilConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.size > 0, "model.admil.size must be > 0")?;
        check(self.attention_size > 0, "model.admil.attention_size must be > 0")?;
        check(self.k > 0, "model.admil.k must be > 0")?;
        check_dropout(self.dropout, "model.admil.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Admil<B> {
        Admil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: FcBlockConfig::new(ctx.input_size(), self.size)
                .with_dropout(self.dropout)
                .init(device),
            attention: AttentionNetConfig::new(self.size, self.attention_size)
                .with_branches(self.k)
                .with_gated(self.gated)
                .with_dropout(self.dropout)
                .init(device),
            classifier: LinearConfig::new(self.size * self.k, ctx.n_classes).init(device),
        }
    }
}

/// Attention-based deep MIL (Ilse et al.).
///
/// ```text
/// h = ReLU(W x)                 [n, size]
/// a = softmax(attention(h))     [K, n]
/// z = a h                       [K, size]
/// logits = W_c flatten(z)       [1, C]
/// ```
#[derive(Module, Debug)]
pub struct Admil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: FcBlock<B>,
    attention: AttentionNet<B>,
    classifier: Linear<B>,
}

impl<B: Backend> MilNetwork<B> for Admil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let scores = self.attention.forward(h.clone());
        let (pooled, _) = attention_pool(scores, h);
        let [k, size] = pooled.dims();
        MilOutput::bag(self.classifier.forward(pooled.reshape([1, k * size])))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.admil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Admil, network, &config.admil, config, ctx, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::multires::{AggregationMethod, MultiresSpec};
    use crate::models::networks::test_support::{bag, ctx};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small() -> AdmilConfig {
        AdmilConfig {
            size: 16,
            attention_size: 8,
            ..AdmilConfig::default()
        }
    }

    #[test]
    fn test_admil_output_shape() {
        let device = Default::default();
        let net = small().init::<TestBackend>(&ctx(12, 3), &device);
        let out = net.forward(bag(7, 12, &device), Some(1));
        assert_eq!(out.logits.shape().dims, [1, 3]);
        assert!(out.instance_loss.is_none());
    }

    #[test]
    fn test_admil_multi_branch() {
        let device = Default::default();
        let config = AdmilConfig { k: 3, ..small() };
        let net = config.init::<TestBackend>(&ctx(12, 2), &device);
        let out = net.forward(bag(4, 12, &device), None);
        assert_eq!(out.logits.shape().dims, [1, 2]);
    }

    #[test]
    fn test_admil_with_concat_multires() {
        let device = Default::default();
        let mut context = ctx(6, 2);
        context.n_columns = 2;
        context.multires = Some(MultiresSpec {
            columns: vec![0, 1],
            method: AggregationMethod::Concat,
        });
        let net = small().init::<TestBackend>(&context, &device);
        let mut features = bag(5, 6, &device);
        features.extend(bag(5, 6, &device));
        let out = net.forward(features, None);
        assert_eq!(out.logits.shape().dims, [1, 2]);
    }

    #[test]
    fn test_admil_validation() {
        assert!(AdmilConfig::default().validate().is_ok());
        assert!(AdmilConfig { k: 0, ..small() }.validate().is_err());
        assert!(AdmilConfig {
            dropout: 1.0,
            ..small()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_admil_k_alias() {
        let config: AdmilConfig = toml::from_str("K = 2").unwrap();
        assert_eq!(config.k, 2);
    }
}

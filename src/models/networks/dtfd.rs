use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{
    attention_pool, index_tensor, AttentionNet, AttentionNetConfig, FcBlock, FcBlockConfig,
};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable, repeated_label_loss};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.dtfd]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DtfdConfig {
    /// Width after dimensionality reduction.
    pub size: usize,
    pub attention_size: usize,
    /// Attention branches of the second tier.
    #[serde(alias = "K")]
    pub k: usize,
    /// Pseudo-bags each bag is split into.
    pub n_bags: usize,
    pub dropout: f64,
    pub instance_loss_weight: f64,
}

impl Default for DtfdConfig {
    fn default() -> Self {
        DtfdConfig {
            size: 512,
            attention_size: 128,
            k: 1,
            n_bags: 4,
            dropout: 0.25,
            instance_loss_weight: 1.0,
        }
    }
}

impl DtfdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.size > 0, "model.dtfd.size must be > 0")?;
        check(self.attention_size > 0, "model.dtfd.attention_size must be > 0")?;
        check(self.k > 0, "model.dtfd.k must be > 0")?;
        check(self.n_bags > 0, "model.dtfd.n_bags must be > 0")?;
        check(
            self.instance_loss_weight >= 0.0,
            "model.dtfd.instance_loss_weight must be >= 0",
        )?;
        check_dropout(self.dropout, "model.dtfd.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Dtfd<B> {
        Dtfd {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            reduction: FcBlockConfig::new(ctx.input_size(), self.size)
                .with_dropout(self.dropout)
                .init(device),
            tier1_attention: AttentionNetConfig::new(self.size, self.attention_size)
                .with_dropout(self.dropout)
                .init(device),
            tier1_classifier: LinearConfig::new(self.size, ctx.n_classes).init(device),
            tier2_attention: AttentionNetConfig::new(self.size, self.attention_size)
                .with_branches(self.k)
                .with_dropout(self.dropout)
                .init(device),
            tier2_classifier: LinearConfig::new(self.size * self.k, ctx.n_classes).init(device),
            n_bags: Ignored(self.n_bags),
            instance_loss_weight: Ignored(self.instance_loss_weight),
        }
    }
}

/// Double-tier feature distillation MIL.
///
/// Tier 1 splits the bag into pseudo-bags (instance `i` goes to pseudo-bag
/// `i % n_bags`), attention-pools each and classifies it with the parent's
/// label. Tier 2 attends over the pooled pseudo-bag features.
#[derive(Module, Debug)]
pub struct Dtfd<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    reduction: FcBlock<B>,
    tier1_attention: AttentionNet<B>,
    tier1_classifier: Linear<B>,
    tier2_attention: AttentionNet<B>,
    tier2_classifier: Linear<B>,
    n_bags: Ignored<usize>,
    instance_loss_weight: Ignored<f64>,
}

impl<B: Backend> MilNetwork<B> for Dtfd<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, label: Option<usize>) -> MilOutput<B> {
        let h = self.reduction.forward(merge_resolutions(&self.multires, features));
        let [n, _] = h.dims();
        let device = h.device();
        let pseudo_bags = self.n_bags.0.min(n).max(1);

        let mut distilled = Vec::with_capacity(pseudo_bags);
        let mut tier1_logits = Vec::with_capacity(pseudo_bags);
        for bag in 0..pseudo_bags {
            let members: Vec<usize> = (bag..n).step_by(pseudo_bags).collect();
            let part = h.clone().select(0, index_tensor::<B>(&members, &device));
            let (pooled, _) = attention_pool(self.tier1_attention.forward(part.clone()), part);
            tier1_logits.push(self.tier1_classifier.forward(pooled.clone()));
            distilled.push(pooled);
        }

        let distilled = Tensor::cat(distilled, 0); // [pseudo_bags, size]
        let (pooled, _) = attention_pool(self.tier2_attention.forward(distilled.clone()), distilled);
        let [k, size] = pooled.dims();
        let logits = self.tier2_classifier.forward(pooled.reshape([1, k * size]));

        match label {
            Some(label) => {
                let tier1 = Tensor::cat(tier1_logits, 0);
                let loss = repeated_label_loss(tier1, label).mul_scalar(self.instance_loss_weight.0);
                MilOutput {
                    logits,
                    instance_loss: Some(loss),
                    bag_loss_weight: 1.0,
                }
            }
            None => MilOutput::bag(logits),
        }
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.dtfd.init::<B>(ctx, device);
    into_trainable(ModelFamily::Dtfd, network, &config.dtfd, config, ctx, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::networks::test_support::{bag, ctx};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small() -> DtfdConfig {
        DtfdConfig {
            size: 16,
            attention_size: 8,
            dropout: 0.0,
            ..DtfdConfig::default()
        }
    }

    #[test]
    fn test_dtfd_output_and_tier1_loss() {
        let device = Default::default();
        let net = small().init::<TestBackend>(&ctx(10, 3), &device);
        let out = net.forward(bag(11, 10, &device), Some(2));
        assert_eq!(out.logits.shape().dims, [1, 3]);
        let loss: f32 = out.instance_loss.unwrap().into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_dtfd_fewer_instances_than_pseudo_bags() {
        let device = Default::default();
        let net = small().init::<TestBackend>(&ctx(10, 2), &device);
        let out = net.forward(bag(2, 10, &device), Some(0));
        assert_eq!(out.logits.shape().dims, [1, 2]);
    }

    #[test]
    fn test_dtfd_multi_branch_without_label() {
        let device = Default::default();
        let config = DtfdConfig { k: 2, ..small() };
        let net = config.init::<TestBackend>(&ctx(10, 2), &device);
        let out = net.forward(bag(9, 10, &device), None);
        assert_eq!(out.logits.shape().dims, [1, 2]);
        assert!(out.instance_loss.is_none());
    }

    #[test]
    fn test_dtfd_validation() {
        assert!(DtfdConfig::default().validate().is_ok());
        assert!(DtfdConfig {
            n_bags: 0,
            ..DtfdConfig::default()
        }
        .validate()
        .is_err());
    }
}

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{attention_pool, AttentionNet, AttentionNetConfig, FcBlock, FcBlockConfig};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.csmil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CsmilConfig {
    pub size: usize,
    pub cluster_num: usize,
    pub dropout: f64,
}

impl Default for CsmilConfig {
    fn default() -> Self {
        CsmilConfig {
            size: 256,
            cluster_num: 8,
            dropout: 0.25,
        }
    }
}

impl CsmilConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.size > 1, "model.csmil.size must be > 1")?;
        check(self.cluster_num > 0, "model.csmil.cluster_num must be > 0")?;
        check_dropout(self.dropout, "model.csmil.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Csmil<B> {
        Csmil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: FcBlockConfig::new(ctx.input_size(), self.size)
                .with_dropout(self.dropout)
                .init(device),
            centroids: Param::from_tensor(Tensor::random(
                [self.cluster_num, self.size],
                Distribution::Normal(0.0, 0.02),
                device,
            )),
            attention: AttentionNetConfig::new(self.size, (self.size / 2).max(1))
                .with_dropout(self.dropout)
                .init(device),
            classifier: LinearConfig::new(self.size, ctx.n_classes).init(device),
        }
    }
}

/// Cluster-based MIL.
///
/// Instances are softly assigned to learned centroids; each cluster is
/// summarised by its assignment-weighted mean and the cluster summaries are
/// attention-pooled into the bag embedding.
#[derive(Module, Debug)]
pub struct Csmil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: FcBlock<B>,
    centroids: Param<Tensor<B, 2>>,
    attention: AttentionNet<B>,
    classifier: Linear<B>,
}

impl<B: Backend> MilNetwork<B> for Csmil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let [_, size] = h.dims();

        let similarity = h
            .clone()
            .matmul(self.centroids.val().transpose())
            .div_scalar((size as f64).sqrt());
        let assignment = softmax(similarity, 1); // [n, K]
        let mass = assignment.clone().sum_dim(0).transpose().add_scalar(1e-6); // [K, 1]
        let clusters = assignment.transpose().matmul(h) / mass; // [K, size]

        let (pooled, _) = attention_pool(self.attention.forward(clusters.clone()), clusters);
        MilOutput::bag(self.classifier.forward(pooled))
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.csmil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Csmil, network, &config.csmil, config, ctx, device)
}

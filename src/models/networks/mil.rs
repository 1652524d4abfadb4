use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{fc_stack, max_over_instances, top_k_mean, FcBlock};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// Where instances are pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilType {
    /// Classify every instance, then pool the instance logits.
    Instance,
    /// Pool the instance embeddings, then classify the bag embedding.
    #[default]
    Embedding,
}

/// Pooling operator over the instance axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilAggregate {
    #[default]
    Mean,
    Max,
    /// Mean of the `top_k` largest values per feature.
    TopK,
}

/// `[model.mil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MilConfig {
    pub size: Vec<usize>,
    pub mil_type: MilType,
    pub aggregates: MilAggregate,
    pub top_k: usize,
    pub dropout: f64,
}

impl Default for MilConfig {
    fn default() -> Self {
        MilConfig {
            size: vec![256, 128],
            mil_type: MilType::Embedding,
            aggregates: MilAggregate::Mean,
            top_k: 5,
            dropout: 0.25,
        }
    }
}

impl MilConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            !self.size.is_empty() && self.size.iter().all(|&s| s > 0),
            "model.mil.size must hold at least one positive width",
        )?;
        check(self.top_k > 0, "model.mil.top_k must be > 0")?;
        check_dropout(self.dropout, "model.mil.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Mil<B> {
        let width = self.size.last().copied().unwrap_or_else(|| ctx.input_size());
        Mil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            encoder: fc_stack(ctx.input_size(), &self.size, self.dropout, device),
            classifier: LinearConfig::new(width, ctx.n_classes).init(device),
            mil_type: Ignored(self.mil_type),
            aggregate: Ignored(self.aggregates),
            top_k: Ignored(self.top_k),
        }
    }
}

/// Classic instance- or embedding-level MIL with a fixed pooling operator.
#[derive(Module, Debug)]
pub struct Mil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    encoder: Vec<FcBlock<B>>,
    classifier: Linear<B>,
    mil_type: Ignored<MilType>,
    aggregate: Ignored<MilAggregate>,
    top_k: Ignored<usize>,
}

impl<B: Backend> Mil<B> {
    /// `[n, d] -> [1, d]`.
    fn pool(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self.aggregate.0 {
            MilAggregate::Mean => x.mean_dim(0),
            MilAggregate::Max => max_over_instances(x),
            MilAggregate::TopK => top_k_mean(x, self.top_k.0),
        }
    }
}

impl<B: Backend> MilNetwork<B> for Mil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, _label: Option<usize>) -> MilOutput<B> {
        let mut h = merge_resolutions(&self.multires, features);
        for block in &self.encoder {
            h = block.forward(h);
        }
        let logits = match self.mil_type.0 {
            MilType::Instance => self.pool(self.classifier.forward(h)),
            MilType::Embedding => self.classifier.forward(self.pool(h)),
        };
        MilOutput::bag(logits)
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.mil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Mil, network, &config.mil, config, ctx, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::networks::test_support::{bag, ctx};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_mil_every_combination_shapes() {
        let device = Default::default();
        for mil_type in [MilType::Instance, MilType::Embedding] {
            for aggregates in [MilAggregate::Mean, MilAggregate::Max, MilAggregate::TopK] {
                let config = MilConfig {
                    size: vec![8, 4],
                    mil_type,
                    aggregates,
                    top_k: 3,
                    dropout: 0.0,
                };
                let net = config.init::<TestBackend>(&ctx(10, 2), &device);
                let out = net.forward(bag(5, 10, &device), Some(0));
                assert_eq!(out.logits.shape().dims, [1, 2], "{mil_type:?}/{aggregates:?}");
            }
        }
    }

    #[test]
    fn test_mil_top_k_larger_than_bag() {
        let device = Default::default();
        let config = MilConfig {
            size: vec![4],
            aggregates: MilAggregate::TopK,
            top_k: 50,
            ..MilConfig::default()
        };
        let net = config.init::<TestBackend>(&ctx(6, 3), &device);
        let out = net.forward(bag(2, 6, &device), None);
        assert_eq!(out.logits.shape().dims, [1, 3]);
    }

    #[test]
    fn test_mil_validation() {
        assert!(MilConfig::default().validate().is_ok());
        assert!(MilConfig {
            size: vec![],
            ..MilConfig::default()
        }
        .validate()
        .is_err());
        assert!(MilConfig {
            top_k: 0,
            ..MilConfig::default()
        }
        .validate()
        .is_err());
    }
}

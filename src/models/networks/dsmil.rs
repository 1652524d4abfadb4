use burn::module::Ignored;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::models::layers::max_over_instances;
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{into_trainable, repeated_label_loss};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// `[model.dsmil]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DsmilConfig {
    /// Width of the query projection.
    pub size: usize,
    pub dropout: f64,
    /// Two-layer tanh query network instead of a single projection.
    pub nonlinear: bool,
    /// Project instance values before aggregation.
    pub passing_v: bool,
    pub instance_loss_weight: f64,
}

impl Default for DsmilConfig {
    fn default() -> Self {
        DsmilConfig {
            size: 128,
            dropout: 0.0,
            nonlinear: true,
            passing_v: false,
            instance_loss_weight: 0.5,
        }
    }
}

impl DsmilConfig {
    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Dsmil<B> {
        let input = ctx.input_size();
        Dsmil {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            instance_classifier: LinearConfig::new(input, ctx.n_classes).init(device),
            query: LinearConfig::new(input, self.size).init(device),
            query_out: self
                .nonlinear
                .then(|| LinearConfig::new(self.size, self.size).init(device)),
            value: self
                .passing_v
                .then(|| LinearConfig::new(input, input).init(device)),
            dropout: DropoutConfig::new(self.dropout).init(),
            bag_classifier: LinearConfig::new(ctx.n_classes * input, ctx.n_classes).init(device),
            instance_loss_weight: Ignored(self.instance_loss_weight),
        }
    }
}

/// Dual-stream MIL.
///
/// The instance stream scores every instance per class; the bag stream
/// attends to all instances with the highest-scoring instance of each class
/// as query and classifies the resulting `[C, d]` class embeddings.
#[derive(Module, Debug)]
pub struct Dsmil<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    instance_classifier: Linear<B>,
    query: Linear<B>,
    query_out: Option<Linear<B>>,
    value: Option<Linear<B>>,
    dropout: Dropout,
    bag_classifier: Linear<B>,
    instance_loss_weight: Ignored<f64>,
}

impl<B: Backend> Dsmil<B> {
    fn queries(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.query_out {
            Some(out) => out.forward(relu(self.query.forward(x))).tanh(),
            None => self.query.forward(x),
        }
    }
}

impl<B: Backend> MilNetwork<B> for Dsmil<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, label: Option<usize>) -> MilOutput<B> {
        let feats = merge_resolutions(&self.multires, features);
        let [_, input] = feats.dims();

        let classes = self.instance_classifier.forward(feats.clone()); // [n, C]
        let [_, n_classes] = classes.dims();

        let values = match &self.value {
            Some(value) => self.dropout.forward(relu(value.forward(feats.clone()))),
            None => feats.clone(),
        };
        let queries = self.queries(feats.clone()); // [n, q]
        let [_, q] = queries.dims();

        // Critical instance per class.
        let critical = classes.clone().detach().argmax(0).reshape([n_classes]);
        let critical_queries = self.queries(feats.select(0, critical)); // [C, q]

        let scores = queries
            .matmul(critical_queries.transpose())
            .div_scalar((q as f64).sqrt());
        let attention = softmax(scores, 0); // [n, C]
        let class_embeddings = attention.transpose().matmul(values); // [C, d]
        let logits = self
            .bag_classifier
            .forward(class_embeddings.reshape([1, n_classes * input]));

        match label {
            Some(label) if label < n_classes => {
                let weight = self.instance_loss_weight.0;
                let max_prediction = max_over_instances(classes); // [1, C]
                let loss = repeated_label_loss(max_prediction, label).mul_scalar(weight);
                MilOutput {
                    logits,
                    instance_loss: Some(loss),
                    bag_loss_weight: 1.0 - weight,
                }
            }
            _ => MilOutput::bag(logits),
        }
    }
}

pub fn build<B: AutodiffBackend>(
    config: &ModelConfig,
    ctx: &ModelContext,
    device: &B::Device,
) -> Box<dyn TrainableModel<B>> {
    let network = config.dsmil.init::<B>(ctx, device);
    into_trainable(ModelFamily::Dsmil, network, &config.dsmil, config, ctx, device)
}

use burn::module::Ignored;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::models::layers::{
    attention_pool, fc_stack, AttentionNet, AttentionNetConfig, FcBlock, FcBlockConfig,
};
use crate::models::multires::{merge_resolutions, MultiresAggregator};
use crate::models::networks::{check, check_dropout, into_trainable};
use crate::models::{MilNetwork, MilOutput, ModelContext, ModelFamily, TrainableModel};

/// Loss used by the instance-level classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLossKind {
    #[default]
    Ce,
    /// Binary hinge loss on the instance logits.
    Svm,
}

/// `[model.clam]` parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClamConfig {
    /// `[embedding, attention hidden]` widths.
    pub size: Vec<usize>,
    pub gated: bool,
    pub dropout: f64,
    /// Instances sampled from each attention extreme for instance supervision.
    pub k_sample: usize,
    pub instance_eval: bool,
    pub instance_loss: InstanceLossKind,
    pub instance_loss_weight: f64,
    /// Also push other classes' top instances to negative.
    pub subtype: bool,
    /// Skip the ReLU after the feature projection.
    pub linear_feature: bool,
    pub attention_depth: usize,
    pub classifier_depth: usize,
}

impl Default for ClamConfig {
    fn default() -> Self {
        ClamConfig {
            size: vec![512, 256],
            gated: true,
            dropout: 0.25,
            k_sample: 8,
            instance_eval: true,
            instance_loss: InstanceLossKind::Ce,
            instance_loss_weight: 0.3,
            subtype: false,
            linear_feature: false,
            attention_depth: 1,
            classifier_depth: 1,
        }
    }
}

impl ClamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            self.size.len() == 2 && self.size.iter().all(|&s| s > 0),
            "model.clam.size must hold two positive widths",
        )?;
        check(self.k_sample > 0, "model.clam.k_sample must be > 0")?;
        check(
            (0.0..=1.0).contains(&self.instance_loss_weight),
            "model.clam.instance_loss_weight must be in [0, 1]",
        )?;
        check(self.attention_depth > 0, "model.clam.attention_depth must be >= 1")?;
        check(self.classifier_depth > 0, "model.clam.classifier_depth must be >= 1")?;
        check_dropout(self.dropout, "model.clam.dropout")
    }

    pub fn init<B: Backend>(&self, ctx: &ModelContext, device: &B::Device) -> Clam<B> {
        let size = self.size.first().copied().unwrap_or(512);
        let hidden = self.size.get(1).copied().unwrap_or(size / 2);
        Clam {
            multires: ctx
                .multires
                .as_ref()
                .map(|spec| spec.init(ctx.feature_size, device)),
            feature: LinearConfig::new(ctx.input_size(), size).init(device),
            feature_dropout: DropoutConfig::new(self.dropout).init(),
            attention_layers: fc_stack(
                size,
                &vec![size; self.attention_depth.saturating_sub(1)],
                self.dropout,
                device,
            ),
            attention: AttentionNetConfig::new(size, hidden)
                .with_gated(self.gated)
                .with_dropout(self.dropout)
                .init(device),
            classifier_layers: (1..self.classifier_depth)
                .map(|_| FcBlockConfig::new(size, size).with_dropout(self.dropout).init(device))
                .collect(),
            classifier: LinearConfig::new(size, ctx.n_classes).init(device),
            instance_classifiers: (0..ctx.n_classes)
                .map(|_| LinearConfig::new(size, 2).init(device))
                .collect(),
            settings: Ignored(InstanceSettings {
                k_sample: self.k_sample,
                enabled: self.instance_eval,
                loss: self.instance_loss,
                weight: self.instance_loss_weight,
                subtype: self.subtype,
                linear_feature: self.linear_feature,
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceSettings {
    k_sample: usize,
    enabled: bool,
    loss: InstanceLossKind,
    weight: f64,
    subtype: bool,
    linear_feature: bool,
}

/// Clustering-constrained attention MIL, single attention branch.
///
/// Besides the bag classifier, one binary instance classifier per class is
/// trained on the `k_sample` most and least attended instances.
#[derive(Module, Debug)]
pub struct Clam<B: Backend> {
    multires: Option<MultiresAggregator<B>>,
    feature: Linear<B>,
    feature_dropout: Dropout,
    attention_layers: Vec<FcBlock<B>>,
    attention: AttentionNet<B>,
    classifier_layers: Vec<FcBlock<B>>,
    classifier: Linear<B>,
    instance_classifiers: Vec<Linear<B>>,
    settings: Ignored<InstanceSettings>,
}

impl<B: Backend> Clam<B> {
    /// Loss of one instance classifier on `k` selected instances that all
    /// share `target` (1 = in class, 0 = out of class).
    fn instance_term(&self, classifier: &Linear<B>, instances: Tensor<B, 2>, target: usize) -> Tensor<B, 1> {
        let logits = classifier.forward(instances);
        let [k, _] = logits.dims();
        let device = logits.device();
        match self.settings.0.loss {
            InstanceLossKind::Ce => {
                let targets = if target == 1 {
                    Tensor::<B, 1, Int>::ones([k], &device)
                } else {
                    Tensor::<B, 1, Int>::zeros([k], &device)
                };
                CrossEntropyLossConfig::new()
                    .init(&device)
                    .forward(logits, targets)
            }
            InstanceLossKind::Svm => {
                let correct = logits.clone().slice([0..k, target..target + 1]);
                let other = logits.slice([0..k, 1 - target..2 - target]);
                (other - correct)
                    .add_scalar(1.0)
                    .clamp_min(0.0)
                    .mean()
            }
        }
    }

    fn instance_loss(&self, h: Tensor<B, 2>, attention: Tensor<B, 2>, label: usize) -> Tensor<B, 1> {
        let [n, _] = h.dims();
        let k = self.settings.0.k_sample.min(n).max(1);
        let order = attention.detach().reshape([n]).argsort_descending(0);
        let top = order.clone().slice([0..k]);
        let bottom = order.slice([n - k..n]);

        let mut total: Option<Tensor<B, 1>> = None;
        for (class, classifier) in self.instance_classifiers.iter().enumerate() {
            let term = if class == label {
                let positive = self.instance_term(classifier, h.clone().select(0, top.clone()), 1);
                let negative = self.instance_term(classifier, h.clone().select(0, bottom.clone()), 0);
                positive + negative
            } else if self.settings.0.subtype {
                self.instance_term(classifier, h.clone().select(0, top.clone()), 0)
            } else {
                continue;
            };
            total = Some(match total {
                Some(sum) => sum + term,
                None => term,
            });
        }

        let total = total.unwrap_or_else(|| Tensor::zeros([1], &h.device()));
        if self.settings.0.subtype {
            total.div_scalar(self.instance_classifiers.len() as f64)
        } else {
            total
        }
    }
}

impl<B: Backend> MilNetwork<B> for Clam<B> {
    fn forward(&self, features: Vec<Tensor<B, 2>>, label: Option<usize>) -> MilOutput<B> {
        let h = self.feature.forward(merge_resolutions(&self.multires, features));
        let h = if self.settings.0.linear_feature {
            h
        } else {
            burn::tensor::activation::relu(h)
        };
        let h = self.feature_dropout.forward(h);

        let mut a = h.clone();
        for layer in &self.attention_layers {
            a = layer.forward(a);
        }
        let scores = self.attention.forward(a);
        let (pooled, weights) = attention_pool(scores, h.clone());

        let mut z = pooled;
        for layer in &self.classifier_layers {
            z = layer.forward(z);
        }
        let logits = self.classifier.forward(z);

        match label {
            Some(label) if self.settings.0.enabled && label < self.instance_classifiers.len() => {
                let weight = self.settings.0.weight;
                let loss = self.instance_loss(h, weights, label).mul_scalar(weight);
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
    let network = config.clam.init::<B>(ctx, device);
    into_trainable(ModelFamily::Clam, network, &config.clam, config, ctx, device)
}

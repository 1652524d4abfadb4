use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::TensorData;

/// Attention scoring network shared by the attention-pooling families.
///
/// ```text
/// a = tanh(W_a h)
/// b = sigmoid(W_b h)      (gated only)
/// scores = W_c (a * b)    [n_instances, branches]
/// ```
#[derive(Module, Debug)]
pub struct AttentionNet<B: Backend> {
    attention_a: Linear<B>,
    attention_b: Option<Linear<B>>,
    attention_c: Linear<B>,
    dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct AttentionNetConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    #[config(default = 1)]
    pub branches: usize,
    #[config(default = true)]
    pub gated: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl AttentionNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionNet<B> {
        AttentionNet {
            attention_a: LinearConfig::new(self.input_size, self.hidden_size).init(device),
            attention_b: self
                .gated
                .then(|| LinearConfig::new(self.input_size, self.hidden_size).init(device)),
            attention_c: LinearConfig::new(self.hidden_size, self.branches).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> AttentionNet<B> {
    /// `[n, input_size] -> [n, branches]` unnormalised attention scores.
    pub fn forward(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let a = self.attention_a.forward(h.clone()).tanh();
        let a = match &self.attention_b {
            Some(gate) => a * sigmoid(gate.forward(h)),
            None => a,
        };
        self.attention_c.forward(self.dropout.forward(a))
    }
}

/// Softmax the scores over instances and pool the instance embeddings.
///
/// `scores` is `[n, K]`, `h` is `[n, d]`. Returns the pooled `[K, d]`
/// embeddings and the normalised `[K, n]` attention weights.
pub fn attention_pool<B: Backend>(
    scores: Tensor<B, 2>,
    h: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let weights = softmax(scores.transpose(), 1);
    let pooled = weights.clone().matmul(h);
    (pooled, weights)
}

/// Linear layer followed by ReLU and dropout.
#[derive(Module, Debug)]
pub struct FcBlock<B: Backend> {
    linear: Linear<B>,
    relu: Relu,
    dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct FcBlockConfig {
    pub input_size: usize,
    pub output_size: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl FcBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FcBlock<B> {
        FcBlock {
            linear: LinearConfig::new(self.input_size, self.output_size).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> FcBlock<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.dropout.forward(self.relu.forward(self.linear.forward(x)))
    }
}

/// Stack of [`FcBlock`]s through the given widths.
pub fn fc_stack<B: Backend>(
    input_size: usize,
    sizes: &[usize],
    dropout: f64,
    device: &B::Device,
) -> Vec<FcBlock<B>> {
    let mut blocks = Vec::with_capacity(sizes.len());
    let mut width = input_size;
    for &size in sizes {
        blocks.push(FcBlockConfig::new(width, size).with_dropout(dropout).init(device));
        width = size;
    }
    blocks
}

/// Max over instances, `[n, d] -> [1, d]`.
///
/// Reduces along the last dimension: the ndarray backend cannot backpropagate
/// a max over dimension 0.
pub fn max_over_instances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    x.transpose().max_dim(1).transpose()
}

/// Mean of the `k` largest values of every feature, `[n, d] -> [1, d]`.
pub fn top_k_mean<B: Backend>(x: Tensor<B, 2>, k: usize) -> Tensor<B, 2> {
    let [n, d] = x.dims();
    let k = k.clamp(1, n.max(1));
    x.transpose()
        .sort_descending(1)
        .slice([0..d, 0..k])
        .mean_dim(1)
        .transpose()
}

/// Class-index targets as an int tensor of shape `[n]`.
pub fn class_targets<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Tensor::from_data(
        TensorData::from(data.as_slice()).convert::<B::IntElem>(),
        device,
    )
}

/// Instance indices as an int tensor of shape `[n]`.
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    class_targets(indices, device)
}

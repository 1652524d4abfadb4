use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// How instance features from several resolutions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    Concat,
    Average,
    Max,
    /// Concatenate, then project back to the single-resolution width.
    Linear,
}

/// `[multires_aggregation]` section.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MultiresConfig {
    /// Data columns to combine. Absent means no aggregation.
    pub features: Option<Vec<String>>,
    pub method: AggregationMethod,
}

impl MultiresConfig {
    /// Resolve column names against the dataset's `data_cols`.
    ///
    /// Returns `None` when no features are configured, so every family
    /// receives the same answer.
    pub fn resolve(&self, data_cols: &[String]) -> Option<MultiresSpec> {
        let features = self.features.as_ref()?;
        let columns: Vec<usize> = features
            .iter()
            .filter_map(|name| data_cols.iter().position(|col| col == name))
            .collect();
        if columns.is_empty() {
            return None;
        }
        Some(MultiresSpec {
            columns,
            method: self.method,
        })
    }
}

/// Resolved aggregation parameters, shared by every family.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MultiresSpec {
    /// Indices into the bag's feature columns.
    pub columns: Vec<usize>,
    pub method: AggregationMethod,
}

impl MultiresSpec {
    /// Feature width after aggregation.
    pub fn output_size(&self, feature_size: usize) -> usize {
        match self.method {
            AggregationMethod::Concat => feature_size * self.columns.len(),
            _ => feature_size,
        }
    }

    pub fn init<B: Backend>(&self, feature_size: usize, device: &B::Device) -> MultiresAggregator<B> {
        let projection = matches!(self.method, AggregationMethod::Linear).then(|| {
            LinearConfig::new(feature_size * self.columns.len(), feature_size).init(device)
        });
        MultiresAggregator {
            columns: Ignored(self.columns.clone()),
            method: Ignored(self.method),
            projection,
        }
    }
}

/// Combines per-resolution instance features into one matrix.
#[derive(Module, Debug)]
pub struct MultiresAggregator<B: Backend> {
    columns: Ignored<Vec<usize>>,
    method: Ignored<AggregationMethod>,
    projection: Option<Linear<B>>,
}

impl<B: Backend> MultiresAggregator<B> {
    /// `features[c]` is `[n, d]`; rows must be aligned across columns.
    pub fn forward(&self, features: &[Tensor<B, 2>]) -> Tensor<B, 2> {
        let selected: Vec<Tensor<B, 2>> = self
            .columns
            .0
            .iter()
            .filter_map(|&c| features.get(c).cloned())
            .collect();
        match (self.method.0, &self.projection) {
            (AggregationMethod::Concat, _) => Tensor::cat(selected, 1),
            (AggregationMethod::Average, _) => {
                Tensor::stack::<3>(selected, 2).mean_dim(2).squeeze::<2>(2)
            }
            (AggregationMethod::Max, _) => {
                Tensor::stack::<3>(selected, 2).max_dim(2).squeeze::<2>(2)
            }
            (AggregationMethod::Linear, Some(projection)) => {
                projection.forward(Tensor::cat(selected, 1))
            }
            (AggregationMethod::Linear, None) => Tensor::cat(selected, 1),
        }
    }
}

/// Instance features for a model: aggregated when an aggregator is present,
/// otherwise the first column.
pub fn merge_resolutions<B: Backend>(
    aggregator: &Option<MultiresAggregator<B>>,
    mut features: Vec<Tensor<B, 2>>,
) -> Tensor<B, 2> {
    match aggregator {
        Some(aggregator) => aggregator.forward(&features),
        None => features.swap_remove(0),
    }
}

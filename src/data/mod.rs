//! Feature bags on disk and the loaders that batch them.

pub(crate) mod dataset;
mod encoding;
mod loader;
mod sampler;

pub use dataset::{BagBatch, BagItem, FeatureBagDataset, FeatureMatrix};
pub use encoding::{encode_bag, encode_matrix};
pub use loader::{BagLoader, DataLoaders};
pub use sampler::WeightedRandomSampler;

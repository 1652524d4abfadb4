use burn::prelude::*;
use burn::tensor::TensorData;

use crate::data::{BagItem, FeatureMatrix};

/// Encode one feature column as a `[rows, cols]` tensor.
pub fn encode_matrix<B: Backend>(matrix: &FeatureMatrix, device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_data(TensorData::from(matrix.values.as_slice()), device)
        .reshape([matrix.rows, matrix.cols])
}

/// Encode every column of a bag, in column order.
pub fn encode_bag<B: Backend>(bag: &BagItem, device: &B::Device) -> Vec<Tensor<B, 2>> {
    bag.features
        .iter()
        .map(|matrix| encode_matrix::<B>(matrix, device))
        .collect()
}

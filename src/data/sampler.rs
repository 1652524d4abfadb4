use std::collections::HashMap;

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;

use crate::data::FeatureBagDataset;
use crate::error::DataError;

/// Draws bag indices with replacement, each bag weighted by the inverse
/// frequency of its sampling-key value, so every group is drawn equally
/// often in expectation.
#[derive(Debug, Clone)]
pub struct WeightedRandomSampler {
    weights: Vec<f64>,
    distribution: WeightedIndex<f64>,
    num_samples: usize,
}

impl WeightedRandomSampler {
    pub fn from_key(dataset: &FeatureBagDataset, key: &str) -> Result<Self, DataError> {
        let values = dataset.sampling_values(key)?;
        Self::from_values(&values).ok_or_else(|| DataError::Empty(dataset.root().to_path_buf()))
    }

    /// `None` when `values` is empty.
    pub fn from_values(values: &[String]) -> Option<Self> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for value in values {
            *counts.entry(value.as_str()).or_default() += 1;
        }
        let weights: Vec<f64> = values
            .iter()
            .map(|v| 1.0 / counts[v.as_str()] as f64)
            .collect();
        let distribution = WeightedIndex::new(&weights).ok()?;
        Some(WeightedRandomSampler {
            weights,
            distribution,
            num_samples: values.len(),
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// One epoch of indices.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        (0..self.num_samples)
            .map(|_| self.distribution.sample(rng))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn values(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_inverse_frequency_weights() {
        let sampler = WeightedRandomSampler::from_values(&values(&["a", "a", "a", "b"])).unwrap();
        assert_eq!(sampler.weights(), &[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0, 1.0]);
        assert_eq!(sampler.num_samples(), 4);
    }

    #[test]
    fn test_empty_values() {
        assert!(WeightedRandomSampler::from_values(&[]).is_none());
    }

    #[test]
    fn test_groups_are_balanced() {
        let mut raw = vec!["majority"; 90];
        raw.extend(vec!["minority"; 10]);
        let sampler = WeightedRandomSampler::from_values(&values(&raw)).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut minority = 0;
        let mut total = 0;
        for _ in 0..50 {
            let draw = sampler.sample(&mut rng);
            assert_eq!(draw.len(), 100);
            minority += draw.iter().filter(|&&i| i >= 90).count();
            total += draw.len();
        }
        let share = minority as f64 / total as f64;
        assert!((0.4..0.6).contains(&share), "minority share {share}");
    }

    #[test]
    fn test_same_seed_same_draw() {
        let sampler = WeightedRandomSampler::from_values(&values(&["x", "y", "y"])).unwrap();
        let a = sampler.sample(&mut StdRng::seed_from_u64(3));
        let b = sampler.sample(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::config::{DatasetConfig, TrainerConfig};
use crate::data::{BagBatch, FeatureBagDataset, WeightedRandomSampler};
use crate::error::DataError;

/// Where a loader reads its bags from; kept so the loader can reload.
#[derive(Debug, Clone)]
struct BagSource {
    folder: PathBuf,
    data_cols: Vec<String>,
    base_label: i64,
    sampling_key: Option<String>,
    num_workers: usize,
}

impl BagSource {
    fn open(&self) -> Result<(FeatureBagDataset, Option<WeightedRandomSampler>), DataError> {
        let dataset =
            FeatureBagDataset::open(&self.folder, &self.data_cols, self.base_label, self.num_workers)?;
        let sampler = match &self.sampling_key {
            Some(key) => Some(WeightedRandomSampler::from_key(&dataset, key)?),
            None => None,
        };
        Ok((dataset, sampler))
    }
}

/// Batched iteration over a bag folder.
#[derive(Debug)]
pub struct BagLoader {
    source: BagSource,
    dataset: FeatureBagDataset,
    sampler: Option<WeightedRandomSampler>,
    batch_size: usize,
    shuffle: bool,
}

impl BagLoader {
    pub fn new(
        folder: &Path,
        data_cols: &[String],
        base_label: i64,
        sampling_key: Option<&str>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
    ) -> Result<Self, DataError> {
        let source = BagSource {
            folder: folder.to_path_buf(),
            data_cols: data_cols.to_vec(),
            base_label,
            sampling_key: sampling_key.map(str::to_string),
            num_workers,
        };
        let (dataset, sampler) = source.open()?;
        Ok(BagLoader {
            source,
            dataset,
            sampler,
            batch_size: batch_size.max(1),
            shuffle,
        })
    }

    pub fn dataset(&self) -> &FeatureBagDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.sampler.as_ref().map_or(self.dataset.len(), |s| s.num_samples());
        n.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the bag folder from disk.
    pub fn reload(&mut self) -> Result<(), DataError> {
        let (dataset, sampler) = self.source.open()?;
        info!(folder = %self.source.folder.display(), bags = dataset.len(), "reloaded bags");
        self.dataset = dataset;
        self.sampler = sampler;
        Ok(())
    }

    /// Bag indices for one epoch: weighted draws, a shuffle, or dataset order.
    pub fn epoch_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        if let Some(sampler) = &self.sampler {
            return sampler.sample(rng);
        }
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        order
    }

    /// One epoch of batches. With a batch size of one each bag is its own
    /// batch; larger batches go through [`FeatureBagDataset::collate`].
    pub fn epoch_batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<BagBatch<'_>> {
        let order = self.epoch_order(rng);
        if self.batch_size == 1 {
            return order
                .iter()
                .filter_map(|&i| self.dataset.get(i))
                .map(BagBatch::single)
                .collect();
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| self.dataset.collate(chunk))
            .collect()
    }
}

/// Train and validation loaders for one attempt.
#[derive(Debug)]
pub struct DataLoaders {
    pub train: BagLoader,
    pub val: BagLoader,
}

impl DataLoaders {
    /// Both loaders; validation never shuffles but uses the weighted sampler
    /// when a sampling key is set.
    pub fn from_config(dataset: &DatasetConfig, trainer: &TrainerConfig) -> Result<Self, DataError> {
        let sampling_key = dataset.sampling_key.as_deref();
        let train = BagLoader::new(
            &dataset.train_folder,
            &dataset.data_cols,
            dataset.base_label,
            sampling_key,
            trainer.batch_size,
            trainer.shuffle,
            trainer.num_workers,
        )?;
        let val = BagLoader::new(
            &dataset.val_folder,
            &dataset.data_cols,
            dataset.base_label,
            sampling_key,
            trainer.batch_size,
            false,
            trainer.num_workers,
        )?;
        for loader in [&train, &val] {
            loader
                .dataset()
                .check_schema(dataset.num_classes, dataset.feature_size, &dataset.data_cols)?;
        }
        info!(
            train_bags = train.dataset().len(),
            val_bags = val.dataset().len(),
            batch_size = trainer.batch_size,
            weighted = sampling_key.is_some(),
            "built data loaders"
        );
        Ok(DataLoaders { train, val })
    }
}

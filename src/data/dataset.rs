use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use rayon::prelude::*;
use tracing::debug;

use crate::error::DataError;

/// Row-major `[rows, cols]` instance features of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

/// One bag: a label plus one feature matrix per data column, in the order
/// the columns were requested.
#[derive(Debug, Clone)]
pub struct BagItem {
    pub name: String,
    /// Class index, already shifted by the base label.
    pub label: usize,
    pub features: Vec<FeatureMatrix>,
}

impl BagItem {
    pub fn n_instances(&self) -> usize {
        self.features.first().map_or(0, |f| f.rows)
    }
}

/// On-disk bag file.
#[derive(Debug, serde::Deserialize)]
struct BagFile {
    label: i64,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    features: HashMap<String, Vec<Vec<f32>>>,
}

/// Several bags handed to the trainer at once.
#[derive(Debug, Clone)]
pub struct BagBatch<'a> {
    pub bags: Vec<&'a BagItem>,
}

impl<'a> BagBatch<'a> {
    pub fn single(bag: &'a BagItem) -> Self {
        BagBatch { bags: vec![bag] }
    }

    pub fn len(&self) -> usize {
        self.bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.bags.iter().map(|b| b.label).collect()
    }
}

/// Every `*.json` bag in a folder, loaded into memory.
#[derive(Debug)]
pub struct FeatureBagDataset {
    root: PathBuf,
    paths: Vec<PathBuf>,
    items: Vec<BagItem>,
    metadata: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl FeatureBagDataset {
    /// Read every bag under `folder`, using up to `num_workers` threads.
    pub fn open(
        folder: &Path,
        data_cols: &[String],
        base_label: i64,
        num_workers: usize,
    ) -> Result<Self, DataError> {
        if !folder.is_dir() {
            return Err(DataError::FolderNotFound(folder.to_path_buf()));
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(folder)
            .map_err(|e| DataError::BagRead {
                path: folder.to_path_buf(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(DataError::Empty(folder.to_path_buf()));
        }

        let workers = num_workers.clamp(1, paths.len());
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        let bags: Vec<_> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| read_bag(path, data_cols, base_label))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let (items, metadata): (Vec<_>, Vec<_>) = bags.into_iter().unzip();
        debug!(folder = %folder.display(), bags = items.len(), workers, "loaded bags");

        Ok(FeatureBagDataset {
            root: folder.to_path_buf(),
            paths,
            items,
            metadata,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BagItem> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[BagItem] {
        &self.items
    }

    /// Reject bags whose labels or feature widths do not fit the model.
    pub fn check_schema(&self, num_classes: usize, feature_size: usize, data_cols: &[String]) -> Result<(), DataError> {
        for (item, path) in self.items.iter().zip(&self.paths) {
            if item.label >= num_classes {
                return Err(DataError::LabelOutOfRange {
                    path: path.clone(),
                    label: item.label,
                    num_classes,
                });
            }
            for (matrix, column) in item.features.iter().zip(data_cols) {
                if matrix.cols != feature_size {
                    return Err(DataError::FeatureWidth {
                        path: path.clone(),
                        column: column.clone(),
                        expected: feature_size,
                        found: matrix.cols,
                    });
                }
            }
        }
        Ok(())
    }

    /// Per-bag value of a sampling key: the label for `"label"`, otherwise
    /// the metadata entry rendered as a string.
    pub fn sampling_values(&self, key: &str) -> Result<Vec<String>, DataError> {
        self.items
            .iter()
            .zip(&self.metadata)
            .zip(&self.paths)
            .map(|((item, meta), path)| {
                if key == "label" {
                    return Ok(item.label.to_string());
                }
                match meta.get(key) {
                    Some(serde_json::Value::String(s)) => Ok(s.clone()),
                    Some(value) => Ok(value.to_string()),
                    None => Err(DataError::MissingSamplingKey {
                        path: path.clone(),
                        key: key.to_string(),
                    }),
                }
            })
            .collect()
    }

    /// Merge the bags at `indices` into one batch. Bags keep their own
    /// instance counts.
    pub fn collate(&self, indices: &[usize]) -> BagBatch<'_> {
        BagBatch {
            bags: indices.iter().filter_map(|&i| self.items.get(i)).collect(),
        }
    }
}

fn read_bag(
    path: &Path,
    data_cols: &[String],
    base_label: i64,
) -> Result<(BagItem, serde_json::Map<String, serde_json::Value>), DataError> {
    let content = fs::read_to_string(path).map_err(|e| DataError::BagRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut file: BagFile = serde_json::from_str(&content).map_err(|e| DataError::BagParse {
        path: path.to_path_buf(),
        source: e,
    })?;

    if file.label < base_label {
        return Err(DataError::LabelBelowBase {
            path: path.to_path_buf(),
            label: file.label,
            base: base_label,
        });
    }

    let mut features = Vec::with_capacity(data_cols.len());
    for column in data_cols {
        let rows = file
            .features
            .remove(column)
            .ok_or_else(|| DataError::MissingColumn {
                path: path.to_path_buf(),
                column: column.clone(),
            })?;
        let cols = rows.first().map_or(0, Vec::len);
        if rows.is_empty() || cols == 0 || rows.iter().any(|r| r.len() != cols) {
            return Err(DataError::MalformedColumn {
                path: path.to_path_buf(),
                column: column.clone(),
            });
        }
        features.push(FeatureMatrix {
            rows: rows.len(),
            cols,
            values: rows.into_iter().flatten().collect(),
        });
    }
    if features.windows(2).any(|w| w[0].rows != w[1].rows) {
        return Err(DataError::MisalignedColumns {
            path: path.to_path_buf(),
        });
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let item = BagItem {
        name,
        label: (file.label - base_label) as usize,
        features,
    };
    Ok((item, file.metadata))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a bag with `n` instances of width `width` in each column.
    pub fn write_bag(dir: &Path, name: &str, label: i64, columns: &[&str], n: usize, width: usize, site: &str) {
        let features: serde_json::Map<String, serde_json::Value> = columns
            .iter()
            .map(|col| {
                let rows: Vec<Vec<f32>> = (0..n)
                    .map(|i| (0..width).map(|j| (i * width + j) as f32 * 0.01 + label as f32).collect())
                    .collect();
                (col.to_string(), serde_json::json!(rows))
            })
            .collect();
        let bag = serde_json::json!({
            "label": label,
            "metadata": { "site": site },
            "features": features,
        });
        fs::write(dir.join(format!("{name}.json")), bag.to_string()).unwrap();
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_open_reads_all_bags_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_bag(dir.path(), &format!("bag_{i}"), 1 + (i % 2) as i64, &["features"], 3, 4, "a");
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let ds = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 1, 3).unwrap();
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.get(0).unwrap().name, "bag_0");
        assert_eq!(ds.get(0).unwrap().label, 0);
        assert_eq!(ds.get(1).unwrap().label, 1);
        assert_eq!(ds.get(2).unwrap().features[0].rows, 3);
        assert_eq!(ds.get(2).unwrap().features[0].values.len(), 12);
        ds.check_schema(2, 4, &cols(&["features"])).unwrap();
    }

    #[test]
    fn test_worker_count_does_not_change_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let site = if i % 3 == 0 { "a" } else { "b" };
            write_bag(dir.path(), &format!("bag_{i:02}"), (i % 2) as i64, &["features"], 2, 3, site);
        }
        let names = |workers: usize| -> Vec<(String, usize)> {
            FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, workers)
                .unwrap()
                .items()
                .iter()
                .map(|item| (item.name.clone(), item.label))
                .collect()
        };
        let serial = names(1);
        assert_eq!(serial.len(), 12);
        assert_eq!(serial[0].0, "bag_00");
        assert_eq!(serial[11].0, "bag_11");
        assert_eq!(names(4), serial);
        assert_eq!(names(64), serial);

        let ds = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, 5).unwrap();
        assert_eq!(ds.sampling_values("site").unwrap()[3], "a");
    }

    #[test]
    fn test_parallel_read_reports_bad_bag() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_bag(dir.path(), &format!("bag_{i}"), 0, &["features"], 2, 3, "a");
        }
        fs::write(dir.path().join("bag_3.json"), "{ not json").unwrap();
        let err = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, 4).unwrap_err();
        assert!(matches!(err, DataError::BagParse { ref path, .. } if path.ends_with("bag_3.json")));
    }

    #[test]
    fn test_open_missing_and_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        let err = FeatureBagDataset::open(&dir.path().join("nope"), &cols(&["f"]), 0, 1).unwrap_err();
        assert!(matches!(err, DataError::FolderNotFound(_)));
        let err = FeatureBagDataset::open(dir.path(), &cols(&["f"]), 0, 1).unwrap_err();
        assert!(matches!(err, DataError::Empty(_)));
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        write_bag(dir.path(), "b", 0, &["features"], 2, 2, "a");
        let err = FeatureBagDataset::open(dir.path(), &cols(&["features", "context"]), 0, 1).unwrap_err();
        assert!(matches!(err, DataError::MissingColumn { ref column, .. } if column == "context"));
    }

    #[test]
    fn test_label_below_base() {
        let dir = tempfile::tempdir().unwrap();
        write_bag(dir.path(), "b", 0, &["features"], 2, 2, "a");
        let err = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 1, 1).unwrap_err();
        assert!(matches!(err, DataError::LabelBelowBase { label: 0, base: 1, .. }));
    }

    #[test]
    fn test_ragged_column() {
        let dir = tempfile::tempdir().unwrap();
        let bag = serde_json::json!({ "label": 0, "features": { "f": [[1.0, 2.0], [3.0]] } });
        fs::write(dir.path().join("b.json"), bag.to_string()).unwrap();
        let err = FeatureBagDataset::open(dir.path(), &cols(&["f"]), 0, 1).unwrap_err();
        assert!(matches!(err, DataError::MalformedColumn { .. }));
    }

    #[test]
    fn test_schema_checks() {
        let dir = tempfile::tempdir().unwrap();
        write_bag(dir.path(), "b", 3, &["features"], 2, 4, "a");
        let ds = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, 1).unwrap();
        assert!(matches!(
            ds.check_schema(2, 4, &cols(&["features"])),
            Err(DataError::LabelOutOfRange { label: 3, .. })
        ));
        assert!(matches!(
            ds.check_schema(4, 8, &cols(&["features"])),
            Err(DataError::FeatureWidth { found: 4, .. })
        ));
    }

    #[test]
    fn test_sampling_values() {
        let dir = tempfile::tempdir().unwrap();
        write_bag(dir.path(), "a", 0, &["features"], 1, 2, "north");
        write_bag(dir.path(), "b", 1, &["features"], 1, 2, "south");
        let ds = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, 2).unwrap();
        assert_eq!(ds.sampling_values("site").unwrap(), vec!["north", "south"]);
        assert_eq!(ds.sampling_values("label").unwrap(), vec!["0", "1"]);
        assert!(matches!(
            ds.sampling_values("scanner"),
            Err(DataError::MissingSamplingKey { .. })
        ));
    }

    #[test]
    fn test_collate_keeps_bag_sizes() {
        let dir = tempfile::tempdir().unwrap();
        write_bag(dir.path(), "a", 0, &["features"], 2, 2, "x");
        write_bag(dir.path(), "b", 1, &["features"], 5, 2, "x");
        let ds = FeatureBagDataset::open(dir.path(), &cols(&["features"]), 0, 1).unwrap();
        let batch = ds.collate(&[1, 0]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.labels(), vec![1, 0]);
        assert_eq!(batch.bags[0].n_instances(), 5);
    }
}

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::{ElementConversion, TensorData};

use crate::models::layers::class_targets;
use crate::training::callbacks::Monitor;

/// Rolling window over recent training losses plus the running epoch mean.
pub struct TrainingMetrics {
    losses: VecDeque<f32>,
    capacity: usize,
    epoch_sum: f64,
    epoch_count: usize,
    bags_seen: usize, // lifetime count, never capped
}

impl TrainingMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        TrainingMetrics {
            losses: VecDeque::with_capacity(capacity),
            capacity,
            epoch_sum: 0.0,
            epoch_count: 0,
            bags_seen: 0,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record_loss(&mut self, loss: f32) {
        self.bags_seen += 1;
        self.epoch_sum += loss as f64;
        self.epoch_count += 1;
        self.losses.push_back(loss);
        if self.losses.len() > self.capacity {
            self.losses.pop_front();
        }
    }

    /// Average loss over the last N bags.
    pub fn average_loss(&self, last_n: usize) -> f32 {
        let n = self.losses.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let sum: f32 = self.losses.iter().rev().take(n).sum();
        sum / n as f32
    }

    /// Mean loss since the last [`TrainingMetrics::start_epoch`].
    pub fn epoch_loss(&self) -> f64 {
        if self.epoch_count == 0 {
            return 0.0;
        }
        self.epoch_sum / self.epoch_count as f64
    }

    pub fn start_epoch(&mut self) {
        self.epoch_sum = 0.0;
        self.epoch_count = 0;
    }

    /// Bags trained on since construction. Optimizer updates are counted by
    /// the global step.
    pub fn bags_seen(&self) -> usize {
        self.bags_seen
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-bag timing for the training loop.
pub struct TimingMetrics {
    bag_micros: VecDeque<u32>,
    capacity: usize,
    window_start: Instant,
    window_count: usize,
    window_overhead_micros: u128, // validation/checkpoint time excluded from throughput
}

impl TimingMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        TimingMetrics {
            bag_micros: VecDeque::with_capacity(capacity),
            capacity,
            window_start: Instant::now(),
            window_count: 0,
            window_overhead_micros: 0,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record_bag_time(&mut self, d: Duration) {
        self.bag_micros.push_back(d.as_micros().min(u32::MAX as u128) as u32);
        if self.bag_micros.len() > self.capacity {
            self.bag_micros.pop_front();
        }
        self.window_count += 1;
    }

    /// Record time spent validating or saving so it is excluded from the
    /// throughput window.
    pub fn record_overhead(&mut self, d: Duration) {
        self.window_overhead_micros += d.as_micros();
    }

    /// Mean of the last `last_n` bag times in milliseconds.
    pub fn avg_bag_ms(&self, last_n: usize) -> f32 {
        let n = self.bag_micros.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let mean = self
            .bag_micros
            .iter()
            .rev()
            .take(n)
            .map(|&v| v as f64)
            .sum::<f64>()
            / n as f64;
        (mean / 1000.0) as f32
    }

    /// Bags per second since the last `reset_window` call.
    pub fn bags_per_sec(&self) -> f32 {
        let total_micros = self.window_start.elapsed().as_micros();
        let net_micros = total_micros.saturating_sub(self.window_overhead_micros);
        if net_micros == 0 {
            return 0.0;
        }
        self.window_count as f32 / (net_micros as f32 / 1_000_000.0)
    }

    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_count = 0;
        self.window_overhead_micros = 0;
    }
}

impl Default for TimingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one pass over the validation loader.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ValidationMetrics {
    /// Mean cross-entropy over bags.
    pub loss: f64,
    pub accuracy: f64,
    /// Mean recall over the classes present in the labels.
    pub balanced_accuracy: f64,
    /// Recall per class; `None` for classes with no bags.
    pub per_class_recall: Vec<Option<f64>>,
    /// Number of bags evaluated.
    pub n: usize,
}

impl ValidationMetrics {
    /// Score bag logits against their labels. The loss is burn's
    /// cross-entropy, evaluated on `device`.
    pub fn from_logits<B: Backend>(
        logits: &[Vec<f32>],
        labels: &[usize],
        n_classes: usize,
        device: &B::Device,
    ) -> Self {
        let loss = bag_cross_entropy::<B>(logits, labels, device);
        Self::score(loss, logits, labels, n_classes)
    }

    /// Accuracy and recall bookkeeping around an already computed loss.
    pub fn score(loss: f64, logits: &[Vec<f32>], labels: &[usize], n_classes: usize) -> Self {
        let n = logits.len().min(labels.len());
        if n == 0 {
            return ValidationMetrics {
                loss: 0.0,
                accuracy: 0.0,
                balanced_accuracy: 0.0,
                per_class_recall: vec![None; n_classes],
                n: 0,
            };
        }

        let mut correct = 0usize;
        let mut hits = vec![0usize; n_classes];
        let mut totals = vec![0usize; n_classes];

        for (row, &label) in logits.iter().zip(labels) {
            let predicted = argmax(row);
            if let Some(total) = totals.get_mut(label) {
                *total += 1;
            }
            if predicted == label {
                correct += 1;
                if let Some(hit) = hits.get_mut(label) {
                    *hit += 1;
                }
            }
        }

        let per_class_recall: Vec<Option<f64>> = hits
            .iter()
            .zip(&totals)
            .map(|(&h, &t)| (t > 0).then(|| h as f64 / t as f64))
            .collect();
        let present: Vec<f64> = per_class_recall.iter().flatten().copied().collect();
        let balanced_accuracy = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };

        ValidationMetrics {
            loss,
            accuracy: correct as f64 / n as f64,
            balanced_accuracy,
            per_class_recall,
            n,
        }
    }

    pub fn monitored(&self, monitor: Monitor) -> f64 {
        match monitor {
            Monitor::ValLoss => self.loss,
            Monitor::ValAccuracy => self.accuracy,
        }
    }

    /// Named scalars as handed to metric loggers.
    pub fn scalars(&self) -> Vec<(String, f64)> {
        let mut scalars = vec![
            ("val_loss".to_string(), self.loss),
            ("val_accuracy".to_string(), self.accuracy),
            ("val_balanced_accuracy".to_string(), self.balanced_accuracy),
        ];
        for (class, recall) in self.per_class_recall.iter().enumerate() {
            if let Some(recall) = recall {
                scalars.push((format!("val_recall_{class}"), *recall));
            }
        }
        scalars
    }

    /// Two-column table of every scalar.
    pub fn table(&self) -> String {
        let scalars = self.scalars();
        let width = scalars.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:>10}", "metric", "value");
        let _ = writeln!(out, "{}", "-".repeat(width + 12));
        for (name, value) in scalars {
            let _ = writeln!(out, "{name:<width$}  {value:>10.4}");
        }
        out
    }
}

/// Mean cross-entropy of bag logits against class labels.
///
/// Infinite when a row's width disagrees with the first row or a label has
/// no logit.
pub fn bag_cross_entropy<B: Backend>(logits: &[Vec<f32>], labels: &[usize], device: &B::Device) -> f64 {
    let n = logits.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let (logits, labels) = (&logits[..n], &labels[..n]);
    let width = logits.first().map_or(0, Vec::len);
    if width == 0
        || logits.iter().any(|row| row.len() != width)
        || labels.iter().any(|&label| label >= width)
    {
        return f64::INFINITY;
    }

    let flat: Vec<f32> = logits.iter().flatten().copied().collect();
    let logits = Tensor::<B, 2>::from_data(
        TensorData::new(flat, [n, width]).convert::<B::FloatElem>(),
        device,
    );
    let targets = class_targets::<B>(labels, device);
    CrossEntropyLossConfig::new()
        .init(device)
        .forward(logits, targets)
        .into_scalar()
        .elem::<f64>()
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn metrics(logits: &[Vec<f32>], labels: &[usize], n_classes: usize) -> ValidationMetrics {
        ValidationMetrics::from_logits::<TestBackend>(logits, labels, n_classes, &Default::default())
    }

    #[test]
    fn test_average_loss() {
        let mut m = TrainingMetrics::new();
        m.record_loss(1.0);
        m.record_loss(3.0);
        assert!((m.average_loss(10) - 2.0).abs() < 1e-6);
        assert!((m.average_loss(1) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_epoch_loss_resets() {
        let mut m = TrainingMetrics::with_capacity(2);
        m.record_loss(2.0);
        m.record_loss(4.0);
        assert!((m.epoch_loss() - 3.0).abs() < 1e-9);
        m.start_epoch();
        assert_eq!(m.epoch_loss(), 0.0);
        m.record_loss(1.0);
        assert_eq!(m.bags_seen(), 3);
        assert!((m.average_loss(10) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_timing_avg_bag_ms_last_n() {
        let mut t = TimingMetrics::new();
        t.record_bag_time(Duration::from_micros(1000));
        t.record_bag_time(Duration::from_micros(9000));
        t.record_bag_time(Duration::from_micros(5000));
        assert!((t.avg_bag_ms(1) - 5.0).abs() < 1e-3);
        assert!((t.avg_bag_ms(100) - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_overhead_excluded_from_throughput() {
        let mut t = TimingMetrics::new();
        for _ in 0..10 {
            t.record_bag_time(Duration::from_micros(1000));
        }
        t.record_overhead(Duration::from_secs(9999));
        assert_eq!(t.bags_per_sec(), 0.0);

        t.reset_window();
        t.record_bag_time(Duration::from_micros(1000));
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.bags_per_sec() > 0.0);
    }

    #[test]
    fn test_validation_metrics() {
        let logits = vec![
            vec![2.0, 0.0],
            vec![0.0, 2.0],
            vec![3.0, 0.0],
            vec![0.0, 1.0],
        ];
        let labels = vec![0, 1, 1, 1];
        let m = metrics(&logits, &labels, 3);
        assert_eq!(m.n, 4);
        assert!((m.accuracy - 0.75).abs() < 1e-9);
        assert_eq!(m.per_class_recall[0], Some(1.0));
        assert!((m.per_class_recall[1].unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.per_class_recall[2], None);
        assert!((m.balanced_accuracy - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-9);
        assert!(m.loss > 0.0);
        assert_eq!(m.monitored(Monitor::ValAccuracy), m.accuracy);
    }

    #[test]
    fn test_cross_entropy_matches_closed_form() {
        let device = Default::default();
        let uniform = bag_cross_entropy::<TestBackend>(&[vec![0.0, 0.0]], &[1], &device);
        assert!((uniform - 2f64.ln()).abs() < 1e-6);

        // Mean over bags: -ln softmax([2, 0])[0] and -ln softmax([0, 0])[1].
        let confident = (1.0 + (-2f64).exp()).ln();
        let mean = bag_cross_entropy::<TestBackend>(&[vec![2.0, 0.0], vec![0.0, 0.0]], &[0, 1], &device);
        assert!((mean - (confident + 2f64.ln()) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_matches_training_loss() {
        let device = Default::default();
        let row = vec![0.3f32, -1.2, 0.8];
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.3, -1.2, 0.8]], &device);
        let training: f64 = crate::models::networks::repeated_label_loss(logits, 2)
            .into_scalar()
            .elem();
        let validation = bag_cross_entropy::<TestBackend>(&[row], &[2], &device);
        assert!((training - validation).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_rejects_missing_logit() {
        let device = Default::default();
        let loss = bag_cross_entropy::<TestBackend>(&[vec![0.0, 1.0]], &[2], &device);
        assert!(loss.is_infinite());
        let ragged = bag_cross_entropy::<TestBackend>(&[vec![0.0, 1.0], vec![0.0]], &[0, 0], &device);
        assert!(ragged.is_infinite());
    }

    #[test]
    fn test_empty_validation() {
        let m = metrics(&[], &[], 2);
        assert_eq!(m.n, 0);
        assert_eq!(m.per_class_recall, vec![None, None]);
    }

    #[test]
    fn test_scalars_and_table() {
        let m = metrics(&[vec![1.0, 0.0]], &[0], 2);
        let names: Vec<String> = m.scalars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["val_loss", "val_accuracy", "val_balanced_accuracy", "val_recall_0"]
        );
        assert!(m.table().contains("val_balanced_accuracy"));
    }
}

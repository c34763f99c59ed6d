//! Evaluation metrics for classification models, including the critical-class safety check.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::ConfigError;
use crate::dataset::ClassSet;
use crate::report::{ReportSink, Warning};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Confusion matrix for a `K`-class classifier.
pub struct ConfusionMatrix {
    /// Number of classes.
    pub n_classes: usize,
    /// Row-major `KxK` counts (`truth * K + predicted`).
    pub counts: Vec<u32>,
}

impl ConfusionMatrix {
    /// Create an empty `KxK` confusion matrix.
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            counts: vec![0; n_classes * n_classes],
        }
    }

    pub fn add(&mut self, truth: usize, predicted: usize) {
        if truth >= self.n_classes || predicted >= self.n_classes {
            return;
        }
        let idx = truth * self.n_classes + predicted;
        self.counts[idx] = self.counts[idx].saturating_add(1);
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u32 {
        self.counts[truth * self.n_classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| *c as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Precision/recall statistics for a single class.
pub struct PerClassStats {
    /// `TP / (TP + FP)`.
    pub precision: f64,
    /// `TP / (TP + FN)`.
    pub recall: f64,
    pub f1: f64,
    /// Total number of true examples for the class.
    pub support: u32,
    /// Number of times the class was predicted.
    pub predicted: u32,
}

/// Compute per-class precision, recall and F1 from a confusion matrix.
pub fn precision_recall_by_class(cm: &ConfusionMatrix) -> Vec<PerClassStats> {
    let k = cm.n_classes;
    let mut stats = Vec::with_capacity(k);
    for class_idx in 0..k {
        let tp = cm.get(class_idx, class_idx) as f64;
        let mut support = 0u32;
        let mut predicted = 0u32;
        for j in 0..k {
            support = support.saturating_add(cm.get(class_idx, j));
            predicted = predicted.saturating_add(cm.get(j, class_idx));
        }
        let precision = if predicted == 0 { 0.0 } else { tp / predicted as f64 };
        let recall = if support == 0 { 0.0 } else { tp / support as f64 };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        stats.push(PerClassStats {
            precision,
            recall,
            f1,
            support,
            predicted,
        });
    }
    stats
}

/// Compute overall accuracy from a confusion matrix.
pub fn accuracy(cm: &ConfusionMatrix) -> f64 {
    let total = cm.total();
    if total == 0 {
        return 0.0;
    }
    let correct: u64 = (0..cm.n_classes).map(|c| cm.get(c, c) as u64).sum();
    correct as f64 / total as f64
}

/// Mean recall over the classes present in the ground truth.
pub fn balanced_accuracy(stats: &[PerClassStats]) -> f64 {
    mean(stats.iter().filter(|s| s.support > 0).map(|s| s.recall))
}

/// One-vs-rest ROC AUC via the rank statistic, with average ranks for ties.
///
/// Returns `None` when either the positive or the negative set is empty.
pub fn binary_auc(scores: &[f32], positive: &[bool]) -> Option<f64> {
    let n_pos = positive.iter().filter(|p| **p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut rank_sum_pos = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied scores share the average rank.
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if positive[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }
    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Named scalar metrics from one evaluation pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    values: BTreeMap<String, f64>,
    critical_class: String,
    /// Critical-class sensitivity fell below the configured threshold.
    pub safety_alert: bool,
    pub confusion: ConfusionMatrix,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn critical_class(&self) -> &str {
        &self.critical_class
    }

    pub fn accuracy(&self) -> f64 {
        self.value("accuracy")
    }

    pub fn balanced_accuracy(&self) -> f64 {
        self.value("balanced_accuracy")
    }

    pub fn f1_macro(&self) -> f64 {
        self.value("f1_macro")
    }

    pub fn critical_sensitivity(&self) -> f64 {
        self.value(&format!("{}_sensitivity", self.critical_class))
    }

    fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }
}

/// Computes [`MetricsSnapshot`]s for a fixed class set and critical class.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    classes: ClassSet,
    critical_idx: usize,
    threshold: f64,
}

impl MetricsCalculator {
    pub fn new(classes: ClassSet, critical_class: &str, threshold: f64) -> Result<Self, ConfigError> {
        let critical_idx = classes.index_of(critical_class).ok_or_else(|| {
            ConfigError::invalid(
                "safety.critical_class",
                format!("'{critical_class}' is not a known class"),
            )
        })?;
        Ok(Self {
            classes,
            critical_idx,
            threshold,
        })
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn critical_class(&self) -> &str {
        self.classes.name(self.critical_idx).unwrap_or_default()
    }

    /// Build a snapshot from predictions, ground truth and per-class probabilities.
    ///
    /// Undefined AUCs and safety threshold misses are reported through `sink`.
    pub fn compute(
        &self,
        predicted: &[usize],
        truth: &[usize],
        probabilities: &[Vec<f32>],
        sink: &mut dyn ReportSink,
    ) -> MetricsSnapshot {
        let k = self.classes.len();
        let mut cm = ConfusionMatrix::new(k);
        for (&t, &p) in truth.iter().zip(predicted) {
            cm.add(t, p);
        }
        let stats = precision_recall_by_class(&cm);
        let mut values = BTreeMap::new();

        values.insert("accuracy".to_string(), accuracy(&cm));
        values.insert("balanced_accuracy".to_string(), balanced_accuracy(&stats));

        // Macro averages follow the labels seen in truth or predictions.
        let seen: Vec<&PerClassStats> = stats
            .iter()
            .filter(|s| s.support > 0 || s.predicted > 0)
            .collect();
        values.insert("f1_macro".to_string(), mean(seen.iter().map(|s| s.f1)));
        let total_support: u32 = stats.iter().map(|s| s.support).sum();
        let f1_weighted = if total_support == 0 {
            0.0
        } else {
            stats
                .iter()
                .map(|s| s.f1 * s.support as f64)
                .sum::<f64>()
                / total_support as f64
        };
        values.insert("f1_weighted".to_string(), f1_weighted);
        for (name, s) in self.classes.names().iter().zip(&stats) {
            values.insert(format!("f1_{name}"), s.f1);
        }

        let critical = self.critical_class().to_string();
        let crit = &stats[self.critical_idx];
        values.insert(format!("{critical}_sensitivity"), crit.recall);
        values.insert(format!("{critical}_precision"), crit.precision);
        values.insert(format!("{critical}_f1"), crit.f1);

        let aucs = self.one_vs_rest_aucs(truth, probabilities);
        let mut defined = Vec::new();
        for (idx, auc) in aucs.iter().enumerate() {
            match auc {
                Some(value) => defined.push(*value),
                None => sink.warn(Warning::MetricComputation {
                    metric: format!("auc_roc_{}", self.classes.name(idx).unwrap_or_default()),
                    reason: "class needs both positive and negative samples; excluded from macro AUC"
                        .to_string(),
                }),
            }
        }
        values.insert("auc_roc_macro".to_string(), mean(defined.into_iter()));
        values.insert(
            format!("auc_roc_{critical}"),
            aucs.get(self.critical_idx).copied().flatten().unwrap_or(0.0),
        );

        let safety_alert = crit.recall < self.threshold;
        if safety_alert {
            sink.warn(Warning::SafetyThreshold {
                class: critical.clone(),
                sensitivity: crit.recall,
                threshold: self.threshold,
            });
        }

        MetricsSnapshot {
            values,
            critical_class: critical,
            safety_alert,
            confusion: cm,
        }
    }

    fn one_vs_rest_aucs(&self, truth: &[usize], probabilities: &[Vec<f32>]) -> Vec<Option<f64>> {
        (0..self.classes.len())
            .map(|class_idx| {
                let scores: Vec<f32> = probabilities
                    .iter()
                    .map(|p| p.get(class_idx).copied().unwrap_or(0.0))
                    .collect();
                let positive: Vec<bool> = truth.iter().map(|t| *t == class_idx).collect();
                binary_auc(&scores, &positive)
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum MetricsExportError {
    #[error("Failed to write metrics to {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("Failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Serialize)]
struct MetricRow<'a> {
    model: &'a str,
    split: &'a str,
    metric: &'a str,
    value: f64,
}

/// Write one `model,split,metric,value` row per metric.
pub fn write_metrics_csv(
    path: &Path,
    model_name: &str,
    split: &str,
    snapshot: &MetricsSnapshot,
) -> Result<(), MetricsExportError> {
    let mut writer = csv_writer(path)?;
    let csv_err = |source| MetricsExportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    for (metric, value) in snapshot.iter() {
        writer
            .serialize(MetricRow {
                model: model_name,
                split,
                metric,
                value,
            })
            .map_err(csv_err)?;
    }
    writer
        .serialize(MetricRow {
            model: model_name,
            split,
            metric: "safety_alert",
            value: if snapshot.safety_alert { 1.0 } else { 0.0 },
        })
        .map_err(csv_err)?;
    flush(writer, path)?;
    info!("Saved metrics to {}", path.display());
    Ok(())
}

/// Write the confusion matrix with truth rows and predicted columns.
pub fn write_confusion_csv(
    path: &Path,
    classes: &ClassSet,
    matrix: &ConfusionMatrix,
) -> Result<(), MetricsExportError> {
    let mut writer = csv_writer(path)?;
    let csv_err = |source| MetricsExportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut header = vec!["truth".to_string()];
    header.extend(classes.names().iter().cloned());
    writer.write_record(&header).map_err(csv_err)?;
    for truth in 0..matrix.n_classes {
        let mut row = vec![classes.name(truth).unwrap_or_default().to_string()];
        row.extend((0..matrix.n_classes).map(|p| matrix.get(truth, p).to_string()));
        writer.write_record(&row).map_err(csv_err)?;
    }
    flush(writer, path)
}

fn csv_writer(path: &Path) -> Result<csv::Writer<fs::File>, MetricsExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| MetricsExportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    csv::Writer::from_path(path).map_err(|source| MetricsExportError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn flush(mut writer: csv::Writer<fs::File>, path: &Path) -> Result<(), MetricsExportError> {
    writer.flush().map_err(|source| MetricsExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

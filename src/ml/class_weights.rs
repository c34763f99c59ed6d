//! Per-class loss weights and per-sample resampling weights from class frequency.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{ClassSet, Registry};
use crate::report::{ReportSink, Warning};

/// Decay used by [`ClassWeightMethod::EffectiveNumber`].
pub const EFFECTIVE_NUMBER_BETA: f64 = 0.9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeightMethod {
    /// `total / (num_classes * count[c])`.
    InverseFrequency,
    /// `(1 - beta) / (1 - beta^count[c])`.
    EffectiveNumber,
}

/// How class imbalance is corrected during training. The two are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceStrategy {
    /// Class weights in the loss, each sample seen once per epoch.
    #[default]
    LossWeights,
    /// Draw samples with replacement by `1 / count[class]`, uniform loss.
    Resample,
}

/// One non-negative weight per class, in class index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeightVector {
    classes: Vec<String>,
    weights: Vec<f32>,
}

impl ClassWeightVector {
    pub fn uniform(classes: &ClassSet) -> Self {
        Self {
            classes: classes.names().to_vec(),
            weights: vec![1.0; classes.len()],
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }

    pub fn get(&self, class: &str) -> Option<f32> {
        self.classes
            .iter()
            .position(|name| name == class)
            .map(|idx| self.weights[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.classes
            .iter()
            .map(String::as_str)
            .zip(self.weights.iter().copied())
    }
}

/// Derive loss weights from the training partition only.
///
/// A class with no training samples gets weight 1.0 and a
/// [`Warning::DegenerateClass`].
pub fn compute_class_weights(
    train: &Registry,
    classes: &ClassSet,
    method: ClassWeightMethod,
    sink: &mut dyn ReportSink,
) -> ClassWeightVector {
    let counts = train.class_counts(classes);
    let total: usize = counts.iter().sum();
    let k = classes.len().max(1) as f64;

    let mut weights = Vec::with_capacity(counts.len());
    for (idx, &count) in counts.iter().enumerate() {
        if count == 0 {
            sink.warn(Warning::DegenerateClass {
                class: classes.name(idx).unwrap_or_default().to_string(),
                reason: "0 training samples; class weight defaulted to 1.0".to_string(),
            });
            weights.push(1.0);
            continue;
        }
        let weight = match method {
            ClassWeightMethod::InverseFrequency => total as f64 / (k * count as f64),
            ClassWeightMethod::EffectiveNumber => {
                let effective = 1.0 - EFFECTIVE_NUMBER_BETA.powf(count as f64);
                (1.0 - EFFECTIVE_NUMBER_BETA) / effective
            }
        };
        weights.push(weight as f32);
    }

    let vector = ClassWeightVector {
        classes: classes.names().to_vec(),
        weights,
    };
    info!("Class weights ({method:?}):");
    for (class, weight) in vector.iter() {
        info!("  {class:6}: {weight:.4}");
    }
    vector
}

/// `1 / count[class]` for every sample, in registry order.
///
/// Samples whose label is outside `classes` get weight 0 and are never drawn.
pub fn sample_weights(train: &Registry, classes: &ClassSet) -> Vec<f64> {
    let counts = train.class_counts(classes);
    train
        .iter()
        .map(|sample| match classes.index_of(&sample.label) {
            Some(idx) if counts[idx] > 0 => 1.0 / counts[idx] as f64,
            _ => 0.0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::registry::sample;
    use crate::report::RunLog;

    fn registry(sizes: &[(&str, usize)]) -> Registry {
        Registry::from_samples(sizes.iter().flat_map(|(class, n)| {
            (0..*n).map(move |i| sample(&format!("{class}{i}"), "ham", class))
        }))
        .unwrap()
    }

    #[test]
    fn balanced_inverse_frequency_is_all_ones() {
        let classes = ClassSet::from_iter(["mel", "nv", "bcc"]);
        let train = registry(&[("mel", 5), ("nv", 5), ("bcc", 5)]);
        let mut log = RunLog::new();
        let weights =
            compute_class_weights(&train, &classes, ClassWeightMethod::InverseFrequency, &mut log);
        for w in weights.as_slice() {
            assert!((w - 1.0).abs() < 1e-6);
        }
        assert!(log.warnings().is_empty());
    }

    #[test]
    fn rare_class_gets_larger_inverse_weight() {
        let classes = ClassSet::from_iter(["nv", "mel"]);
        let train = registry(&[("nv", 9), ("mel", 1)]);
        let mut log = RunLog::new();
        let weights =
            compute_class_weights(&train, &classes, ClassWeightMethod::InverseFrequency, &mut log);
        assert!((weights.get("nv").unwrap() - 10.0 / 18.0).abs() < 1e-6);
        assert!((weights.get("mel").unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn empty_class_defaults_to_one_with_warning() {
        let classes = ClassSet::from_iter(["nv", "mel", "df"]);
        let train = registry(&[("nv", 4), ("mel", 2)]);
        let mut log = RunLog::new();
        for method in [
            ClassWeightMethod::InverseFrequency,
            ClassWeightMethod::EffectiveNumber,
        ] {
            let weights = compute_class_weights(&train, &classes, method, &mut log);
            assert_eq!(weights.as_slice().len(), 3);
            assert_eq!(weights.get("df"), Some(1.0));
        }
        assert_eq!(log.warnings().len(), 2);
        assert!(matches!(
            &log.warnings()[0],
            Warning::DegenerateClass { class, .. } if class == "df"
        ));
    }

    #[test]
    fn effective_number_discounts_large_classes() {
        let classes = ClassSet::from_iter(["nv", "mel"]);
        let train = registry(&[("nv", 100), ("mel", 1)]);
        let mut log = RunLog::new();
        let weights =
            compute_class_weights(&train, &classes, ClassWeightMethod::EffectiveNumber, &mut log);
        assert!((weights.get("mel").unwrap() - 1.0).abs() < 1e-4);
        let expected_nv = (1.0 - EFFECTIVE_NUMBER_BETA) / (1.0 - EFFECTIVE_NUMBER_BETA.powi(100));
        assert!((weights.get("nv").unwrap() as f64 - expected_nv).abs() < 1e-5);
        assert!(weights.get("nv").unwrap() < weights.get("mel").unwrap());
    }

    #[test]
    fn sample_weights_are_inverse_class_counts() {
        let classes = ClassSet::from_iter(["nv", "mel"]);
        let train = registry(&[("nv", 4), ("mel", 1)]);
        let weights = sample_weights(&train, &classes);
        assert_eq!(weights, vec![0.25, 0.25, 0.25, 0.25, 1.0]);
    }
}

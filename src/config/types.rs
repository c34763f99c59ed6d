use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dataset::{ClassSet, LabelSchema, SourceSpec, SplitRatios};
use crate::ml::class_weights::{ClassWeightMethod, ImbalanceStrategy};
use crate::ml::model::ModelKind;
use crate::ml::precision::Precision;

use super::ConfigError;

/// Fully typed run configuration, validated once by [`LabConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    pub paths: PathsConfig,
    pub dataset: DatasetConfig,
    pub split: SplitConfig,
    pub training: TrainingConfig,
    pub safety: SafetyConfig,
}

/// Filesystem layout for a run. Relative paths resolve against the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root containing per-source metadata tables and image folders.
    pub raw_dir: PathBuf,
    /// Destination for merged and partitioned metadata.
    pub processed_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Metrics, history and confusion matrices.
    pub results_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// The closed diagnosis class set, in index order.
    pub class_names: Vec<String>,
    /// Square edge length images are resized to before flattening.
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    /// Sources in authority order: the first source wins on duplicate ids.
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub tag: String,
    /// Metadata table, relative to `paths.raw_dir`.
    pub metadata: PathBuf,
    /// Image folder, relative to `paths.raw_dir`.
    pub image_dir: PathBuf,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    pub schema: LabelSchema,
    /// Spelling/abbreviation fixes applied after lower-casing (e.g. `ak -> akiec`).
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitConfig {
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub test_ratio: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub model: ModelKind,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub grad_clip_norm: f64,
    pub scheduler_factor: f64,
    pub scheduler_patience: usize,
    pub min_lr: f64,
    pub early_stopping_patience: usize,
    pub early_stopping_min_delta: f64,
    pub class_weighting: ClassWeightMethod,
    #[serde(default)]
    pub imbalance_strategy: ImbalanceStrategy,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Bounded prefetch depth, in batches.
    #[serde(default = "default_prefetch")]
    pub prefetch_batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyConfig {
    pub critical_class: String,
    #[serde(default = "default_sensitivity_threshold")]
    pub sensitivity_threshold: f64,
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_run_name() -> String {
    "classifier".to_string()
}

fn default_num_workers() -> usize {
    4
}

fn default_prefetch() -> usize {
    2
}

fn default_sensitivity_threshold() -> f64 {
    0.85
}

impl LabConfig {
    /// Check every cross-field constraint. Called by the loader; callers building
    /// configs in code should call it too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dataset.validate()?;
        self.split_ratios().validate()?;
        self.training.validate()?;

        let safety = &self.safety;
        if !self
            .dataset
            .class_names
            .iter()
            .any(|name| name == &safety.critical_class)
        {
            return Err(ConfigError::invalid(
                "safety.critical_class",
                format!("'{}' is not in dataset.class_names", safety.critical_class),
            ));
        }
        if !(0.0..=1.0).contains(&safety.sensitivity_threshold) {
            return Err(ConfigError::invalid(
                "safety.sensitivity_threshold",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }

    pub fn class_set(&self) -> ClassSet {
        ClassSet::new(self.dataset.class_names.clone())
    }

    pub fn split_ratios(&self) -> SplitRatios {
        SplitRatios {
            train: self.split.train_ratio,
            val: self.split.val_ratio,
            test: self.split.test_ratio,
        }
    }

    /// Source descriptions with paths resolved against `paths.raw_dir`.
    pub fn source_specs(&self) -> Vec<SourceSpec> {
        self.dataset
            .sources
            .iter()
            .map(|source| SourceSpec {
                tag: source.tag.clone(),
                metadata_path: self.paths.raw_dir.join(&source.metadata),
                image_dir: self.paths.raw_dir.join(&source.image_dir),
                image_extension: source.image_extension.clone(),
                schema: source.schema.clone(),
                renames: source.renames.clone(),
            })
            .collect()
    }

    /// Per-source image folders keyed by source tag.
    pub fn image_roots(&self) -> BTreeMap<String, PathBuf> {
        self.dataset
            .sources
            .iter()
            .map(|source| (source.tag.clone(), self.paths.raw_dir.join(&source.image_dir)))
            .collect()
    }
}

impl DatasetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.class_names.len() < 2 {
            return Err(ConfigError::invalid(
                "dataset.class_names",
                "at least two classes are required",
            ));
        }
        let mut seen = BTreeSet::new();
        for name in &self.class_names {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("dataset.class_names", "empty class name"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::invalid(
                    "dataset.class_names",
                    format!("duplicate class '{name}'"),
                ));
            }
        }
        if self.image_size == 0 {
            return Err(ConfigError::invalid("dataset.image_size", "must be > 0"));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(ConfigError::invalid("dataset.std", "must be > 0"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid(
                "dataset.sources",
                "at least one source is required",
            ));
        }
        let mut tags = BTreeSet::new();
        for source in &self.sources {
            if !tags.insert(source.tag.as_str()) {
                return Err(ConfigError::invalid(
                    "dataset.sources",
                    format!("duplicate source tag '{}'", source.tag),
                ));
            }
        }
        Ok(())
    }
}

impl TrainingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::invalid("training.epochs", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("training.batch_size", "must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid("training.learning_rate", "must be > 0"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid("training.weight_decay", "must be >= 0"));
        }
        if !(self.grad_clip_norm > 0.0) {
            return Err(ConfigError::invalid("training.grad_clip_norm", "must be > 0"));
        }
        if !(self.scheduler_factor > 0.0 && self.scheduler_factor < 1.0) {
            return Err(ConfigError::invalid(
                "training.scheduler_factor",
                "must be within (0, 1)",
            ));
        }
        if self.min_lr < 0.0 || self.min_lr > self.learning_rate {
            return Err(ConfigError::invalid(
                "training.min_lr",
                "must be within [0, learning_rate]",
            ));
        }
        if self.early_stopping_patience == 0 {
            return Err(ConfigError::invalid(
                "training.early_stopping_patience",
                "must be > 0",
            ));
        }
        if self.early_stopping_min_delta < 0.0 {
            return Err(ConfigError::invalid(
                "training.early_stopping_min_delta",
                "must be >= 0",
            ));
        }
        if self.prefetch_batches == 0 {
            return Err(ConfigError::invalid("training.prefetch_batches", "must be > 0"));
        }
        if let ModelKind::Mlp { hidden_size: 0 } = self.model {
            return Err(ConfigError::invalid("training.model.hidden_size", "must be > 0"));
        }
        if self.run_name.trim().is_empty() {
            return Err(ConfigError::invalid("training.run_name", "must not be empty"));
        }
        Ok(())
    }
}

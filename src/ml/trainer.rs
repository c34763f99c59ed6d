//! The sequential per-epoch training loop.
//!
//! Each epoch runs train, validate, schedule, checkpoint and stop-check phases in
//! that order on the calling thread. Only sample loading runs on other threads
//! (see [`BatchPipeline`]). Cancellation is honored between epochs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, LabConfig, TrainingConfig};
use crate::dataset::{ClassSet, DatasetError, Registry};
use crate::report::{EpochReport, ReportSink, Warning};

use super::checkpoint::{BestMetric, CheckpointError, CheckpointManager, CheckpointRecord, TrainingState};
use super::class_weights::{ImbalanceStrategy, compute_class_weights, sample_weights};
use super::early_stopping::{EarlyStopping, Mode};
use super::loader::{
    Batch, BatchPipeline, LabeledSamples, PipelineError, PipelineOptions, SampleLoader,
};
use super::loss::weighted_cross_entropy;
use super::metrics::{MetricsCalculator, MetricsExportError, MetricsSnapshot};
use super::model::{Classifier, ModelError, Param, argmax, build_classifier};
use super::optim::{AdamW, clip_grad_norm};
use super::precision::GradScaler;
use super::scheduler::ReduceLrOnPlateau;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Metrics(#[from] MetricsExportError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Sample '{sample_id}' has label '{label}' outside the class set")]
    UnknownLabel { sample_id: String, label: String },
    #[error("The {0} partition is empty")]
    EmptyPartition(&'static str),
    #[error("Cannot build the resampling distribution: {0}")]
    Resampling(#[from] rand::distr::weighted::Error),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Per-epoch curves, one entry per completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_balanced_accuracy: Vec<f64>,
    pub val_critical_sensitivity: Vec<f64>,
    pub val_f1_macro: Vec<f64>,
    pub learning_rate: Vec<f64>,
}

impl TrainingHistory {
    pub fn push(&mut self, report: &EpochReport) {
        self.train_loss.push(report.train_loss);
        self.train_accuracy.push(report.train_accuracy);
        self.val_loss.push(report.val_loss);
        self.val_balanced_accuracy.push(report.balanced_accuracy);
        self.val_critical_sensitivity.push(report.critical_sensitivity);
        self.val_f1_macro.push(report.f1_macro);
        self.learning_rate.push(report.learning_rate);
    }

    pub fn len(&self) -> usize {
        self.train_loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }

    pub fn write_json(&self, path: &Path) -> Result<(), TrainError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| TrainError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| TrainError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved training history to {}", path.display());
        Ok(())
    }
}

/// Loss and metrics of one evaluation pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epochs recorded in the history, including ones from before a resume.
    pub epochs_completed: usize,
    pub best_epoch: Option<usize>,
    pub best_balanced_accuracy: f64,
    pub stopped_early: bool,
    pub cancelled: bool,
}

struct TrainPhase {
    loss: f64,
    accuracy: f64,
}

/// Owns the model and every piece of loop state for one run.
pub struct Trainer {
    training: TrainingConfig,
    seed: u64,
    classes: ClassSet,
    model: Box<dyn Classifier>,
    optimizer: AdamW,
    state: TrainingState,
    checkpoints: CheckpointManager,
    metrics: MetricsCalculator,
    loader: Arc<dyn SampleLoader>,
    train: LabeledSamples,
    val: LabeledSamples,
    loss_weights: Vec<f32>,
    resampler: Option<WeightedIndex<f64>>,
    start_epoch: usize,
    cancel: Arc<AtomicBool>,
    history_path: PathBuf,
}

impl Trainer {
    /// Prepare a fresh run. Class weights come from `train` only.
    pub fn new(
        config: &LabConfig,
        train: &Registry,
        val: &Registry,
        loader: Arc<dyn SampleLoader>,
        sink: &mut dyn ReportSink,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        if train.is_empty() {
            return Err(TrainError::EmptyPartition("train"));
        }
        if val.is_empty() {
            return Err(TrainError::EmptyPartition("val"));
        }
        let training = config.training.clone();
        let classes = config.class_set();
        let train = labeled(train, &classes)?;
        let val = labeled(val, &classes)?;

        let train_registry = Registry::from_samples(train.samples().iter().cloned())?;
        let (loss_weights, resampler) = match training.imbalance_strategy {
            ImbalanceStrategy::LossWeights => {
                let weights = compute_class_weights(
                    &train_registry,
                    &classes,
                    training.class_weighting,
                    sink,
                );
                (weights.as_slice().to_vec(), None)
            }
            ImbalanceStrategy::Resample => {
                info!("Resampling with replacement by inverse class frequency; loss weights are uniform");
                let weights = sample_weights(&train_registry, &classes);
                (vec![1.0; classes.len()], Some(WeightedIndex::new(weights)?))
            }
        };

        let model = build_classifier(training.model, loader.input_len(), classes.len(), config.split.seed);
        let optimizer = AdamW::new(model.parameters(), training.learning_rate, training.weight_decay);
        let state = TrainingState {
            scheduler: ReduceLrOnPlateau::new(
                training.learning_rate,
                training.scheduler_factor,
                training.scheduler_patience,
                training.min_lr,
            ),
            early_stopping: EarlyStopping::new(
                Mode::Max,
                training.early_stopping_patience,
                training.early_stopping_min_delta,
            ),
            scaler: GradScaler::new(training.precision),
            best: BestMetric::default(),
            history: TrainingHistory::default(),
        };
        let checkpoints = CheckpointManager::new(&config.paths.checkpoint_dir, &training.run_name)?;
        let metrics = MetricsCalculator::new(
            classes.clone(),
            &config.safety.critical_class,
            config.safety.sensitivity_threshold,
        )?;
        let history_path = config
            .paths
            .results_dir
            .join(format!("{}_history.json", training.run_name));

        info!(
            "Trainer ready: model {}, {} train / {} val samples, {} classes, input {}",
            training.model,
            train.len(),
            val.len(),
            classes.len(),
            loader.input_len()
        );
        Ok(Self {
            training,
            seed: config.split.seed,
            classes,
            model,
            optimizer,
            state,
            checkpoints,
            metrics,
            loader,
            train,
            val,
            loss_weights,
            resampler,
            start_epoch: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            history_path,
        })
    }

    /// Rebuild the trainer and continue after the epoch stored in the latest checkpoint.
    pub fn resume(
        config: &LabConfig,
        train: &Registry,
        val: &Registry,
        loader: Arc<dyn SampleLoader>,
        sink: &mut dyn ReportSink,
    ) -> Result<Self, TrainError> {
        let mut trainer = Self::new(config, train, val, loader, sink)?;
        let record = trainer.checkpoints.load_latest()?;
        trainer.model.load_state(&record.model)?;
        if !record.optimizer.matches(trainer.model.parameters()) {
            return Err(ModelError::KindMismatch {
                expected: "optimizer state for the configured model".to_string(),
                found: "mismatched optimizer buffers".to_string(),
            }
            .into());
        }
        trainer.optimizer = record.optimizer;
        trainer.state = record.training;
        trainer.start_epoch = record.epoch + 1;
        info!(
            "Resuming '{}' after epoch {} (lr {:.3e})",
            trainer.training.run_name,
            trainer.start_epoch,
            trainer.optimizer.lr()
        );
        Ok(trainer)
    }

    /// Setting the flag stops the loop at the next epoch boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model(&self) -> &dyn Classifier {
        self.model.as_ref()
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.state.history
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.lr()
    }

    /// Run epochs until the configured maximum, early stopping or cancellation.
    pub fn fit(&mut self, sink: &mut dyn ReportSink) -> Result<TrainingSummary, TrainError> {
        let max_epochs = self.training.epochs;
        let mut stopped_early = self.state.early_stopping.stopped();
        let mut cancelled = false;
        let mut epoch = self.start_epoch;
        info!(
            "Training '{}' from epoch {} to {}",
            self.training.run_name,
            epoch + 1,
            max_epochs
        );

        while epoch < max_epochs && !stopped_early {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Cancellation requested; stopping before epoch {}", epoch + 1);
                cancelled = true;
                break;
            }
            let started = Instant::now();
            let learning_rate = self.optimizer.lr();

            let train = self.train_epoch(epoch, sink)?;
            let val = self.run_evaluation(&self.val, sink)?;

            let balanced_accuracy = val.metrics.balanced_accuracy();
            let next_lr = self.state.scheduler.step(balanced_accuracy);
            self.optimizer.set_lr(next_lr);

            let is_best = self.state.best.update(epoch, balanced_accuracy);
            stopped_early = self.state.early_stopping.step(balanced_accuracy);

            let report = EpochReport {
                epoch,
                max_epochs,
                train_loss: train.loss,
                train_accuracy: train.accuracy,
                val_loss: val.loss,
                balanced_accuracy,
                critical_sensitivity: val.metrics.critical_sensitivity(),
                f1_macro: val.metrics.f1_macro(),
                learning_rate,
                elapsed: started.elapsed(),
                is_best,
            };
            self.state.history.push(&report);
            self.checkpoints.save(&CheckpointRecord {
                epoch,
                model: self.model.state(),
                optimizer: self.optimizer.clone(),
                metrics: val.metrics,
                is_best,
                training: self.state.clone(),
            })?;
            sink.epoch(&report);
            if stopped_early {
                info!("Early stopping triggered at epoch {}", epoch + 1);
            }
            epoch += 1;
        }
        self.start_epoch = epoch;

        self.state.history.write_json(&self.history_path)?;
        let summary = TrainingSummary {
            epochs_completed: self.state.history.len(),
            best_epoch: self.state.best.epoch(),
            best_balanced_accuracy: self.state.best.value().unwrap_or(0.0),
            stopped_early,
            cancelled,
        };
        info!(
            "Training finished: best balanced accuracy {:.4} at epoch {}",
            summary.best_balanced_accuracy,
            summary.best_epoch.map(|e| e + 1).unwrap_or(0)
        );
        Ok(summary)
    }

    /// Restore the parameters of the best checkpoint of this run.
    pub fn load_best(&mut self) -> Result<(), TrainError> {
        let record = self.checkpoints.load_best()?;
        self.model.load_state(&record.model)?;
        info!("Loaded best model from epoch {}", record.epoch + 1);
        Ok(())
    }

    /// Loss and full metrics of the current model on any registry.
    pub fn evaluate(&self, registry: &Registry, sink: &mut dyn ReportSink) -> Result<Evaluation, TrainError> {
        let data = labeled(registry, &self.classes)?;
        self.run_evaluation(&data, sink)
    }

    fn train_epoch(&mut self, epoch: usize, sink: &mut dyn ReportSink) -> Result<TrainPhase, TrainError> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let n = self.train.len();
        let order: Vec<usize> = match &self.resampler {
            Some(dist) => (0..n).map(|_| dist.sample(&mut rng)).collect(),
            None => {
                let mut order: Vec<usize> = (0..n).collect();
                order.shuffle(&mut rng);
                order
            }
        };
        let pipeline = BatchPipeline::spawn(
            Arc::clone(&self.loader),
            &self.train,
            order,
            self.pipeline_options(),
        );

        let mut loss_sum = 0.0f64;
        let mut seen = 0usize;
        let mut correct = 0usize;
        for batch in pipeline {
            let batch = batch?;
            report_failures(&batch, sink);
            self.model.zero_grad();
            let logits = self.model.forward_train(&batch.inputs)?;
            let out = weighted_cross_entropy(&logits, &batch.targets, &self.loss_weights);

            let scale = self.state.scaler.scale();
            let scaled: Vec<Vec<f32>> = out
                .grad
                .iter()
                .map(|row| row.iter().map(|g| g * scale).collect())
                .collect();
            self.model.backward(&scaled);

            let stepped = optimizer_step(
                self.model.parameters_mut(),
                &mut self.state.scaler,
                &mut self.optimizer,
                self.training.grad_clip_norm,
            );
            if !stepped {
                sink.warn(Warning::NonFiniteGradients { epoch, scale });
            }

            loss_sum += out.loss * batch.len() as f64;
            seen += batch.len();
            correct += out
                .probabilities
                .iter()
                .zip(&batch.targets)
                .filter(|(probs, target)| argmax(probs) == **target)
                .count();
        }

        let seen_f = seen.max(1) as f64;
        Ok(TrainPhase {
            loss: loss_sum / seen_f,
            accuracy: correct as f64 / seen_f,
        })
    }

    fn run_evaluation(
        &self,
        data: &LabeledSamples,
        sink: &mut dyn ReportSink,
    ) -> Result<Evaluation, TrainError> {
        let pipeline = BatchPipeline::spawn(
            Arc::clone(&self.loader),
            data,
            (0..data.len()).collect(),
            self.pipeline_options(),
        );
        let mut loss_sum = 0.0f64;
        let mut predicted = Vec::with_capacity(data.len());
        let mut truth = Vec::with_capacity(data.len());
        let mut probabilities = Vec::with_capacity(data.len());
        for batch in pipeline {
            let batch = batch?;
            report_failures(&batch, sink);
            let logits = self.model.forward(&batch.inputs)?;
            let out = weighted_cross_entropy(&logits, &batch.targets, &self.loss_weights);
            loss_sum += out.loss * batch.len() as f64;
            predicted.extend(out.probabilities.iter().map(|p| argmax(p)));
            truth.extend_from_slice(&batch.targets);
            probabilities.extend(out.probabilities);
        }
        let metrics = self.metrics.compute(&predicted, &truth, &probabilities, sink);
        Ok(Evaluation {
            loss: loss_sum / truth.len().max(1) as f64,
            metrics,
        })
    }

    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.training.batch_size,
            num_workers: self.training.num_workers,
            prefetch_batches: self.training.prefetch_batches,
        }
    }
}

/// Unscale, check for overflow, clip, step, then update the scaler.
///
/// Clipping sees unscaled gradients, so `max_norm` means the same in both precisions.
/// Returns `false` when the step was skipped for non-finite gradients.
fn optimizer_step(
    params: &mut [Param],
    scaler: &mut GradScaler,
    optimizer: &mut AdamW,
    max_norm: f64,
) -> bool {
    if !scaler.unscale(params) {
        scaler.update(true);
        return false;
    }
    clip_grad_norm(params, max_norm);
    optimizer.step(params);
    scaler.update(false);
    true
}

fn labeled(registry: &Registry, classes: &ClassSet) -> Result<LabeledSamples, TrainError> {
    let mut targets = Vec::with_capacity(registry.len());
    for sample in registry {
        let idx = classes
            .index_of(&sample.label)
            .ok_or_else(|| TrainError::UnknownLabel {
                sample_id: sample.id.clone(),
                label: sample.label.clone(),
            })?;
        targets.push(idx);
    }
    Ok(LabeledSamples::new(registry.samples().to_vec(), targets))
}

fn report_failures(batch: &Batch, sink: &mut dyn ReportSink) {
    for failure in &batch.failures {
        sink.warn(Warning::SampleLoad {
            sample_id: failure.sample_id.clone(),
            reason: failure.reason.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::dataset::Sample;
    use crate::dataset::registry::sample;
    use crate::ml::loader::SampleLoadError;
    use crate::ml::optim::grad_norm;
    use crate::ml::precision::Precision;
    use crate::report::RunLog;
    use tempfile::{TempDir, tempdir};

    /// Two features: a noisy one-hot of the label, so classes are separable.
    struct FeatureLoader;

    impl SampleLoader for FeatureLoader {
        fn input_len(&self) -> usize {
            2
        }

        fn load(&self, sample: &Sample) -> Result<Vec<f32>, SampleLoadError> {
            let jitter = (sample.id.len() % 5) as f32 * 0.05;
            Ok(match sample.label.as_str() {
                "mel" => vec![1.0 + jitter, -jitter],
                _ => vec![-jitter, 1.0 + jitter],
            })
        }
    }

    fn config(dir: &TempDir, extra: &str) -> LabConfig {
        let root = dir.path().display();
        let text = format!(
            r#"
[paths]
raw_dir = "{root}/raw"
processed_dir = "{root}/processed"
checkpoint_dir = "{root}/checkpoints"
results_dir = "{root}/results"
log_dir = "{root}/logs"

[dataset]
class_names = ["mel", "nv"]
image_size = 4

[[dataset.sources]]
tag = "ham"
metadata = "meta.csv"
image_dir = "images"
schema = {{ kind = "single_column", id_column = "image_id", label_column = "dx" }}

[split]
train_ratio = 0.7
val_ratio = 0.15
test_ratio = 0.15
seed = 3

[training]
model = {{ kind = "linear" }}
epochs = 6
batch_size = 4
learning_rate = 0.05
weight_decay = 0.0
grad_clip_norm = 5.0
scheduler_factor = 0.5
scheduler_patience = 2
min_lr = 0.0001
early_stopping_patience = 10
early_stopping_min_delta = 0.0
class_weighting = "inverse_frequency"
num_workers = 2
{extra}

[safety]
critical_class = "mel"
"#
        );
        parse_config(&text, Path::new("test.toml"), dir.path()).unwrap()
    }

    fn registry(prefix: &str, mel: usize, nv: usize) -> Registry {
        Registry::from_samples(
            (0..mel)
                .map(|i| sample(&format!("{prefix}m{i}"), "ham", "mel"))
                .chain((0..nv).map(|i| sample(&format!("{prefix}n{i}"), "ham", "nv"))),
        )
        .unwrap()
    }

    #[test]
    fn learns_separable_classes_and_checkpoints() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "");
        let mut log = RunLog::new();
        let mut trainer = Trainer::new(
            &config,
            &registry("t", 6, 18),
            &registry("v", 3, 6),
            Arc::new(FeatureLoader),
            &mut log,
        )
        .unwrap();
        let summary = trainer.fit(&mut log).unwrap();

        assert_eq!(summary.epochs_completed, 6);
        assert!(!summary.cancelled);
        assert!(summary.best_balanced_accuracy > 0.99);
        assert_eq!(log.epochs().len(), 6);
        assert!(trainer.checkpoints().latest_path().is_file());
        assert!(trainer.checkpoints().best_path().is_file());
        assert!(dir.path().join("results/classifier_history.json").is_file());
        assert_eq!(trainer.history().train_loss.len(), 6);
        assert!(trainer.history().train_loss[5] < trainer.history().train_loss[0]);

        trainer.load_best().unwrap();
        let eval = trainer.evaluate(&registry("x", 2, 2), &mut log).unwrap();
        assert_eq!(eval.metrics.accuracy(), 1.0);
    }

    #[test]
    fn cancellation_stops_at_epoch_boundary() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "");
        let mut log = RunLog::new();
        let mut trainer = Trainer::new(
            &config,
            &registry("t", 4, 4),
            &registry("v", 2, 2),
            Arc::new(FeatureLoader),
            &mut log,
        )
        .unwrap();
        trainer.cancel_handle().store(true, Ordering::Relaxed);
        let summary = trainer.fit(&mut log).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.epochs_completed, 0);
        assert!(!trainer.checkpoints().has_latest());
    }

    #[test]
    fn resample_strategy_uses_uniform_loss_weights() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "imbalance_strategy = \"resample\"\nprecision = \"mixed\"");
        let mut log = RunLog::new();
        let mut trainer = Trainer::new(
            &config,
            &registry("t", 2, 14),
            &registry("v", 2, 4),
            Arc::new(FeatureLoader),
            &mut log,
        )
        .unwrap();
        assert_eq!(trainer.loss_weights, vec![1.0, 1.0]);
        assert!(trainer.resampler.is_some());
        let summary = trainer.fit(&mut log).unwrap();
        assert_eq!(summary.epochs_completed, 6);
    }

    fn params_with_grad(grad: &[f32]) -> Vec<Param> {
        vec![Param {
            name: "weight",
            values: vec![0.5; grad.len()],
            grad: grad.to_vec(),
        }]
    }

    #[test]
    fn mixed_precision_step_clips_unscaled_gradients() {
        let mut scaler = GradScaler::new(Precision::Mixed);
        let scale = scaler.scale();
        assert!(scale > 1.0);
        let mut params = params_with_grad(&[3.0 * scale, 4.0 * scale]);
        let mut optimizer = AdamW::new(&params, 0.01, 0.0);

        assert!(optimizer_step(&mut params, &mut scaler, &mut optimizer, 1.0));
        // The optimizer consumed unscaled gradients clipped to the configured norm.
        assert!((grad_norm(&params) - 1.0).abs() < 1e-5);
        assert!((params[0].grad[0] - 0.6).abs() < 1e-5);
        assert!((params[0].grad[1] - 0.8).abs() < 1e-5);
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn mixed_and_full_precision_take_the_same_step() {
        let mut full_scaler = GradScaler::new(Precision::Full);
        let mut full = params_with_grad(&[3.0, -4.0, 0.25]);
        let mut full_opt = AdamW::new(&full, 0.01, 0.01);

        let mut mixed_scaler = GradScaler::new(Precision::Mixed);
        let scale = mixed_scaler.scale();
        let mut mixed = params_with_grad(&[3.0 * scale, -4.0 * scale, 0.25 * scale]);
        let mut mixed_opt = AdamW::new(&mixed, 0.01, 0.01);

        assert!(optimizer_step(&mut full, &mut full_scaler, &mut full_opt, 2.0));
        assert!(optimizer_step(&mut mixed, &mut mixed_scaler, &mut mixed_opt, 2.0));
        assert_eq!(full[0].values, mixed[0].values);
        assert_ne!(full[0].values, vec![0.5; 3]);
    }

    #[test]
    fn non_finite_gradients_skip_the_step_and_back_off() {
        let mut scaler = GradScaler::new(Precision::Mixed);
        let scale = scaler.scale();
        let mut params = params_with_grad(&[f32::INFINITY, 1.0]);
        let mut optimizer = AdamW::new(&params, 0.01, 0.0);

        assert!(!optimizer_step(&mut params, &mut scaler, &mut optimizer, 1.0));
        assert_eq!(params[0].values, vec![0.5, 0.5]);
        assert_eq!(optimizer.steps(), 0);
        assert_eq!(scaler.scale(), scale * 0.5);
    }

    /// Panics on one training sample, killing its loader worker.
    struct CrashingLoader;

    impl SampleLoader for CrashingLoader {
        fn input_len(&self) -> usize {
            2
        }

        fn load(&self, sample: &Sample) -> Result<Vec<f32>, SampleLoadError> {
            if sample.id == "tn2" {
                panic!("decoder state corrupted");
            }
            FeatureLoader.load(sample)
        }
    }

    #[test]
    fn dead_loader_worker_fails_the_epoch() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "");
        let mut log = RunLog::new();
        let mut trainer = Trainer::new(
            &config,
            &registry("t", 4, 8),
            &registry("v", 2, 2),
            Arc::new(CrashingLoader),
            &mut log,
        )
        .unwrap();
        let err = trainer.fit(&mut log).unwrap_err();
        assert!(matches!(err, TrainError::Pipeline(ref e) if e.reason.contains("decoder state corrupted")));
        assert!(log.epochs().is_empty());
        assert!(!trainer.checkpoints().has_latest());
    }

    #[test]
    fn unknown_label_is_rejected_at_setup() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "");
        let mut log = RunLog::new();
        let train = Registry::from_samples([sample("a", "ham", "mel"), sample("b", "ham", "df")]).unwrap();
        let err = Trainer::new(
            &config,
            &train,
            &registry("v", 1, 1),
            Arc::new(FeatureLoader),
            &mut log,
        )
        .err()
        .unwrap();
        assert!(matches!(err, TrainError::UnknownLabel { ref label, .. } if label == "df"));
    }

    #[test]
    fn empty_class_in_train_keeps_weight_one() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "");
        let mut log = RunLog::new();
        let trainer = Trainer::new(
            &config,
            &registry("t", 0, 5),
            &registry("v", 1, 1),
            Arc::new(FeatureLoader),
            &mut log,
        )
        .unwrap();
        assert_eq!(trainer.loss_weights[0], 1.0);
        assert!(matches!(
            log.warnings(),
            [Warning::DegenerateClass { class, .. }] if class == "mel"
        ));
    }
}

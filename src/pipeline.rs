//! End-to-end runs: dataset preparation and training with test evaluation.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use crate::config::LabConfig;
use crate::dataset::metadata::{
    MASTER_METADATA_FILE, read_partitions, read_table, write_partitions, write_registry,
};
use crate::dataset::{
    DatasetError, DatasetMerger, LabelHarmonizer, MergeStats, Partitions, Registry, SplitAssignment,
    StratificationReport, StratifiedSplitter, verify_stratification,
};
use crate::ml::loader::{ImageSampleLoader, SampleLoader};
use crate::ml::metrics::{write_confusion_csv, write_metrics_csv};
use crate::ml::trainer::{Evaluation, TrainError, Trainer, TrainingSummary};
use crate::report::ReportSink;

/// Everything the preparation step produced. Also persisted under `paths.processed_dir`.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub merged: Registry,
    pub stats: MergeStats,
    pub assignment: SplitAssignment,
    pub report: StratificationReport,
    pub partitions: Partitions,
}

/// Harmonize every source, merge, split and persist the metadata files.
pub fn prepare(config: &LabConfig, sink: &mut dyn ReportSink) -> Result<PreparedDataset, DatasetError> {
    let harmonizer = LabelHarmonizer::new(config.class_set());
    let mut registries = Vec::with_capacity(config.dataset.sources.len());
    for spec in config.source_specs() {
        info!("Loading source '{}' from {}", spec.tag, spec.metadata_path.display());
        let table = read_table(&spec.metadata_path, &spec.tag)?;
        registries.push(harmonizer.harmonize(&spec, &table)?);
    }

    let (merged, stats) = DatasetMerger::new().merge(registries);
    let processed = &config.paths.processed_dir;
    write_registry(&processed.join(MASTER_METADATA_FILE), &merged)?;

    let splitter = StratifiedSplitter::new(config.split_ratios(), config.split.seed)?;
    let assignment = splitter.split(&merged, sink)?;
    let report = verify_stratification(&merged, &assignment, sink);
    let partitions = assignment.apply(&merged)?;
    write_partitions(processed, &partitions)?;

    Ok(PreparedDataset {
        merged,
        stats,
        assignment,
        report,
        partitions,
    })
}

#[derive(Debug, Clone, Default)]
pub struct TrainRunOptions {
    /// Continue from the run's latest checkpoint instead of starting over.
    pub resume: bool,
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub summary: TrainingSummary,
    /// Best-checkpoint evaluation on the test partition, when one was run.
    pub test: Option<Evaluation>,
}

/// Train on the persisted partitions with the configured image loader.
pub fn train(
    config: &LabConfig,
    options: TrainRunOptions,
    sink: &mut dyn ReportSink,
) -> Result<TrainOutcome, TrainError> {
    let partitions = read_partitions(&config.paths.processed_dir)?;
    let loader = Arc::new(ImageSampleLoader::new(
        config.image_roots(),
        config.dataset.image_size,
        config.dataset.mean,
        config.dataset.std,
    ));
    train_with_loader(config, &partitions, loader, options, sink)
}

/// Train, then evaluate the best checkpoint on `partitions.test` and export its metrics.
pub fn train_with_loader(
    config: &LabConfig,
    partitions: &Partitions,
    loader: Arc<dyn SampleLoader>,
    options: TrainRunOptions,
    sink: &mut dyn ReportSink,
) -> Result<TrainOutcome, TrainError> {
    let mut trainer = if options.resume {
        Trainer::resume(config, &partitions.train, &partitions.val, loader, sink)?
    } else {
        Trainer::new(config, &partitions.train, &partitions.val, loader, sink)?
    };
    if let Some(cancel) = options.cancel {
        trainer = trainer.with_cancel(cancel);
    }
    let summary = trainer.fit(sink)?;

    if summary.best_epoch.is_none() {
        warn!("No epoch completed; skipping test evaluation");
        return Ok(TrainOutcome {
            summary,
            test: None,
        });
    }
    if partitions.test.is_empty() {
        warn!("Test partition is empty; skipping test evaluation");
        return Ok(TrainOutcome {
            summary,
            test: None,
        });
    }

    trainer.load_best()?;
    let evaluation = trainer.evaluate(&partitions.test, sink)?;
    let run_name = &config.training.run_name;
    let results = &config.paths.results_dir;
    write_metrics_csv(
        &results.join(format!("{run_name}_test_metrics.csv")),
        run_name,
        "test",
        &evaluation.metrics,
    )?;
    write_confusion_csv(
        &results.join(format!("{run_name}_test_confusion.csv")),
        trainer.classes(),
        &evaluation.metrics.confusion,
    )?;
    info!(
        "Test: loss {:.4}, accuracy {:.4}, balanced accuracy {:.4}, {} sensitivity {:.4}, AUC {:.4}",
        evaluation.loss,
        evaluation.metrics.accuracy(),
        evaluation.metrics.balanced_accuracy(),
        evaluation.metrics.critical_class(),
        evaluation.metrics.critical_sensitivity(),
        evaluation.metrics.get("auc_roc_macro").unwrap_or(0.0)
    );

    Ok(TrainOutcome {
        summary,
        test: Some(evaluation),
    })
}

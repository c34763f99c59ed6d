mod support;

use std::collections::BTreeSet;

use lesionlab::dataset::metadata::{MASTER_METADATA_FILE, read_partitions, read_registry};
use lesionlab::dataset::{DatasetError, Partition};
use lesionlab::pipeline::{TrainRunOptions, prepare, train};
use lesionlab::report::{RunLog, Warning};
use support::lab::LabFixture;

#[test]
fn prepare_merges_sources_and_writes_disjoint_partitions() {
    let lab = LabFixture::new();
    lab.write_default_sources();
    let config = lab.config(3, "");
    let mut log = RunLog::new();

    let prepared = prepare(&config, &mut log).expect("prepare");

    assert_eq!(prepared.stats.total, 80);
    assert_eq!(prepared.stats.duplicates_removed, 4);
    assert_eq!(prepared.stats.per_source["ham"], 60);
    assert_eq!(prepared.stats.per_source["isic"], 20);
    assert_eq!(prepared.stats.per_class["nv"], 40);
    assert_eq!(prepared.stats.per_class["mel"], 24);
    assert_eq!(prepared.stats.per_class["bcc"], 16);

    // Duplicate ids keep the first source's label.
    let dup = prepared
        .merged
        .iter()
        .find(|sample| sample.id == "ISIC_00000")
        .expect("duplicate kept once");
    assert_eq!(dup.source, "ham");
    assert_eq!(dup.label, "nv");

    assert_eq!(prepared.partitions.train.len(), 48);
    assert_eq!(prepared.partitions.val.len(), 16);
    assert_eq!(prepared.partitions.test.len(), 16);
    assert!(prepared.report.max_deviation < 5.0);
    assert!(log.warnings().is_empty());

    let processed = lab.processed_dir();
    let master = read_registry(&processed.join(MASTER_METADATA_FILE)).expect("master");
    assert_eq!(master.len(), 80);
    let on_disk = read_partitions(&processed).expect("partitions");
    let mut seen = BTreeSet::new();
    for partition in Partition::ALL {
        for sample in on_disk.get(partition) {
            assert!(seen.insert(sample.id.clone()), "{} in two partitions", sample.id);
            assert_eq!(prepared.assignment.get(&sample.id), Some(partition));
        }
    }
    assert_eq!(seen.len(), 80);
}

#[test]
fn prepare_is_reproducible_for_the_same_seed() {
    let first = LabFixture::new();
    first.write_default_sources();
    let second = LabFixture::new();
    second.write_default_sources();

    let a = prepare(&first.config(3, ""), &mut RunLog::new()).expect("first");
    let b = prepare(&second.config(3, ""), &mut RunLog::new()).expect("second");
    for partition in Partition::ALL {
        let ids_a: Vec<_> = a.partitions.get(partition).ids().collect();
        let ids_b: Vec<_> = b.partitions.get(partition).ids().collect();
        assert_eq!(ids_a, ids_b);
    }
}

#[test]
fn prepare_fails_when_a_source_table_is_missing() {
    let lab = LabFixture::new();
    lab.write_single_column_source(&[("a".to_string(), "nv"), ("b".to_string(), "mel")]);
    let config = lab.config(3, "");
    let err = prepare(&config, &mut RunLog::new()).expect_err("isic table missing");
    assert!(matches!(err, DatasetError::MissingSource { ref tag, .. } if tag == "isic"));
}

#[test]
fn prepare_rejects_labels_outside_the_class_set() {
    let lab = LabFixture::new();
    lab.write_single_column_source(&[("a".to_string(), "nv"), ("b".to_string(), "df")]);
    lab.write_indicator_source(&[("c".to_string(), "mel")]);
    let config = lab.config(3, "");
    let err = prepare(&config, &mut RunLog::new()).expect_err("df is not configured");
    assert!(matches!(err, DatasetError::InvalidRow { row: 2, .. }));
}

#[test]
fn train_evaluates_best_checkpoint_on_test_and_exports_metrics() {
    let lab = LabFixture::new();
    lab.write_default_sources();
    let config = lab.config(8, "");
    let mut log = RunLog::new();
    prepare(&config, &mut log).expect("prepare");

    let outcome = train(&config, TrainRunOptions::default(), &mut log).expect("train");

    assert_eq!(outcome.summary.epochs_completed, 8);
    assert!(outcome.summary.best_epoch.is_some());
    assert_eq!(log.epochs().len(), 8);
    assert!(
        !log.warnings()
            .iter()
            .any(|w| matches!(w, Warning::SampleLoad { .. })),
        "every fixture image decodes"
    );

    let test = outcome.test.expect("test evaluation");
    assert_eq!(test.metrics.confusion.total(), 16);
    assert!(test.metrics.accuracy() > 0.5);

    let results = lab.results_dir();
    assert!(results.join("it_history.json").is_file());
    let metrics = std::fs::read_to_string(results.join("it_test_metrics.csv")).expect("metrics csv");
    assert!(metrics.starts_with("model,split,metric,value"));
    for key in [
        "accuracy",
        "balanced_accuracy",
        "f1_macro",
        "f1_weighted",
        "f1_mel",
        "mel_sensitivity",
        "auc_roc_macro",
        "auc_roc_mel",
        "safety_alert",
    ] {
        assert!(
            metrics.lines().any(|line| line.starts_with(&format!("it,test,{key},"))),
            "missing {key}"
        );
    }
    let confusion =
        std::fs::read_to_string(results.join("it_test_confusion.csv")).expect("confusion csv");
    assert_eq!(confusion.lines().next(), Some("truth,bcc,mel,nv"));
    assert_eq!(confusion.lines().count(), 4);

    assert!(lab.checkpoint_dir().join("it_latest.json").is_file());
    assert!(lab.checkpoint_dir().join("it_best.json").is_file());
}

#[test]
fn missing_images_become_placeholders_with_warnings() {
    let lab = LabFixture::new();
    lab.write_default_sources();
    let config = lab.config(2, "");
    let mut log = RunLog::new();
    let prepared = prepare(&config, &mut log).expect("prepare");
    let victim = prepared.partitions.train.samples()[0].clone();
    std::fs::remove_file(lab.raw_dir().join(&victim.source).join("images").join(&victim.blob))
        .expect("remove image");

    let outcome = train(&config, TrainRunOptions::default(), &mut log).expect("train");

    assert_eq!(outcome.summary.epochs_completed, 2);
    let misses = log
        .warnings()
        .iter()
        .filter(|w| matches!(w, Warning::SampleLoad { sample_id, .. } if *sample_id == victim.id))
        .count();
    assert_eq!(misses, 2, "one placeholder per epoch");
}

#[test]
fn train_without_prepared_partitions_fails() {
    let lab = LabFixture::new();
    lab.write_default_sources();
    let config = lab.config(2, "");
    let err = train(&config, TrainRunOptions::default(), &mut RunLog::new()).expect_err("nothing prepared");
    assert!(err.to_string().contains("train"));
}

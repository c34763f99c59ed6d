mod support;

use lesionlab::ml::checkpoint::CheckpointError;
use lesionlab::ml::trainer::{TrainError, TrainingHistory};
use lesionlab::pipeline::{TrainRunOptions, prepare, train};
use lesionlab::report::RunLog;
use support::lab::LabFixture;

fn prepared_lab() -> LabFixture {
    let lab = LabFixture::new();
    lab.write_default_sources();
    let config = lab.config(1, "");
    prepare(&config, &mut RunLog::new()).expect("prepare");
    lab
}

fn read_history(lab: &LabFixture) -> TrainingHistory {
    let text = std::fs::read_to_string(lab.results_dir().join("it_history.json")).expect("history");
    serde_json::from_str(&text).expect("parse history")
}

fn assert_close(a: &[f64], b: &[f64], what: &str) {
    assert_eq!(a.len(), b.len(), "{what} length");
    for (idx, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < 1e-9, "{what}[{idx}]: {x} != {y}");
    }
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let straight = prepared_lab();
    let config = straight.config(6, "");
    train(&config, TrainRunOptions::default(), &mut RunLog::new()).expect("straight run");

    let split = prepared_lab();
    let first = split.config(3, "");
    let outcome = train(&first, TrainRunOptions::default(), &mut RunLog::new()).expect("first half");
    assert_eq!(outcome.summary.epochs_completed, 3);

    let second = split.config(6, "");
    let mut log = RunLog::new();
    let outcome = train(
        &second,
        TrainRunOptions {
            resume: true,
            cancel: None,
        },
        &mut log,
    )
    .expect("resumed half");
    assert_eq!(outcome.summary.epochs_completed, 6);
    let resumed_epochs: Vec<usize> = log.epochs().iter().map(|r| r.epoch).collect();
    assert_eq!(resumed_epochs, vec![3, 4, 5]);

    let a = read_history(&straight);
    let b = read_history(&split);
    assert_close(&a.train_loss, &b.train_loss, "train_loss");
    assert_close(&a.val_loss, &b.val_loss, "val_loss");
    assert_close(&a.val_balanced_accuracy, &b.val_balanced_accuracy, "val_balanced_accuracy");
    assert_close(&a.learning_rate, &b.learning_rate, "learning_rate");
}

#[test]
fn resume_at_max_epochs_only_reevaluates() {
    let lab = prepared_lab();
    let config = lab.config(2, "");
    let first = train(&config, TrainRunOptions::default(), &mut RunLog::new()).expect("train");

    let mut log = RunLog::new();
    let again = train(
        &config,
        TrainRunOptions {
            resume: true,
            cancel: None,
        },
        &mut log,
    )
    .expect("resume");
    assert!(log.epochs().is_empty());
    assert_eq!(again.summary.epochs_completed, 2);
    assert_eq!(again.summary.best_epoch, first.summary.best_epoch);
    let (before, after) = (first.test.expect("first test"), again.test.expect("second test"));
    assert_eq!(before.metrics.confusion, after.metrics.confusion);
}

#[test]
fn resume_without_checkpoint_is_an_error() {
    let lab = prepared_lab();
    let config = lab.config(2, "");
    let err = train(
        &config,
        TrainRunOptions {
            resume: true,
            cancel: None,
        },
        &mut RunLog::new(),
    )
    .expect_err("nothing to resume");
    assert!(matches!(err, TrainError::Checkpoint(CheckpointError::Missing(_))));
}

//! Per-epoch checkpoint records persisted as "latest" and "best" JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::early_stopping::EarlyStopping;
use super::metrics::MetricsSnapshot;
use super::model::ModelState;
use super::optim::AdamW;
use super::precision::GradScaler;
use super::scheduler::ReduceLrOnPlateau;
use super::trainer::TrainingHistory;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint at {0}")]
    Missing(PathBuf),
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid checkpoint {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Best value of the monitored metric seen this run; improvement is strictly greater.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BestMetric {
    best: Option<f64>,
    epoch: Option<usize>,
}

impl BestMetric {
    /// Record `value` for `epoch`; returns whether it is a new best.
    pub fn update(&mut self, epoch: usize, value: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => value > best,
        };
        if improved {
            self.best = Some(value);
            self.epoch = Some(epoch);
        }
        improved
    }

    pub fn value(&self) -> Option<f64> {
        self.best
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }
}

/// Loop state beyond model and optimizer needed to resume exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub scheduler: ReduceLrOnPlateau,
    pub early_stopping: EarlyStopping,
    pub scaler: GradScaler,
    pub best: BestMetric,
    pub history: TrainingHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Zero-based index of the epoch that produced this record.
    pub epoch: usize,
    pub model: ModelState,
    pub optimizer: AdamW,
    pub metrics: MetricsSnapshot,
    pub is_best: bool,
    pub training: TrainingState,
}

/// Writes `<run>_latest.json` every epoch and `<run>_best.json` on improvement.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    run_name: String,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, run_name: impl Into<String>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            run_name: run_name.into(),
        })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(format!("{}_latest.json", self.run_name))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}_best.json", self.run_name))
    }

    pub fn has_latest(&self) -> bool {
        self.latest_path().is_file()
    }

    /// Overwrite "latest", and "best" too when `record.is_best`.
    pub fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(record).map_err(|source| CheckpointError::Json {
            path: self.latest_path(),
            source,
        })?;
        write_atomic(&self.latest_path(), &bytes)?;
        debug!("Saved latest checkpoint for epoch {}", record.epoch + 1);
        if record.is_best {
            write_atomic(&self.best_path(), &bytes)?;
            info!(
                "New best checkpoint at epoch {} (balanced accuracy {:.4})",
                record.epoch + 1,
                record.metrics.balanced_accuracy()
            );
        }
        Ok(())
    }

    pub fn load_latest(&self) -> Result<CheckpointRecord, CheckpointError> {
        read_record(&self.latest_path())
    }

    pub fn load_best(&self) -> Result<CheckpointRecord, CheckpointError> {
        read_record(&self.best_path())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn read_record(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    if !path.is_file() {
        return Err(CheckpointError::Missing(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ClassSet;
    use crate::ml::early_stopping::Mode;
    use crate::ml::metrics::MetricsCalculator;
    use crate::ml::model::{ModelKind, build_classifier};
    use crate::ml::precision::Precision;
    use crate::report::RunLog;
    use tempfile::tempdir;

    #[test]
    fn best_flags_follow_strict_improvement() {
        let mut best = BestMetric::default();
        let flags: Vec<bool> = [0.60, 0.65, 0.65, 0.70]
            .iter()
            .enumerate()
            .map(|(epoch, v)| best.update(epoch, *v))
            .collect();
        assert_eq!(flags, vec![true, true, false, true]);
        assert_eq!(best.epoch(), Some(3));
    }

    fn record(epoch: usize, is_best: bool, predicted: &[usize]) -> CheckpointRecord {
        let model = build_classifier(ModelKind::Linear, 3, 2, 0);
        let calc = MetricsCalculator::new(ClassSet::from_iter(["mel", "nv"]), "mel", 0.0).unwrap();
        let metrics = calc.compute(
            predicted,
            &[0, 1],
            &[vec![0.6, 0.4], vec![0.3, 0.7]],
            &mut RunLog::new(),
        );
        CheckpointRecord {
            epoch,
            optimizer: AdamW::new(model.parameters(), 1e-3, 1e-4),
            model: model.state(),
            metrics,
            is_best,
            training: TrainingState {
                scheduler: ReduceLrOnPlateau::new(1e-3, 0.5, 3, 1e-6),
                early_stopping: EarlyStopping::new(Mode::Max, 7, 0.001),
                scaler: GradScaler::new(Precision::Full),
                best: BestMetric::default(),
                history: TrainingHistory::default(),
            },
        }
    }

    #[test]
    fn latest_always_overwritten_best_only_on_improvement() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("ckpt"), "mlp").unwrap();
        assert!(matches!(manager.load_best(), Err(CheckpointError::Missing(_))));

        let first = record(0, true, &[0, 1]);
        manager.save(&first).unwrap();
        let second = record(1, false, &[0, 0]);
        manager.save(&second).unwrap();

        assert_eq!(manager.load_latest().unwrap(), second);
        assert_eq!(manager.load_best().unwrap(), first);
        assert!(manager.latest_path().ends_with("mlp_latest.json"));
        assert!(!manager.latest_path().with_extension("json.tmp").exists());
    }
}

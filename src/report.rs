//! Run-scoped reporting sink.
//!
//! Components never reach for shared global state to surface non-fatal
//! conditions. They receive a `&mut dyn ReportSink` for the lifetime of one run
//! and push structured [`Warning`]s and per-epoch [`EpochReport`]s into it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Non-fatal conditions aggregated during preparation and training.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A class has no training samples or too few samples to stratify.
    DegenerateClass {
        /// Canonical class name.
        class: String,
        /// Human readable reason.
        reason: String,
    },
    /// Class proportions drift between partitions by more than 5 percentage points.
    StratificationDeviation {
        /// Largest observed deviation, in percentage points.
        max_deviation_pct: f64,
    },
    /// A metric could not be computed and was defaulted or excluded.
    MetricComputation {
        /// Metric name.
        metric: String,
        /// Human readable reason.
        reason: String,
    },
    /// Critical-class sensitivity fell below the configured threshold.
    SafetyThreshold {
        /// Critical class name.
        class: String,
        /// Observed sensitivity (recall).
        sensitivity: f64,
        /// Configured minimum.
        threshold: f64,
    },
    /// A sample blob was missing or corrupt and replaced by a placeholder.
    SampleLoad {
        /// Sample identifier.
        sample_id: String,
        /// Loader error message.
        reason: String,
    },
    /// Non-finite gradients were found after unscaling; the optimizer step was skipped.
    NonFiniteGradients {
        /// Zero-based epoch index.
        epoch: usize,
        /// Loss scale in effect when the overflow happened.
        scale: f32,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::DegenerateClass { class, reason } => {
                write!(f, "degenerate class '{class}': {reason}")
            }
            Warning::StratificationDeviation { max_deviation_pct } => write!(
                f,
                "stratification suboptimal: max deviation {max_deviation_pct:.2}% (> 5%)"
            ),
            Warning::MetricComputation { metric, reason } => {
                write!(f, "metric '{metric}' undefined: {reason}")
            }
            Warning::SafetyThreshold {
                class,
                sensitivity,
                threshold,
            } => write!(
                f,
                "SAFETY ALERT: '{class}' sensitivity {sensitivity:.3} below target {threshold:.3}; model may miss critical cases"
            ),
            Warning::SampleLoad { sample_id, reason } => {
                write!(f, "sample '{sample_id}' replaced by placeholder: {reason}")
            }
            Warning::NonFiniteGradients { epoch, scale } => write!(
                f,
                "non-finite gradients in epoch {} at loss scale {scale}; step skipped",
                epoch + 1
            ),
        }
    }
}

/// One line of the per-epoch reporting surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Configured maximum number of epochs.
    pub max_epochs: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub balanced_accuracy: f64,
    pub critical_sensitivity: f64,
    pub f1_macro: f64,
    /// Learning rate used during this epoch's training phase.
    pub learning_rate: f64,
    pub elapsed: Duration,
    /// Whether this epoch produced a new best checkpoint.
    pub is_best: bool,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ep {:02}/{} | Loss: {:.4}/{:.4} | BalAcc: {:.4} | CritSens: {:.4} | F1: {:.4} | LR: {:.6} | {:.1}s{}",
            self.epoch + 1,
            self.max_epochs,
            self.train_loss,
            self.val_loss,
            self.balanced_accuracy,
            self.critical_sensitivity,
            self.f1_macro,
            self.learning_rate,
            self.elapsed.as_secs_f64(),
            if self.is_best { " *" } else { "" }
        )
    }
}

/// Receiver for run-scoped warnings and epoch reports.
pub trait ReportSink {
    fn warn(&mut self, warning: Warning);
    fn epoch(&mut self, report: &EpochReport);
}

/// Default sink: forwards to `tracing` and keeps everything for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RunLog {
    warnings: Vec<Warning>,
    epochs: Vec<EpochReport>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn epochs(&self) -> &[EpochReport] {
        &self.epochs
    }

    /// Number of recorded safety alerts.
    pub fn safety_alerts(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, Warning::SafetyThreshold { .. }))
            .count()
    }
}

impl ReportSink for RunLog {
    fn warn(&mut self, warning: Warning) {
        match &warning {
            Warning::SafetyThreshold { .. } => error!("{warning}"),
            _ => warn!("{warning}"),
        }
        self.warnings.push(warning);
    }

    fn epoch(&mut self, report: &EpochReport) {
        info!("{report}");
        self.epochs.push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_log_counts_safety_alerts_separately() {
        let mut log = RunLog::new();
        log.warn(Warning::DegenerateClass {
            class: "df".into(),
            reason: "0 training samples".into(),
        });
        log.warn(Warning::SafetyThreshold {
            class: "mel".into(),
            sensitivity: 0.4,
            threshold: 0.85,
        });
        assert_eq!(log.warnings().len(), 2);
        assert_eq!(log.safety_alerts(), 1);
    }

    #[test]
    fn epoch_line_is_one_based_and_marks_best() {
        let report = EpochReport {
            epoch: 0,
            max_epochs: 30,
            train_loss: 1.5,
            train_accuracy: 0.4,
            val_loss: 1.25,
            balanced_accuracy: 0.5,
            critical_sensitivity: 0.75,
            f1_macro: 0.33,
            learning_rate: 1e-4,
            elapsed: Duration::from_millis(1500),
            is_best: true,
        };
        let line = report.to_string();
        assert!(line.starts_with("Ep 01/30"));
        assert!(line.contains("BalAcc: 0.5000"));
        assert!(line.ends_with('*'));
    }
}

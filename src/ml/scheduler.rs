//! Learning-rate reduction when the monitored metric plateaus.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Relative improvement required for the scheduler to count an evaluation as better.
pub const PLATEAU_THRESHOLD: f64 = 1e-4;
const MIN_LR_CHANGE: f64 = 1e-8;

/// Reduce-on-plateau for a maximized metric.
///
/// After more than `patience` evaluations without a relative improvement of
/// [`PLATEAU_THRESHOLD`], the rate is multiplied by `factor`, never below `min_lr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            min_lr,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Record one evaluation and return the learning rate for the next epoch.
    pub fn step(&mut self, metric: f64) -> f64 {
        let improved = match self.best {
            None => true,
            Some(best) => metric > best * (1.0 + PLATEAU_THRESHOLD),
        };
        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if self.lr - reduced > MIN_LR_CHANGE {
                info!("Reducing learning rate {:.3e} -> {:.3e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.bad_epochs = 0;
        }
        self.lr
    }
}

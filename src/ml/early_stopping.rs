//! Early stopping on a monitored metric that has stopped improving.

use serde::{Deserialize, Serialize};

/// Direction in which the monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Max,
    Min,
}

/// Patience-based stagnation tracker. Once stopped it stays stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    best_value: Option<f64>,
    stale_count: usize,
    mode: Mode,
    patience: usize,
    min_delta: f64,
    stopped: bool,
}

impl EarlyStopping {
    pub fn new(mode: Mode, patience: usize, min_delta: f64) -> Self {
        Self {
            best_value: None,
            stale_count: 0,
            mode,
            patience,
            min_delta,
            stopped: false,
        }
    }

    /// Feed one epoch's monitored value; returns whether training should stop.
    ///
    /// The first value only establishes the baseline.
    pub fn step(&mut self, value: f64) -> bool {
        if self.stopped {
            return true;
        }
        let Some(best) = self.best_value else {
            self.best_value = Some(value);
            return false;
        };
        let improved = match self.mode {
            Mode::Max => value > best + self.min_delta,
            Mode::Min => value < best - self.min_delta,
        };
        if improved {
            self.best_value = Some(value);
            self.stale_count = 0;
        } else {
            self.stale_count += 1;
            if self.stale_count >= self.patience {
                self.stopped = true;
            }
        }
        self.stopped
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    pub fn stale_count(&self) -> usize {
        self.stale_count
    }
}

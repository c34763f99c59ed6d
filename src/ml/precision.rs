//! Full or mixed precision and the dynamic loss scaler used by the latter.

use serde::{Deserialize, Serialize};

use super::model::Param;

const INITIAL_SCALE: f32 = 65_536.0;
const GROWTH_FACTOR: f32 = 2.0;
const BACKOFF_FACTOR: f32 = 0.5;
const GROWTH_INTERVAL: u32 = 2_000;

/// Numeric precision of the training step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Full,
    /// Dynamic loss scaling is enabled.
    Mixed,
}

/// Dynamic loss scaler.
///
/// Callers multiply the loss gradient by [`GradScaler::scale`], call
/// [`GradScaler::unscale`] before clipping, skip the optimizer step when it
/// reports non-finite gradients, and finish with [`GradScaler::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    clean_steps: u32,
}

impl GradScaler {
    pub fn new(precision: Precision) -> Self {
        Self {
            enabled: precision == Precision::Mixed,
            scale: INITIAL_SCALE,
            clean_steps: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        if self.enabled { self.scale } else { 1.0 }
    }

    /// Divide gradients by the current scale; returns `false` if any gradient is not finite.
    pub fn unscale(&self, params: &mut [Param]) -> bool {
        let inv = 1.0 / self.scale();
        let mut finite = true;
        for param in params.iter_mut() {
            for g in &mut param.grad {
                *g *= inv;
                finite &= g.is_finite();
            }
        }
        finite
    }

    /// Grow the scale after a run of clean steps, back off after an overflow.
    pub fn update(&mut self, found_non_finite: bool) {
        if !self.enabled {
            return;
        }
        if found_non_finite {
            self.scale *= BACKOFF_FACTOR;
            self.clean_steps = 0;
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= GROWTH_INTERVAL {
            self.scale *= GROWTH_FACTOR;
            self.clean_steps = 0;
        }
    }
}

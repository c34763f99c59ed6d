//! AdamW and global-norm gradient clipping over [`Param`] slices.

use serde::{Deserialize, Serialize};

use super::model::Param;

pub const BETA1: f64 = 0.9;
pub const BETA2: f64 = 0.999;
pub const EPS: f64 = 1e-8;

/// Adam with decoupled weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamW {
    lr: f64,
    weight_decay: f64,
    step: u64,
    exp_avg: Vec<Vec<f32>>,
    exp_avg_sq: Vec<Vec<f32>>,
}

impl AdamW {
    pub fn new(params: &[Param], lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            weight_decay,
            step: 0,
            exp_avg: params.iter().map(|p| vec![0.0; p.values.len()]).collect(),
            exp_avg_sq: params.iter().map(|p| vec![0.0; p.values.len()]).collect(),
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Whether the moment buffers line up with `params`.
    pub fn matches(&self, params: &[Param]) -> bool {
        self.exp_avg.len() == params.len()
            && self
                .exp_avg
                .iter()
                .zip(params)
                .all(|(m, p)| m.len() == p.values.len())
    }

    /// Apply one update from the current gradients.
    pub fn step(&mut self, params: &mut [Param]) {
        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - BETA1.powi(t);
        let bias_correction2 = 1.0 - BETA2.powi(t);
        let step_size = (self.lr / bias_correction1) as f32;
        let bc2_sqrt = bias_correction2.sqrt() as f32;
        let decay = (1.0 - self.lr * self.weight_decay) as f32;
        let (b1, b2, eps) = (BETA1 as f32, BETA2 as f32, EPS as f32);

        for ((param, m), v) in params
            .iter_mut()
            .zip(self.exp_avg.iter_mut())
            .zip(self.exp_avg_sq.iter_mut())
        {
            for i in 0..param.values.len() {
                let g = param.grad[i];
                param.values[i] *= decay;
                m[i] = b1 * m[i] + (1.0 - b1) * g;
                v[i] = b2 * v[i] + (1.0 - b2) * g * g;
                let denom = v[i].sqrt() / bc2_sqrt + eps;
                param.values[i] -= step_size * m[i] / denom;
            }
        }
    }
}

/// L2 norm over every gradient of every parameter.
pub fn grad_norm(params: &[Param]) -> f64 {
    params
        .iter()
        .flat_map(|p| p.grad.iter())
        .map(|g| (*g as f64) * (*g as f64))
        .sum::<f64>()
        .sqrt()
}

/// Rescale gradients so their global norm is at most `max_norm`; returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [Param], max_norm: f64) -> f64 {
    let total = grad_norm(params);
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        let coef = coef as f32;
        for param in params.iter_mut() {
            for g in &mut param.grad {
                *g *= coef;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(values: Vec<f32>, grad: Vec<f32>) -> Param {
        Param {
            name: "w",
            values,
            grad,
        }
    }

    #[test]
    fn clipping_caps_global_norm() {
        let mut params = vec![param(vec![0.0; 2], vec![3.0, 0.0]), param(vec![0.0], vec![4.0])];
        let before = clip_grad_norm(&mut params, 1.0);
        assert!((before - 5.0).abs() < 1e-9);
        assert!((grad_norm(&params) - 1.0).abs() < 1e-5);
        assert!((params[0].grad[0] - 0.6).abs() < 1e-5);

        let mut small = vec![param(vec![0.0], vec![0.5])];
        clip_grad_norm(&mut small, 1.0);
        assert_eq!(small[0].grad[0], 0.5);
    }

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient() {
        let mut params = vec![param(vec![1.0, -1.0], vec![0.2, -3.0])];
        let mut opt = AdamW::new(&params, 0.01, 0.0);
        opt.step(&mut params);
        // Bias-corrected first step is lr * sign(g) up to epsilon.
        assert!((params[0].values[0] - 0.99).abs() < 1e-5);
        assert!((params[0].values[1] - (-0.99)).abs() < 1e-5);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn weight_decay_is_decoupled_from_gradient() {
        let mut params = vec![param(vec![2.0], vec![0.0])];
        let mut opt = AdamW::new(&params, 0.1, 0.5);
        opt.step(&mut params);
        assert!((params[0].values[0] - 2.0 * (1.0 - 0.05)).abs() < 1e-6);
    }
}

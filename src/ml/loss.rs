//! Class-weighted cross-entropy loss.

use super::model::softmax;

/// Loss value and its gradient with respect to the logits.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub loss: f64,
    pub grad: Vec<Vec<f32>>,
    /// Per-sample class probabilities from the same pass.
    pub probabilities: Vec<Vec<f32>>,
}

/// Class-weighted cross entropy, reduced as `sum(w[y] * nll) / sum(w[y])`.
///
/// A batch whose targets all carry zero weight yields zero loss and gradient.
pub fn weighted_cross_entropy(logits: &[Vec<f32>], targets: &[usize], weights: &[f32]) -> LossOutput {
    let probabilities: Vec<Vec<f32>> = logits.iter().map(|row| softmax(row)).collect();
    let sample_weight = |y: usize| weights.get(y).copied().unwrap_or(0.0) as f64;
    let weight_sum: f64 = targets.iter().map(|&y| sample_weight(y)).sum();

    let mut grad: Vec<Vec<f32>> = logits.iter().map(|row| vec![0.0; row.len()]).collect();
    if weight_sum <= 0.0 {
        return LossOutput {
            loss: 0.0,
            grad,
            probabilities,
        };
    }

    let mut loss = 0.0f64;
    for (n, (probs, &y)) in probabilities.iter().zip(targets).enumerate() {
        let w = sample_weight(y);
        if w == 0.0 {
            continue;
        }
        let p_true = probs.get(y).copied().unwrap_or(0.0).max(f32::MIN_POSITIVE) as f64;
        loss -= w * p_true.ln();
        let scale = (w / weight_sum) as f32;
        for (c, (&p, g)) in probs.iter().zip(grad[n].iter_mut()).enumerate() {
            let target = if c == y { 1.0 } else { 0.0 };
            *g = scale * (p - target);
        }
    }
    LossOutput {
        loss: loss / weight_sum,
        grad,
        probabilities,
    }
}

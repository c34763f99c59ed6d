//! Classifier interface consumed by the trainer and two reference implementations.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod linear;
mod mlp;

pub use linear::LinearClassifier;
pub use mlp::MlpClassifier;

/// Which classifier to build, chosen once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    /// Softmax regression over the flattened input.
    Linear,
    /// One ReLU hidden layer.
    Mlp { hidden_size: usize },
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Mlp { .. } => "mlp",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Linear => f.write_str("linear"),
            ModelKind::Mlp { hidden_size } => write!(f, "mlp({hidden_size})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Checkpoint holds a {found} model but a {expected} model was built")]
    KindMismatch { expected: String, found: String },
    #[error("Parameter '{name}' has {found} values, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Parameter '{0}' is missing from the checkpoint")]
    MissingParameter(String),
    #[error("Input has {found} features, model expects {expected}")]
    InputLength { expected: usize, found: usize },
}

/// One optimizable tensor with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: &'static str,
    pub values: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Param {
    fn zeros(name: &'static str, len: usize) -> Self {
        Self {
            name,
            values: vec![0.0; len],
            grad: vec![0.0; len],
        }
    }

    fn uniform(name: &'static str, len: usize, rng: &mut StdRng) -> Self {
        let mut param = Self::zeros(name, len);
        for w in &mut param.values {
            *w = (rng.random::<f32>() - 0.5) * 0.1;
        }
        param
    }
}

/// Named parameter values, enough to restore a model exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub kind: ModelKind,
    pub input_len: usize,
    pub num_classes: usize,
    pub params: Vec<NamedTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub values: Vec<f32>,
}

/// A differentiable classifier producing `logits[batch, num_classes]`.
///
/// Gradients accumulate into [`Param::grad`] until [`Classifier::zero_grad`].
pub trait Classifier: Send {
    fn kind(&self) -> ModelKind;
    fn input_len(&self) -> usize;
    fn num_classes(&self) -> usize;

    /// Inference pass; records nothing for backward.
    fn forward(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Training pass; keeps the activations [`Classifier::backward`] needs.
    fn forward_train(&mut self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Accumulate parameter gradients for `d loss / d logits` of the last training pass.
    fn backward(&mut self, grad_logits: &[Vec<f32>]);

    fn parameters(&self) -> &[Param];
    fn parameters_mut(&mut self) -> &mut [Param];

    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.grad.fill(0.0);
        }
    }

    fn state(&self) -> ModelState {
        ModelState {
            kind: self.kind(),
            input_len: self.input_len(),
            num_classes: self.num_classes(),
            params: self
                .parameters()
                .iter()
                .map(|p| NamedTensor {
                    name: p.name.to_string(),
                    values: p.values.clone(),
                })
                .collect(),
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        if state.kind != self.kind()
            || state.input_len != self.input_len()
            || state.num_classes != self.num_classes()
        {
            return Err(ModelError::KindMismatch {
                expected: format!("{} {}->{}", self.kind(), self.input_len(), self.num_classes()),
                found: format!("{} {}->{}", state.kind, state.input_len, state.num_classes),
            });
        }
        for param in self.parameters_mut() {
            let saved = state
                .params
                .iter()
                .find(|t| t.name == param.name)
                .ok_or_else(|| ModelError::MissingParameter(param.name.to_string()))?;
            if saved.values.len() != param.values.len() {
                return Err(ModelError::ShapeMismatch {
                    name: param.name.to_string(),
                    expected: param.values.len(),
                    found: saved.values.len(),
                });
            }
            param.values.copy_from_slice(&saved.values);
            param.grad.fill(0.0);
        }
        Ok(())
    }
}

/// Construct the configured classifier with seeded initial weights.
pub fn build_classifier(
    kind: ModelKind,
    input_len: usize,
    num_classes: usize,
    seed: u64,
) -> Box<dyn Classifier> {
    let mut rng = StdRng::seed_from_u64(seed);
    match kind {
        ModelKind::Linear => Box::new(LinearClassifier::new(input_len, num_classes, &mut rng)),
        ModelKind::Mlp { hidden_size } => Box::new(MlpClassifier::new(
            input_len,
            hidden_size.max(1),
            num_classes,
            &mut rng,
        )),
    }
}

fn check_inputs(inputs: &[Vec<f32>], expected: usize) -> Result<(), ModelError> {
    match inputs.iter().find(|x| x.len() != expected) {
        Some(bad) => Err(ModelError::InputLength {
            expected,
            found: bad.len(),
        }),
        None => Ok(()),
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = out.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        let uniform = 1.0 / logits.len() as f32;
        out.fill(uniform);
        return out;
    }
    for v in &mut out {
        *v /= sum;
    }
    out
}

/// Index of the largest value; the first one on ties.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

use rand::rngs::StdRng;

use super::{Classifier, ModelError, ModelKind, Param, check_inputs};

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// Softmax regression: `logits = W x + b`, `W` stored row-major as `[class][input]`.
pub struct LinearClassifier {
    input_len: usize,
    num_classes: usize,
    params: [Param; 2],
    cached_inputs: Vec<Vec<f32>>,
}

impl LinearClassifier {
    pub fn new(input_len: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self {
            input_len,
            num_classes,
            params: [
                Param::uniform("weight", num_classes * input_len, rng),
                Param::zeros("bias", num_classes),
            ],
            cached_inputs: Vec::new(),
        }
    }

    fn logits(&self, x: &[f32]) -> Vec<f32> {
        let weight = &self.params[WEIGHT].values;
        let bias = &self.params[BIAS].values;
        (0..self.num_classes)
            .map(|c| {
                let row = &weight[c * self.input_len..(c + 1) * self.input_len];
                bias[c] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>()
            })
            .collect()
    }
}

impl Classifier for LinearClassifier {
    fn kind(&self) -> ModelKind {
        ModelKind::Linear
    }

    fn input_len(&self) -> usize {
        self.input_len
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        check_inputs(inputs, self.input_len)?;
        Ok(inputs.iter().map(|x| self.logits(x)).collect())
    }

    fn forward_train(&mut self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        let logits = self.forward(inputs)?;
        self.cached_inputs = inputs.to_vec();
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: &[Vec<f32>]) {
        let d = self.input_len;
        let [weight, bias] = &mut self.params;
        for (x, g) in self.cached_inputs.iter().zip(grad_logits) {
            for (c, &dz) in g.iter().enumerate().take(self.num_classes) {
                bias.grad[c] += dz;
                let row = &mut weight.grad[c * d..(c + 1) * d];
                for (acc, v) in row.iter_mut().zip(x) {
                    *acc += dz * v;
                }
            }
        }
    }

    fn parameters(&self) -> &[Param] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }
}

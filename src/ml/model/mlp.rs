use rand::rngs::StdRng;

use super::{Classifier, ModelError, ModelKind, Param, check_inputs};

const W1: usize = 0;
const B1: usize = 1;
const W2: usize = 2;
const B2: usize = 3;

/// Two-layer perceptron with a ReLU hidden layer.
///
/// `weights1` is `[hidden][input]`, `weights2` is `[class][hidden]`.
pub struct MlpClassifier {
    input_len: usize,
    hidden_size: usize,
    num_classes: usize,
    params: [Param; 4],
    cache: Vec<Activations>,
}

struct Activations {
    input: Vec<f32>,
    hidden_pre: Vec<f32>,
    hidden_act: Vec<f32>,
}

impl MlpClassifier {
    pub fn new(input_len: usize, hidden_size: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self {
            input_len,
            hidden_size,
            num_classes,
            params: [
                Param::uniform("weights1", hidden_size * input_len, rng),
                Param::zeros("bias1", hidden_size),
                Param::uniform("weights2", num_classes * hidden_size, rng),
                Param::zeros("bias2", num_classes),
            ],
            cache: Vec::new(),
        }
    }

    fn run(&self, x: &[f32]) -> (Activations, Vec<f32>) {
        let d = self.input_len;
        let hidden = self.hidden_size;
        let w1 = &self.params[W1].values;
        let b1 = &self.params[B1].values;
        let w2 = &self.params[W2].values;
        let b2 = &self.params[B2].values;

        let mut hidden_pre = vec![0.0f32; hidden];
        let mut hidden_act = vec![0.0f32; hidden];
        for h in 0..hidden {
            let base = h * d;
            let mut sum = b1[h];
            for i in 0..d {
                sum += w1[base + i] * x[i];
            }
            hidden_pre[h] = sum;
            hidden_act[h] = sum.max(0.0);
        }

        let mut logits = vec![0.0f32; self.num_classes];
        for c in 0..self.num_classes {
            let base = c * hidden;
            let mut sum = b2[c];
            for h in 0..hidden {
                sum += w2[base + h] * hidden_act[h];
            }
            logits[c] = sum;
        }
        let activations = Activations {
            input: x.to_vec(),
            hidden_pre,
            hidden_act,
        };
        (activations, logits)
    }
}

impl Classifier for MlpClassifier {
    fn kind(&self) -> ModelKind {
        ModelKind::Mlp {
            hidden_size: self.hidden_size,
        }
    }

    fn input_len(&self) -> usize {
        self.input_len
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        check_inputs(inputs, self.input_len)?;
        Ok(inputs.iter().map(|x| self.run(x).1).collect())
    }

    fn forward_train(&mut self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        check_inputs(inputs, self.input_len)?;
        let (cache, logits): (Vec<Activations>, Vec<Vec<f32>>) = inputs.iter().map(|x| self.run(x)).unzip();
        self.cache = cache;
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: &[Vec<f32>]) {
        let d = self.input_len;
        let hidden = self.hidden_size;
        let [w1, b1, w2, b2] = &mut self.params;
        for (act, g) in self.cache.iter().zip(grad_logits) {
            let mut d_hidden = vec![0.0f32; hidden];
            for (c, &dz2) in g.iter().enumerate().take(self.num_classes) {
                b2.grad[c] += dz2;
                let base = c * hidden;
                for h in 0..hidden {
                    w2.grad[base + h] += dz2 * act.hidden_act[h];
                    d_hidden[h] += dz2 * w2.values[base + h];
                }
            }
            for h in 0..hidden {
                if act.hidden_pre[h] <= 0.0 {
                    continue;
                }
                b1.grad[h] += d_hidden[h];
                let base = h * d;
                for i in 0..d {
                    w1.grad[base + i] += d_hidden[h] * act.input[i];
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

use log::debug;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use crate::common::{EpochMetrics, ModelParameters, Tensor};
use crate::data::Partition;
use crate::error::FedError;

/// A trainable model with a fixed, known parameter-tensor layout.
///
/// Every client and the global aggregator must use the same layout; the
/// orchestrator verifies this at startup.
pub trait Model: Send {
    fn forward(&self, xs: &Array2<f32>) -> Array2<f32>;

    fn get_parameters(&self) -> ModelParameters;

    /// Overwrites the weights in place. On a shape mismatch the existing
    /// weights must remain unmodified.
    fn set_parameters(&mut self, params: &ModelParameters) -> Result<(), FedError>;

    /// One epoch of gradient descent over the full partition.
    fn train_epoch(&mut self, images: &Array2<f32>, labels: &Array1<i32>, learning_rate: f32)
        -> EpochMetrics;
}

/// Softmax regression on flattened images.
///
/// Layout: tensor 0 is the weight matrix `[num_classes, feature_dim]`,
/// tensor 1 the bias vector `[num_classes]`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Array2<f32>,
    biases: Array1<f32>,
}

impl LinearModel {
    /// Xavier-initialized weights, zero biases.
    pub fn new(num_classes: usize, feature_dim: usize) -> Self {
        let mut rng = rand::thread_rng();
        let scale = (2.0 / feature_dim as f32).sqrt();
        let weights = Array2::from_shape_fn((num_classes, feature_dim), |_| {
            rng.gen::<f32>() * scale - scale / 2.0
        });
        let biases = Array1::zeros(num_classes);
        Self { weights, biases }
    }

    pub fn num_classes(&self) -> usize {
        self.weights.nrows()
    }

    pub fn feature_dim(&self) -> usize {
        self.weights.ncols()
    }
}

impl Model for LinearModel {
    fn forward(&self, xs: &Array2<f32>) -> Array2<f32> {
        // xs: [batch, feature_dim] -> logits: [batch, num_classes]
        xs.dot(&self.weights.t()) + &self.biases
    }

    fn get_parameters(&self) -> ModelParameters {
        let weights = Tensor::new(
            vec![self.weights.nrows(), self.weights.ncols()],
            self.weights.iter().cloned().collect(),
        );
        let biases = Tensor::new(vec![self.biases.len()], self.biases.to_vec());
        ModelParameters::new(vec![weights, biases])
    }

    fn set_parameters(&mut self, params: &ModelParameters) -> Result<(), FedError> {
        self.get_parameters().check_compatible(params)?;

        let weights = &params.tensors[0];
        let biases = &params.tensors[1];
        self.weights = Array2::from_shape_vec(
            (weights.shape[0], weights.shape[1]),
            weights.values.clone(),
        )
        .map_err(|_| FedError::ShapeMismatch {
            layer: 0,
            expected: vec![self.weights.nrows(), self.weights.ncols()],
            actual: weights.shape.clone(),
        })?;
        self.biases = Array1::from_vec(biases.values.clone());
        Ok(())
    }

    fn train_epoch(
        &mut self,
        images: &Array2<f32>,
        labels: &Array1<i32>,
        learning_rate: f32,
    ) -> EpochMetrics {
        let batch_size = images.nrows();

        let logits = self.forward(images);
        let probs = softmax(&logits);
        let loss = cross_entropy_loss(&probs, labels);
        let accuracy = compute_accuracy(&logits, labels);

        let grad_output = softmax_cross_entropy_gradient(&probs, labels);
        let grad_weights = images.t().dot(&grad_output);
        let grad_biases = grad_output.sum_axis(Axis(0));

        self.weights = &self.weights - learning_rate / batch_size as f32 * &grad_weights.t();
        self.biases = &self.biases - learning_rate / batch_size as f32 * &grad_biases;

        EpochMetrics {
            epoch: 0,
            loss: loss as f64,
            accuracy: accuracy as f64,
        }
    }
}

/// LocalTrainer leaf: runs `epochs` epochs of gradient descent over the full
/// partition and returns per-epoch metrics. An empty partition trains nothing.
pub fn train<M: Model>(
    model: &mut M,
    data: &Partition,
    learning_rate: f32,
    epochs: usize,
) -> Vec<EpochMetrics> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut history = Vec::with_capacity(epochs);
    for epoch in 0..epochs {
        let mut metrics = model.train_epoch(&data.images, &data.labels, learning_rate);
        metrics.epoch = epoch;
        debug!(
            "epoch {}: loss = {:.4}, accuracy = {:.2}%",
            epoch,
            metrics.loss,
            metrics.accuracy * 100.0
        );
        history.push(metrics);
    }
    history
}

/// LocalEvaluator leaf: forward-only pass returning (loss, accuracy).
pub fn evaluate<M: Model>(model: &M, data: &Partition) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let logits = model.forward(&data.images);
    let probs = softmax(&logits);
    let loss = cross_entropy_loss(&probs, &data.labels);
    let accuracy = compute_accuracy(&logits, &data.labels);
    (loss as f64, accuracy as f64)
}

pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();
    for mut row in result.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    result
}

pub fn cross_entropy_loss(softmax_probs: &Array2<f32>, labels: &Array1<i32>) -> f32 {
    let batch_size = softmax_probs.nrows();
    let mut loss = 0.0;
    for (i, &label) in labels.iter().enumerate() {
        let prob = softmax_probs[[i, label as usize]];
        // Epsilon keeps log(0) out of the sum
        loss -= prob.max(1e-15).ln();
    }
    loss / batch_size as f32
}

fn softmax_cross_entropy_gradient(softmax_probs: &Array2<f32>, labels: &Array1<i32>) -> Array2<f32> {
    let mut grad = softmax_probs.clone();
    for (i, &label) in labels.iter().enumerate() {
        grad[[i, label as usize]] -= 1.0;
    }
    grad
}

pub fn compute_accuracy(logits: &Array2<f32>, labels: &Array1<i32>) -> f32 {
    let batch_size = logits.nrows();
    let mut correct = 0;
    for (i, &true_label) in labels.iter().enumerate() {
        let predicted = logits
            .row(i)
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| idx as i32)
            .unwrap_or(-1);
        if predicted == true_label {
            correct += 1;
        }
    }
    correct as f32 / batch_size as f32
}

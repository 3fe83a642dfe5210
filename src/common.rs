use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::FedError;

/// One learnable layer's weight state, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Full ordered weight state of one model: one tensor per learnable layer.
///
/// Aggregation is only valid across parameter sets whose layout signatures
/// (ordered shape lists) agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub tensors: Vec<Tensor>,
}

impl ModelParameters {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Ordered list of tensor shapes; equal signatures mean the two parameter
    /// sets belong to the same architecture.
    pub fn layout_signature(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape.clone()).collect()
    }

    /// Checks that `other` has the same layout; the error names the first
    /// disagreeing layer.
    pub fn check_compatible(&self, other: &ModelParameters) -> Result<(), FedError> {
        if self.tensors.len() != other.tensors.len() {
            return Err(FedError::ShapeMismatch {
                layer: self.tensors.len().min(other.tensors.len()),
                expected: vec![self.tensors.len()],
                actual: vec![other.tensors.len()],
            });
        }
        for (layer, (a, b)) in self.tensors.iter().zip(other.tensors.iter()).enumerate() {
            if a.shape != b.shape {
                return Err(FedError::ShapeMismatch {
                    layer,
                    expected: a.shape.clone(),
                    actual: b.shape.clone(),
                });
            }
            // A tensor whose buffer disagrees with its declared shape is
            // malformed wire data; reject it at the same layer.
            if b.values.len() != b.shape.iter().product::<usize>() {
                return Err(FedError::ShapeMismatch {
                    layer,
                    expected: b.shape.clone(),
                    actual: vec![b.values.len()],
                });
            }
        }
        Ok(())
    }
}

/// Scalar config value, mirrored on the wire as a proto oneof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Per-round configuration sent read-only to every participating client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundConfig {
    values: HashMap<String, Scalar>,
}

pub const KEY_SERVER_ROUND: &str = "server_round";
pub const KEY_LOCAL_EPOCHS: &str = "local_epochs";

impl RoundConfig {
    pub fn for_round(server_round: u32, local_epochs: usize) -> Self {
        let mut values = HashMap::new();
        values.insert(
            KEY_SERVER_ROUND.to_string(),
            Scalar::Int(i64::from(server_round)),
        );
        values.insert(
            KEY_LOCAL_EPOCHS.to_string(),
            Scalar::Int(local_epochs as i64),
        );
        Self { values }
    }

    pub fn from_values(values: HashMap<String, Scalar>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Scalar) {
        self.values.insert(key.into(), value);
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(Scalar::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn server_round(&self) -> Option<u32> {
        self.get_int(KEY_SERVER_ROUND)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn local_epochs(&self) -> Option<usize> {
        self.get_int(KEY_LOCAL_EPOCHS)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn values(&self) -> &HashMap<String, Scalar> {
        &self.values
    }
}

/// Named metric values (loss, accuracy, ...).
pub type Metrics = HashMap<String, f64>;

/// Outcome of one client's local training for one round.
///
/// `num_examples` is the aggregation weight. A client with an empty training
/// partition reports `num_examples == 0` and `parameters: None`; the strategy
/// excludes it from averaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub parameters: Option<ModelParameters>,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Outcome of one client's local evaluation for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Per-epoch training metrics, recorded by the metrics sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_signature_tracks_shapes() {
        let params = ModelParameters::new(vec![
            Tensor::zeros(vec![10, 784]),
            Tensor::zeros(vec![10]),
        ]);
        assert_eq!(params.layout_signature(), vec![vec![10, 784], vec![10]]);
    }

    #[test]
    fn compatible_layouts_pass() {
        let a = ModelParameters::new(vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![3])]);
        let b = ModelParameters::new(vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![3])]);
        assert!(a.check_compatible(&b).is_ok());
    }

    #[test]
    fn mismatched_layer_shape_is_reported() {
        let a = ModelParameters::new(vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![3])]);
        let b = ModelParameters::new(vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![4])]);
        match a.check_compatible(&b) {
            Err(FedError::ShapeMismatch { layer, .. }) => assert_eq!(layer, 1),
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_layer_count_is_reported() {
        let a = ModelParameters::new(vec![Tensor::zeros(vec![3, 2])]);
        let b = ModelParameters::new(vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![3])]);
        assert!(a.check_compatible(&b).is_err());
    }

    #[test]
    fn round_config_carries_round_and_epochs() {
        let config = RoundConfig::for_round(7, 3);
        assert_eq!(config.server_round(), Some(7));
        assert_eq!(config.local_epochs(), Some(3));
        assert_eq!(config.get("missing"), None);
    }
}

use thiserror::Error;

/// Errors raised by the federated core.
///
/// Per-client failures (`ShapeMismatch`, `ClientUnavailable`) are isolated to
/// the round they occur in; `NoValidResults` marks a round degraded but the
/// run continues; only `Configuration` aborts before the first round.
#[derive(Debug, Error)]
pub enum FedError {
    #[error("tensor shape mismatch at layer {layer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        layer: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("client {id} unavailable: {reason}")]
    ClientUnavailable { id: String, reason: String },

    #[error("round {round}: no valid results ({failures} failures, {zero_sample} zero-sample clients)")]
    NoValidResults {
        round: u32,
        failures: usize,
        zero_sample: usize,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T, E = FedError> = std::result::Result<T, E>;

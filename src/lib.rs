//! Federated learning round orchestration with FedAvg aggregation.
//!
//! Clients hold private data and train a shared model locally; the
//! orchestrator dispatches per-round fit/evaluate calls, combines the
//! returned parameters with sample-count-weighted averaging, and records one
//! [`history::RoundRecord`] per round. Clients run either in-process
//! ([`client::InProcessClient`]) or behind gRPC ([`transport::RemoteClient`]),
//! interchangeable behind the [`client::ClientProxy`] contract.

pub mod client;
pub mod common;
pub mod data;
pub mod error;
pub mod history;
pub mod metrics;
pub mod model;
pub mod server;
pub mod strategy;
pub mod transport;

/// Generated gRPC types for the remote-client transport.
pub mod proto {
    tonic::include_proto!("fedsim.v1");
}

pub use client::{ClientProxy, InProcessClient};
pub use common::{
    EvalResult, FitResult, Metrics, ModelParameters, RoundConfig, Scalar, Tensor,
};
pub use error::FedError;
pub use history::{History, RoundRecord};
pub use server::{RoundOrchestrator, ServerConfig};
pub use strategy::{FedAvg, Strategy};

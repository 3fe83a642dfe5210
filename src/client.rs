use log::info;
use std::sync::{Arc, Mutex};

use crate::common::{EvalResult, FitResult, Metrics, ModelParameters, RoundConfig};
use crate::data::ClientDataset;
use crate::error::FedError;
use crate::metrics::{MetricsSink, Phase};
use crate::model::{evaluate, train, Model};

/// Uniform contract over one client, whether it lives in-process or behind a
/// gRPC channel. Implementations must be interchangeable behind
/// `Arc<dyn ClientProxy>`; the orchestrator never cares which one it holds.
#[tonic::async_trait]
pub trait ClientProxy: Send + Sync {
    fn id(&self) -> &str;

    async fn get_parameters(&self) -> Result<ModelParameters, FedError>;

    /// Overwrites the client's local weights; `ShapeMismatch` leaves them
    /// unmodified.
    async fn set_parameters(&self, params: &ModelParameters) -> Result<(), FedError>;

    /// Sets parameters, trains `local_epochs` epochs over the full local
    /// training partition, returns updated parameters + example count +
    /// final-epoch metrics. An empty partition yields `num_examples == 0`,
    /// never an error.
    async fn fit(&self, params: &ModelParameters, config: &RoundConfig)
        -> Result<FitResult, FedError>;

    /// Sets parameters and runs inference only over the local test partition.
    async fn evaluate(&self, params: &ModelParameters, config: &RoundConfig)
        -> Result<EvalResult, FedError>;
}

/// A simulated client: owns a private model replica and private data
/// partitions, shared with nobody.
pub struct InProcessClient<M: Model> {
    id: String,
    model: Mutex<M>,
    data: ClientDataset,
    learning_rate: f32,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl<M: Model> InProcessClient<M> {
    pub fn new(id: impl Into<String>, model: M, data: ClientDataset, learning_rate: f32) -> Self {
        Self {
            id: id.into(),
            model: Mutex::new(model),
            data,
            learning_rate,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[tonic::async_trait]
impl<M: Model> ClientProxy for InProcessClient<M> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_parameters(&self) -> Result<ModelParameters, FedError> {
        let model = self.model.lock().unwrap();
        Ok(model.get_parameters())
    }

    async fn set_parameters(&self, params: &ModelParameters) -> Result<(), FedError> {
        let mut model = self.model.lock().unwrap();
        model.set_parameters(params)
    }

    async fn fit(
        &self,
        params: &ModelParameters,
        config: &RoundConfig,
    ) -> Result<FitResult, FedError> {
        let round = config.server_round().unwrap_or(0);
        let epochs = config.local_epochs().unwrap_or(1);

        let mut model = self.model.lock().unwrap();
        model.set_parameters(params)?;

        if self.data.train.is_empty() {
            // Zero samples signals the strategy to exclude this update
            info!("[client {}, round {}] fit skipped: no local data", self.id, round);
            return Ok(FitResult {
                parameters: None,
                num_examples: 0,
                metrics: Metrics::new(),
            });
        }

        info!(
            "[client {}, round {}] fit: {} epochs over {} examples",
            self.id,
            round,
            epochs,
            self.data.train.num_examples()
        );
        let history = train(&mut *model, &self.data.train, self.learning_rate, epochs);

        if let Some(sink) = &self.sink {
            for m in &history {
                sink.record(&self.id, Phase::Train, round, m.loss, m.accuracy);
            }
        }

        let mut metrics = Metrics::new();
        if let Some(last) = history.last() {
            metrics.insert("loss".to_string(), last.loss);
            metrics.insert("accuracy".to_string(), last.accuracy);
        }

        Ok(FitResult {
            parameters: Some(model.get_parameters()),
            num_examples: self.data.train.num_examples() as u64,
            metrics,
        })
    }

    async fn evaluate(
        &self,
        params: &ModelParameters,
        config: &RoundConfig,
    ) -> Result<EvalResult, FedError> {
        let round = config.server_round().unwrap_or(0);

        let mut model = self.model.lock().unwrap();
        model.set_parameters(params)?;

        if self.data.test.is_empty() {
            return Ok(EvalResult {
                loss: 0.0,
                num_examples: 0,
                metrics: Metrics::new(),
            });
        }

        let (loss, accuracy) = evaluate(&*model, &self.data.test);
        info!(
            "[client {}, round {}] evaluate: loss {:.4} / accuracy {:.2}%",
            self.id,
            round,
            loss,
            accuracy * 100.0
        );

        if let Some(sink) = &self.sink {
            sink.record(&self.id, Phase::Eval, round, loss, accuracy);
        }

        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), accuracy);

        Ok(EvalResult {
            loss,
            num_examples: self.data.test.num_examples() as u64,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Tensor;
    use crate::data::{synthetic_partition, Partition};
    use crate::model::LinearModel;

    fn client_with_data(train: Partition, test: Partition) -> InProcessClient<LinearModel> {
        let feature_dim = train.feature_dim();
        InProcessClient::new(
            "client-0",
            LinearModel::new(2, feature_dim),
            ClientDataset { train, test },
            0.1,
        )
    }

    #[tokio::test]
    async fn fit_returns_updated_parameters_and_sample_count() {
        let client = client_with_data(
            synthetic_partition(40, 2, 4),
            synthetic_partition(10, 2, 4),
        );
        let params = client.get_parameters().await.unwrap();
        let config = RoundConfig::for_round(1, 2);

        let result = client.fit(&params, &config).await.unwrap();
        assert_eq!(result.num_examples, 40);
        assert!(result.parameters.is_some());
        assert!(result.metrics.contains_key("loss"));
        assert!(result.metrics.contains_key("accuracy"));
    }

    #[tokio::test]
    async fn fit_on_empty_partition_reports_zero_samples() {
        let client = client_with_data(Partition::empty(4), synthetic_partition(10, 2, 4));
        let params = client.get_parameters().await.unwrap();
        let config = RoundConfig::for_round(1, 1);

        let result = client.fit(&params, &config).await.unwrap();
        assert_eq!(result.num_examples, 0);
        assert!(result.parameters.is_none());
    }

    #[tokio::test]
    async fn evaluate_reports_accuracy_metric() {
        let client = client_with_data(
            synthetic_partition(40, 2, 4),
            synthetic_partition(12, 2, 4),
        );
        let params = client.get_parameters().await.unwrap();
        let config = RoundConfig::for_round(1, 1);

        let result = client.evaluate(&params, &config).await.unwrap();
        assert_eq!(result.num_examples, 12);
        assert!(result.metrics.contains_key("accuracy"));
    }

    #[tokio::test]
    async fn set_parameters_shape_mismatch_leaves_weights_unmodified() {
        let client = client_with_data(
            synthetic_partition(10, 2, 4),
            synthetic_partition(5, 2, 4),
        );
        let before = client.get_parameters().await.unwrap();

        // Wrong tensor count
        let bad = ModelParameters::new(vec![Tensor::zeros(vec![2, 4])]);
        match client.set_parameters(&bad).await {
            Err(FedError::ShapeMismatch { .. }) => {}
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
        assert_eq!(client.get_parameters().await.unwrap(), before);
    }
}

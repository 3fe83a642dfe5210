use futures::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::client::ClientProxy;
use crate::common::{EvalResult, FitResult, Metrics, ModelParameters, RoundConfig};
use crate::error::FedError;
use crate::history::{History, RoundRecord};
use crate::strategy::Strategy;

/// Run-level knobs, validated before round 1.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_rounds: u32,
    pub local_epochs: usize,
    /// Per-call deadline for fit/evaluate dispatches; a slow client becomes
    /// that round's failure instead of blocking the others.
    pub round_timeout: Option<Duration>,
    /// Resource budget: at most this many client calls in flight at once.
    pub max_concurrent: Option<usize>,
}

impl ServerConfig {
    pub fn new(num_rounds: u32, local_epochs: usize) -> Self {
        Self {
            num_rounds,
            local_epochs,
            round_timeout: None,
            max_concurrent: None,
        }
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), FedError> {
        if self.num_rounds == 0 {
            return Err(FedError::Configuration(
                "num_rounds must be positive".to_string(),
            ));
        }
        if self.local_epochs == 0 {
            return Err(FedError::Configuration(
                "local_epochs must be positive".to_string(),
            ));
        }
        if self.max_concurrent == Some(0) {
            return Err(FedError::Configuration(
                "max_concurrent must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drives `num_rounds` sequential rounds: configure, dispatch fit, aggregate,
/// evaluate, record. Owns the global parameters and the History exclusively;
/// both are only touched between dispatch steps.
pub struct RoundOrchestrator<S: Strategy> {
    clients: Vec<Arc<dyn ClientProxy>>,
    strategy: S,
    config: ServerConfig,
}

impl<S: Strategy> RoundOrchestrator<S> {
    pub fn new(clients: Vec<Arc<dyn ClientProxy>>, strategy: S, config: ServerConfig) -> Self {
        Self {
            clients,
            strategy,
            config,
        }
    }

    /// Runs the full federation. `initial` supplies a checkpoint; otherwise
    /// the first reachable client provides the starting parameters.
    ///
    /// Per-client failures are isolated to their round; only startup
    /// configuration problems abort the run.
    pub async fn run(
        self,
        initial: Option<ModelParameters>,
    ) -> Result<(ModelParameters, History), FedError> {
        self.config.validate()?;
        if self.clients.is_empty() {
            return Err(FedError::Configuration("no clients available".to_string()));
        }

        let mut global = match initial {
            Some(params) => params,
            None => self.initial_parameters().await?,
        };
        self.check_architecture(&global).await?;

        let mut history = History::new();
        for round in 1..=self.config.num_rounds {
            let record = self.run_round(round, &mut global).await;
            history.push(record);
        }

        info!(
            "run complete: {} rounds, {} degraded",
            history.len(),
            history.degraded_rounds()
        );
        Ok((global, history))
    }

    async fn initial_parameters(&self) -> Result<ModelParameters, FedError> {
        for client in &self.clients {
            match client.get_parameters().await {
                Ok(params) => {
                    info!("initial parameters taken from client {}", client.id());
                    return Ok(params);
                }
                Err(e) => warn!("client {} unreachable at startup: {}", client.id(), e),
            }
        }
        Err(FedError::Configuration(
            "no client could supply initial parameters".to_string(),
        ))
    }

    /// Every reachable client must share the global layout; a disagreement is
    /// fatal before round 1. Unreachable clients are only warned about here;
    /// they fail per-round like any other unavailable client.
    async fn check_architecture(&self, global: &ModelParameters) -> Result<(), FedError> {
        for client in &self.clients {
            match client.get_parameters().await {
                Ok(params) => {
                    if let Err(e) = global.check_compatible(&params) {
                        return Err(FedError::Configuration(format!(
                            "client {} architecture mismatch: {}",
                            client.id(),
                            e
                        )));
                    }
                }
                Err(e) => warn!(
                    "client {} unreachable during architecture check: {}",
                    client.id(),
                    e
                ),
            }
        }
        Ok(())
    }

    async fn run_round(&self, round: u32, global: &mut ModelParameters) -> RoundRecord {
        let started = Instant::now();

        let participants = self.strategy.configure_fit(round, global, &self.clients);
        info!(
            "round {}/{}: dispatching fit to {} client(s)",
            round,
            self.config.num_rounds,
            participants.len()
        );

        let (fit_ok, fit_failures) = self.dispatch_fit(participants, global).await;

        let (fit_metrics, degraded) =
            match self
                .strategy
                .aggregate_fit(round, &fit_ok, fit_failures.len())
            {
                Ok((params, metrics)) => {
                    // The new global state becomes visible exactly here; the
                    // evaluation phase and round r+1 see only this snapshot.
                    *global = params;
                    (metrics, false)
                }
                Err(e) => {
                    warn!("round {}: keeping previous parameters: {}", round, e);
                    (Metrics::new(), true)
                }
            };

        let global_eval = self.strategy.evaluate_global(round, global);
        if let Some((loss, _)) = &global_eval {
            info!("round {}: server-side evaluation loss {:.4}", round, loss);
        }

        let eval_config = RoundConfig::for_round(round, self.config.local_epochs);
        let (eval_ok, eval_failures) = self.dispatch_evaluate(global, &eval_config).await;
        let (eval_loss, eval_metrics) =
            self.strategy
                .aggregate_evaluate(round, &eval_ok, eval_failures.len());

        info!(
            "round {}: eval loss {:.4}, {} fit failure(s), {} eval failure(s){}",
            round,
            eval_loss,
            fit_failures.len(),
            eval_failures.len(),
            if degraded { " [degraded]" } else { "" }
        );

        RoundRecord {
            round,
            fit_metrics,
            fit_failures: fit_failures.len(),
            eval_loss: if eval_loss.is_nan() { None } else { Some(eval_loss) },
            eval_metrics,
            eval_failures: eval_failures.len(),
            global_eval,
            degraded,
            elapsed: started.elapsed(),
        }
    }

    fn semaphore(&self, dispatched: usize) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(
            self.config.max_concurrent.unwrap_or(dispatched.max(1)),
        ))
    }

    async fn dispatch_fit(
        &self,
        participants: Vec<(Arc<dyn ClientProxy>, RoundConfig)>,
        global: &ModelParameters,
    ) -> (Vec<(String, FitResult)>, Vec<(String, FedError)>) {
        let semaphore = self.semaphore(participants.len());
        let deadline = self.config.round_timeout;

        let mut ids = Vec::with_capacity(participants.len());
        let mut handles = Vec::with_capacity(participants.len());
        for (client, config) in participants {
            let id = client.id().to_string();
            ids.push(id.clone());
            let params = global.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // The semaphore lives for this dispatch only and is never closed.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore closed mid-round");
                let call = client.fit(&params, &config);
                match deadline {
                    Some(d) => match timeout(d, call).await {
                        Ok(result) => result,
                        Err(_) => Err(FedError::ClientUnavailable {
                            id,
                            reason: "round timeout elapsed".to_string(),
                        }),
                    },
                    None => call.await,
                }
            }));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(result)) => successes.push((id, result)),
                Ok(Err(e)) => {
                    warn!("fit failed for client {}: {}", id, e);
                    failures.push((id, e));
                }
                Err(join_error) => {
                    warn!("fit task for client {} did not finish: {}", id, join_error);
                    failures.push((
                        id.clone(),
                        FedError::ClientUnavailable {
                            id,
                            reason: join_error.to_string(),
                        },
                    ));
                }
            }
        }
        (successes, failures)
    }

    async fn dispatch_evaluate(
        &self,
        global: &ModelParameters,
        config: &RoundConfig,
    ) -> (Vec<(String, EvalResult)>, Vec<(String, FedError)>) {
        let semaphore = self.semaphore(self.clients.len());
        let deadline = self.config.round_timeout;

        let mut ids = Vec::with_capacity(self.clients.len());
        let mut handles = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            let client = Arc::clone(client);
            let id = client.id().to_string();
            ids.push(id.clone());
            let params = global.clone();
            let config = config.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore closed mid-round");
                let call = client.evaluate(&params, &config);
                match deadline {
                    Some(d) => match timeout(d, call).await {
                        Ok(result) => result,
                        Err(_) => Err(FedError::ClientUnavailable {
                            id,
                            reason: "round timeout elapsed".to_string(),
                        }),
                    },
                    None => call.await,
                }
            }));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(result)) => successes.push((id, result)),
                Ok(Err(e)) => {
                    warn!("evaluate failed for client {}: {}", id, e);
                    failures.push((id, e));
                }
                Err(join_error) => {
                    warn!(
                        "evaluate task for client {} did not finish: {}",
                        id, join_error
                    );
                    failures.push((
                        id.clone(),
                        FedError::ClientUnavailable {
                            id,
                            reason: join_error.to_string(),
                        },
                    ));
                }
            }
        }
        (successes, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InProcessClient;
    use crate::common::Tensor;
    use crate::data::{synthetic_partition, ClientDataset};
    use crate::model::LinearModel;
    use crate::strategy::FedAvg;

    /// Test double that always answers with preset parameters.
    struct StubClient {
        id: String,
        params: ModelParameters,
        num_examples: u64,
    }

    #[tonic::async_trait]
    impl ClientProxy for StubClient {
        fn id(&self) -> &str {
            &self.id
        }

        async fn get_parameters(&self) -> Result<ModelParameters, FedError> {
            Ok(self.params.clone())
        }

        async fn set_parameters(&self, params: &ModelParameters) -> Result<(), FedError> {
            self.params.check_compatible(params)
        }

        async fn fit(
            &self,
            _params: &ModelParameters,
            _config: &RoundConfig,
        ) -> Result<FitResult, FedError> {
            Ok(FitResult {
                parameters: Some(self.params.clone()),
                num_examples: self.num_examples,
                metrics: Metrics::new(),
            })
        }

        async fn evaluate(
            &self,
            _params: &ModelParameters,
            _config: &RoundConfig,
        ) -> Result<EvalResult, FedError> {
            Ok(EvalResult {
                loss: 0.5,
                num_examples: self.num_examples,
                metrics: Metrics::new(),
            })
        }
    }

    /// Test double whose fit and evaluate always fail.
    struct BrokenClient {
        id: String,
        params: ModelParameters,
    }

    #[tonic::async_trait]
    impl ClientProxy for BrokenClient {
        fn id(&self) -> &str {
            &self.id
        }

        async fn get_parameters(&self) -> Result<ModelParameters, FedError> {
            Ok(self.params.clone())
        }

        async fn set_parameters(&self, _params: &ModelParameters) -> Result<(), FedError> {
            Ok(())
        }

        async fn fit(
            &self,
            _params: &ModelParameters,
            _config: &RoundConfig,
        ) -> Result<FitResult, FedError> {
            Err(FedError::ClientUnavailable {
                id: self.id.clone(),
                reason: "connection refused".to_string(),
            })
        }

        async fn evaluate(
            &self,
            _params: &ModelParameters,
            _config: &RoundConfig,
        ) -> Result<EvalResult, FedError> {
            Err(FedError::ClientUnavailable {
                id: self.id.clone(),
                reason: "connection refused".to_string(),
            })
        }
    }

    fn flat_params(values: Vec<f32>) -> ModelParameters {
        ModelParameters::new(vec![Tensor::new(vec![values.len()], values)])
    }

    fn sim_clients(count: usize) -> Vec<Arc<dyn ClientProxy>> {
        (0..count)
            .map(|i| {
                Arc::new(InProcessClient::new(
                    format!("client-{}", i),
                    LinearModel::new(3, 6),
                    ClientDataset {
                        train: synthetic_partition(30, 3, 6),
                        test: synthetic_partition(10, 3, 6),
                    },
                    0.1,
                )) as Arc<dyn ClientProxy>
            })
            .collect()
    }

    #[tokio::test]
    async fn history_has_one_record_per_round() {
        let orchestrator = RoundOrchestrator::new(
            sim_clients(2),
            FedAvg::new(1),
            ServerConfig::new(4, 1),
        );
        let (_, history) = orchestrator.run(None).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.degraded_rounds(), 0);
        for (i, record) in history.rounds().iter().enumerate() {
            assert_eq!(record.round, i as u32 + 1);
            assert!(record.eval_loss.is_some());
        }
    }

    #[tokio::test]
    async fn tight_concurrency_budget_still_serves_every_client() {
        let config = ServerConfig::new(2, 1).with_max_concurrent(1);
        let orchestrator = RoundOrchestrator::new(sim_clients(3), FedAvg::new(1), config);
        let (_, history) = orchestrator.run(None).await.unwrap();
        assert_eq!(history.len(), 2);
        for record in history.rounds() {
            assert_eq!(record.fit_failures, 0);
            assert_eq!(record.eval_failures, 0);
        }
    }

    #[tokio::test]
    async fn zero_rounds_is_a_configuration_error() {
        let orchestrator =
            RoundOrchestrator::new(sim_clients(1), FedAvg::new(1), ServerConfig::new(0, 1));
        assert!(matches!(
            orchestrator.run(None).await,
            Err(FedError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn zero_epochs_is_a_configuration_error() {
        let orchestrator =
            RoundOrchestrator::new(sim_clients(1), FedAvg::new(1), ServerConfig::new(3, 0));
        assert!(matches!(
            orchestrator.run(None).await,
            Err(FedError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn no_clients_is_a_configuration_error() {
        let orchestrator =
            RoundOrchestrator::new(Vec::new(), FedAvg::new(1), ServerConfig::new(1, 1));
        assert!(matches!(
            orchestrator.run(None).await,
            Err(FedError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn architecture_mismatch_aborts_before_round_one() {
        let clients: Vec<Arc<dyn ClientProxy>> = vec![
            Arc::new(StubClient {
                id: "client-0".to_string(),
                params: flat_params(vec![1.0, 2.0]),
                num_examples: 10,
            }),
            Arc::new(StubClient {
                id: "client-1".to_string(),
                params: flat_params(vec![1.0, 2.0, 3.0]),
                num_examples: 10,
            }),
        ];
        let orchestrator =
            RoundOrchestrator::new(clients, FedAvg::new(1), ServerConfig::new(2, 1));
        assert!(matches!(
            orchestrator.run(None).await,
            Err(FedError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn failing_client_is_isolated_and_survivor_wins() {
        let survivor_params = flat_params(vec![4.0, 5.0, 6.0]);
        let clients: Vec<Arc<dyn ClientProxy>> = vec![
            Arc::new(BrokenClient {
                id: "client-0".to_string(),
                params: survivor_params.clone(),
            }),
            Arc::new(StubClient {
                id: "client-1".to_string(),
                params: survivor_params.clone(),
                num_examples: 50,
            }),
        ];
        let orchestrator =
            RoundOrchestrator::new(clients, FedAvg::new(1), ServerConfig::new(1, 1));
        let (global, history) = orchestrator.run(None).await.unwrap();

        // Single contributor: aggregation degenerates to its parameters
        assert_eq!(global, survivor_params);
        let record = history.last().unwrap();
        assert_eq!(record.fit_failures, 1);
        assert!(!record.degraded);
    }

    #[tokio::test]
    async fn all_clients_failing_keeps_parameters_and_marks_degraded() {
        let initial = flat_params(vec![9.0, 8.0]);
        let clients: Vec<Arc<dyn ClientProxy>> = vec![
            Arc::new(BrokenClient {
                id: "client-0".to_string(),
                params: initial.clone(),
            }),
            Arc::new(BrokenClient {
                id: "client-1".to_string(),
                params: initial.clone(),
            }),
        ];
        let orchestrator =
            RoundOrchestrator::new(clients, FedAvg::new(1), ServerConfig::new(3, 1));
        let (global, history) = orchestrator.run(Some(initial.clone())).await.unwrap();

        assert_eq!(global, initial);
        assert_eq!(history.len(), 3);
        assert_eq!(history.degraded_rounds(), 3);
        for record in history.rounds() {
            assert!(record.eval_loss.is_none());
        }
    }

    #[tokio::test]
    async fn global_evaluation_hook_is_recorded() {
        let strategy = FedAvg::new(1).with_evaluate_fn(Box::new(|_, _| {
            let mut metrics = Metrics::new();
            metrics.insert("accuracy".to_string(), 0.5);
            Some((1.25, metrics))
        }));
        let orchestrator =
            RoundOrchestrator::new(sim_clients(2), strategy, ServerConfig::new(2, 1));
        let (_, history) = orchestrator.run(None).await.unwrap();
        for record in history.rounds() {
            let (loss, metrics) = record.global_eval.as_ref().unwrap();
            assert_eq!(*loss, 1.25);
            assert_eq!(metrics["accuracy"], 0.5);
        }
    }
}

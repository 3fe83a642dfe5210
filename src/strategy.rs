use log::warn;
use std::sync::Arc;

use crate::client::ClientProxy;
use crate::common::{EvalResult, FitResult, Metrics, ModelParameters, RoundConfig, Tensor};
use crate::error::FedError;

/// Optional server-side evaluation hook: round, global parameters ->
/// (loss, metrics), or `None` when no server-held validation set exists.
pub type GlobalEvalFn =
    Box<dyn Fn(u32, &ModelParameters) -> Option<(f64, Metrics)> + Send + Sync>;

/// Optional per-round local-epoch schedule.
pub type EpochScheduleFn = Box<dyn Fn(u32) -> usize + Send + Sync>;

/// Decides which clients participate each round, what config they receive,
/// and how their results fold into one global parameter set and metric set.
pub trait Strategy: Send + Sync {
    /// Selects participants and builds the per-round config.
    fn configure_fit(
        &self,
        round: u32,
        global: &ModelParameters,
        clients: &[Arc<dyn ClientProxy>],
    ) -> Vec<(Arc<dyn ClientProxy>, RoundConfig)>;

    /// Folds successful fit results into the new global parameters plus
    /// aggregated training metrics. `NoValidResults` when nothing usable
    /// came back.
    fn aggregate_fit(
        &self,
        round: u32,
        results: &[(String, FitResult)],
        failures: usize,
    ) -> Result<(ModelParameters, Metrics), FedError>;

    /// Weighted-average loss and metrics across client evaluations. A zero
    /// denominator yields NaN values rather than an error.
    fn aggregate_evaluate(
        &self,
        round: u32,
        results: &[(String, EvalResult)],
        failures: usize,
    ) -> (f64, Metrics);

    /// Server-side evaluation of the aggregated model; `None` when absent.
    fn evaluate_global(&self, round: u32, params: &ModelParameters) -> Option<(f64, Metrics)>;
}

/// Sample-count-weighted federated averaging (McMahan et al., 2017).
pub struct FedAvg {
    local_epochs: usize,
    fraction_fit: f64,
    epochs_schedule: Option<EpochScheduleFn>,
    evaluate_fn: Option<GlobalEvalFn>,
}

impl FedAvg {
    pub fn new(local_epochs: usize) -> Self {
        Self {
            local_epochs,
            fraction_fit: 1.0,
            epochs_schedule: None,
            evaluate_fn: None,
        }
    }

    /// Fraction of available clients selected per round; selection takes a
    /// deterministic prefix so runs stay reproducible. Always at least one.
    pub fn with_fraction_fit(mut self, fraction: f64) -> Self {
        self.fraction_fit = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_epochs_schedule(mut self, schedule: EpochScheduleFn) -> Self {
        self.epochs_schedule = Some(schedule);
        self
    }

    pub fn with_evaluate_fn(mut self, evaluate_fn: GlobalEvalFn) -> Self {
        self.evaluate_fn = Some(evaluate_fn);
        self
    }

    fn epochs_for_round(&self, round: u32) -> usize {
        match &self.epochs_schedule {
            Some(schedule) => schedule(round),
            None => self.local_epochs,
        }
    }
}

impl Strategy for FedAvg {
    fn configure_fit(
        &self,
        round: u32,
        _global: &ModelParameters,
        clients: &[Arc<dyn ClientProxy>],
    ) -> Vec<(Arc<dyn ClientProxy>, RoundConfig)> {
        let selected = ((clients.len() as f64 * self.fraction_fit).ceil() as usize)
            .clamp(1, clients.len().max(1));
        let config = RoundConfig::for_round(round, self.epochs_for_round(round));
        clients
            .iter()
            .take(selected)
            .map(|c| (Arc::clone(c), config.clone()))
            .collect()
    }

    fn aggregate_fit(
        &self,
        round: u32,
        results: &[(String, FitResult)],
        failures: usize,
    ) -> Result<(ModelParameters, Metrics), FedError> {
        let contributors: Vec<(u64, &FitResult)> = results
            .iter()
            .filter(|(_, r)| r.num_examples > 0 && r.parameters.is_some())
            .map(|(_, r)| (r.num_examples, r))
            .collect();

        let zero_sample = results.len() - contributors.len();
        if contributors.is_empty() {
            return Err(FedError::NoValidResults {
                round,
                failures,
                zero_sample,
            });
        }
        if zero_sample > 0 {
            warn!(
                "round {}: excluding {} zero-sample client(s) from aggregation",
                round, zero_sample
            );
        }

        let weighted_params: Vec<(u64, &ModelParameters)> = contributors
            .iter()
            .filter_map(|(n, r)| r.parameters.as_ref().map(|p| (*n, p)))
            .collect();
        let parameters = weighted_average_parameters(&weighted_params)?;

        let weighted_metrics: Vec<(u64, &Metrics)> =
            contributors.iter().map(|(n, r)| (*n, &r.metrics)).collect();
        let metrics = weighted_average_metrics(&weighted_metrics);

        Ok((parameters, metrics))
    }

    fn aggregate_evaluate(
        &self,
        round: u32,
        results: &[(String, EvalResult)],
        failures: usize,
    ) -> (f64, Metrics) {
        let contributors: Vec<(u64, &EvalResult)> = results
            .iter()
            .filter(|(_, r)| r.num_examples > 0)
            .map(|(_, r)| (r.num_examples, r))
            .collect();

        if contributors.is_empty() {
            warn!(
                "round {}: no valid evaluation results ({} failures)",
                round, failures
            );
            let mut metrics = Metrics::new();
            metrics.insert("accuracy".to_string(), f64::NAN);
            return (f64::NAN, metrics);
        }

        let total: u64 = contributors.iter().map(|(n, _)| n).sum();
        let loss = contributors
            .iter()
            .map(|(n, r)| *n as f64 * r.loss)
            .sum::<f64>()
            / total as f64;

        let weighted: Vec<(u64, &Metrics)> =
            contributors.iter().map(|(n, r)| (*n, &r.metrics)).collect();
        (loss, weighted_average_metrics(&weighted))
    }

    fn evaluate_global(&self, round: u32, params: &ModelParameters) -> Option<(f64, Metrics)> {
        self.evaluate_fn.as_ref().and_then(|f| f(round, params))
    }
}

/// Position-wise weighted average: `global[i] = Σ n_c·p_c[i] / Σ n_c`.
///
/// Callers must pass only contributors with `n > 0`; layouts must agree.
pub fn weighted_average_parameters(
    contributors: &[(u64, &ModelParameters)],
) -> Result<ModelParameters, FedError> {
    let (_, first) = contributors
        .first()
        .ok_or_else(|| FedError::Configuration("no contributors to average".to_string()))?;
    for (_, params) in &contributors[1..] {
        first.check_compatible(params)?;
    }

    let total: u64 = contributors.iter().map(|(n, _)| n).sum();
    let mut accumulators: Vec<Vec<f64>> = first
        .tensors
        .iter()
        .map(|t| vec![0.0; t.len()])
        .collect();

    for (n, params) in contributors {
        let weight = *n as f64;
        for (acc, tensor) in accumulators.iter_mut().zip(params.tensors.iter()) {
            for (slot, &v) in acc.iter_mut().zip(tensor.values.iter()) {
                *slot += weight * f64::from(v);
            }
        }
    }

    let tensors = first
        .tensors
        .iter()
        .zip(accumulators)
        .map(|(t, acc)| {
            Tensor::new(
                t.shape.clone(),
                acc.into_iter().map(|v| (v / total as f64) as f32).collect(),
            )
        })
        .collect();
    Ok(ModelParameters::new(tensors))
}

/// Per-key weighted average of metric maps. The denominator for each key only
/// counts contributors that reported it.
pub fn weighted_average_metrics(contributors: &[(u64, &Metrics)]) -> Metrics {
    let mut sums: Metrics = Metrics::new();
    let mut weights: std::collections::HashMap<String, u64> = std::collections::HashMap::new();

    for (n, metrics) in contributors {
        for (key, value) in metrics.iter() {
            *sums.entry(key.clone()).or_insert(0.0) += *n as f64 * value;
            *weights.entry(key.clone()).or_insert(0) += n;
        }
    }

    sums.into_iter()
        .map(|(key, sum)| {
            let total = weights[&key];
            (key, sum / total as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: Vec<f32>) -> ModelParameters {
        ModelParameters::new(vec![Tensor::new(vec![values.len()], values)])
    }

    fn fit_result(values: Vec<f32>, n: u64, accuracy: f64) -> FitResult {
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), accuracy);
        FitResult {
            parameters: Some(params(values)),
            num_examples: n,
            metrics,
        }
    }

    fn eval_result(loss: f64, n: u64, accuracy: f64) -> EvalResult {
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), accuracy);
        EvalResult {
            loss,
            num_examples: n,
            metrics,
        }
    }

    #[test]
    fn identical_parameters_average_to_themselves() {
        let strategy = FedAvg::new(1);
        let results = vec![
            ("client-0".to_string(), fit_result(vec![1.0, 2.0, 3.0], 10, 0.5)),
            ("client-1".to_string(), fit_result(vec![1.0, 2.0, 3.0], 90, 0.5)),
        ];
        let (aggregated, _) = strategy.aggregate_fit(1, &results, 0).unwrap();
        assert_eq!(aggregated, params(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn weighted_average_uses_sample_counts() {
        // (1*1 + 3*3) / 4 = 2.5
        let a = params(vec![1.0]);
        let b = params(vec![3.0]);
        let result = weighted_average_parameters(&[(1, &a), (3, &b)]).unwrap();
        assert!((result.tensors[0].values[0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn single_contributor_passes_through_unchanged() {
        let strategy = FedAvg::new(1);
        let results = vec![("client-0".to_string(), fit_result(vec![42.0, 7.0], 50, 0.9))];
        let (aggregated, _) = strategy.aggregate_fit(3, &results, 1).unwrap();
        assert_eq!(aggregated, params(vec![42.0, 7.0]));
    }

    #[test]
    fn all_zero_samples_is_no_valid_results() {
        let strategy = FedAvg::new(1);
        let results = vec![
            (
                "client-0".to_string(),
                FitResult {
                    parameters: None,
                    num_examples: 0,
                    metrics: Metrics::new(),
                },
            ),
            (
                "client-1".to_string(),
                FitResult {
                    parameters: None,
                    num_examples: 0,
                    metrics: Metrics::new(),
                },
            ),
        ];
        match strategy.aggregate_fit(2, &results, 1) {
            Err(FedError::NoValidResults {
                round,
                failures,
                zero_sample,
            }) => {
                assert_eq!(round, 2);
                assert_eq!(failures, 1);
                assert_eq!(zero_sample, 2);
            }
            other => panic!("expected NoValidResults, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_layouts_fail_aggregation() {
        let a = params(vec![1.0, 2.0]);
        let b = params(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            weighted_average_parameters(&[(1, &a), (1, &b)]),
            Err(FedError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn scenario_a_weighted_accuracy() {
        // (100*0.8 + 300*0.6) / 400 = 0.65
        let strategy = FedAvg::new(1);
        let results = vec![
            ("client-0".to_string(), eval_result(0.4, 100, 0.8)),
            ("client-1".to_string(), eval_result(0.9, 300, 0.6)),
        ];
        let (_, metrics) = strategy.aggregate_evaluate(1, &results, 0);
        assert!((metrics["accuracy"] - 0.65).abs() < 1e-9);
    }

    #[test]
    fn aggregate_evaluate_is_permutation_invariant() {
        let strategy = FedAvg::new(1);
        let mut results = vec![
            ("client-0".to_string(), eval_result(0.3, 17, 0.91)),
            ("client-1".to_string(), eval_result(0.7, 113, 0.42)),
            ("client-2".to_string(), eval_result(1.1, 59, 0.66)),
        ];
        let (loss_a, metrics_a) = strategy.aggregate_evaluate(1, &results, 0);
        results.reverse();
        let (loss_b, metrics_b) = strategy.aggregate_evaluate(1, &results, 0);
        assert!((loss_a - loss_b).abs() < 1e-12);
        assert!((metrics_a["accuracy"] - metrics_b["accuracy"]).abs() < 1e-12);
    }

    #[test]
    fn aggregate_evaluate_zero_denominator_yields_nan() {
        let strategy = FedAvg::new(1);
        let results = vec![("client-0".to_string(), eval_result(0.5, 0, 0.8))];
        let (loss, metrics) = strategy.aggregate_evaluate(4, &results, 2);
        assert!(loss.is_nan());
        assert!(metrics["accuracy"].is_nan());
    }

    #[test]
    fn denominator_equals_sum_of_successful_sample_counts() {
        // Weighted mean of per-client constant metrics recovers the exact
        // Σ n·v / Σ n with Σ n = 10 + 30 = 40
        let mut m1 = Metrics::new();
        m1.insert("loss".to_string(), 2.0);
        let mut m2 = Metrics::new();
        m2.insert("loss".to_string(), 6.0);
        let averaged = weighted_average_metrics(&[(10, &m1), (30, &m2)]);
        assert!((averaged["loss"] - (10.0 * 2.0 + 30.0 * 6.0) / 40.0).abs() < 1e-12);
    }

    #[test]
    fn epoch_schedule_overrides_constant_epochs() {
        let strategy = FedAvg::new(1)
            .with_epochs_schedule(Box::new(|round| if round > 2 { 2 } else { 1 }));
        let global = params(vec![0.0]);
        let clients: Vec<Arc<dyn ClientProxy>> = Vec::new();
        // No clients: selection is empty either way, but the config builder
        // still reflects the schedule
        assert!(strategy.configure_fit(1, &global, &clients).is_empty());
        assert_eq!(strategy.epochs_for_round(1), 1);
        assert_eq!(strategy.epochs_for_round(3), 2);
    }
}

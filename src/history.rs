use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::Metrics;

/// Summary of one completed round. Exactly one record is appended per round,
/// degraded or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    /// Weighted-average training metrics over contributing clients.
    pub fit_metrics: Metrics,
    pub fit_failures: usize,
    pub eval_loss: Option<f64>,
    pub eval_metrics: Metrics,
    pub eval_failures: usize,
    /// Server-side evaluation of the aggregated model, when a hook exists.
    pub global_eval: Option<(f64, Metrics)>,
    /// True when `aggregate_fit` had no valid results and the previous global
    /// parameters were retained.
    pub degraded: bool,
    pub elapsed: Duration,
}

/// Ordered per-round records for one complete run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    rounds: Vec<RoundRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    pub fn degraded_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.degraded).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_in_order() {
        let mut history = History::new();
        for round in 1..=3 {
            history.push(RoundRecord {
                round,
                fit_metrics: Metrics::new(),
                fit_failures: 0,
                eval_loss: None,
                eval_metrics: Metrics::new(),
                eval_failures: 0,
                global_eval: None,
                degraded: round == 2,
                elapsed: Duration::from_millis(5),
            });
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.degraded_rounds(), 1);
        assert_eq!(history.last().unwrap().round, 3);
    }
}

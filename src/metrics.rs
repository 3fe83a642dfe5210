use log::warn;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Which side of a round a metric row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Eval => "eval",
        }
    }
}

/// Append-only per-client, per-phase metric log. Write-only from the core's
/// perspective; implementations must never fail the round.
pub trait MetricsSink: Send + Sync {
    fn record(&self, client_id: &str, phase: Phase, round: u32, loss: f64, accuracy: f64);
}

/// Writes `client_<id>_<phase>_metrics.csv` files under a directory, one
/// `(round, loss, accuracy)` row per call, header on first write.
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_row(&self, client_id: &str, phase: Phase, round: u32, loss: f64, accuracy: f64)
        -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("client_{}_{}_metrics.csv", client_id, phase.as_str()));
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "round,loss,accuracy")?;
        }
        writeln!(file, "{},{},{}", round, loss, accuracy)
    }
}

impl MetricsSink for CsvSink {
    fn record(&self, client_id: &str, phase: Phase, round: u32, loss: f64, accuracy: f64) {
        if let Err(e) = self.write_row(client_id, phase, round, loss, accuracy) {
            warn!("failed to record metrics for client {}: {}", client_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_append_under_one_header() {
        let dir = std::env::temp_dir().join(format!("fedsim-metrics-{}", uuid::Uuid::new_v4()));
        let sink = CsvSink::new(&dir);
        sink.record("0", Phase::Train, 1, 0.9, 0.5);
        sink.record("0", Phase::Train, 2, 0.7, 0.6);
        sink.record("0", Phase::Eval, 1, 0.8, 0.55);

        let train = std::fs::read_to_string(dir.join("client_0_train_metrics.csv")).unwrap();
        let lines: Vec<&str> = train.lines().collect();
        assert_eq!(lines[0], "round,loss,accuracy");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("1,"));

        assert!(dir.join("client_0_eval_metrics.csv").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

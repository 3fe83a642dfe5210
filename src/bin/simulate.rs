use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fedsim::client::{ClientProxy, InProcessClient};
use fedsim::data::{synthetic_client_datasets, synthetic_partition, MnistData};
use fedsim::metrics::CsvSink;
use fedsim::model::{evaluate, LinearModel, Model};
use fedsim::strategy::FedAvg;
use fedsim::{Metrics, RoundOrchestrator, ServerConfig};

#[derive(Parser)]
#[command(name = "fedsim-simulate")]
#[command(about = "Run the full multi-round federated loop in-process")]
struct Args {
    #[arg(long, default_value = "2")]
    num_clients: usize,

    #[arg(long, default_value = "10")]
    num_rounds: u32,

    #[arg(long, default_value = "1")]
    local_epochs: usize,

    #[arg(long, default_value = "0.1")]
    learning_rate: f32,

    /// Upper bound on concurrently running client calls
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Per-call timeout in seconds; a slow client fails its round
    #[arg(long)]
    round_timeout: Option<u64>,

    /// Train on MNIST instead of synthetic data (downloads on first use)
    #[arg(long)]
    mnist: bool,

    #[arg(long, default_value = "metrics")]
    metrics_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (datasets, server_test, num_classes) = if args.mnist {
        let mnist = MnistData::load().await?;
        let server_test = mnist.test.clone();
        (mnist.client_datasets(args.num_clients), server_test, 10)
    } else {
        let datasets = synthetic_client_datasets(args.num_clients, 200, 10, 32);
        (datasets, synthetic_partition(100, 10, 32), 10)
    };
    let feature_dim = server_test.feature_dim();

    let sink = Arc::new(CsvSink::new(&args.metrics_dir));
    let clients: Vec<Arc<dyn ClientProxy>> = datasets
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            Arc::new(
                InProcessClient::new(
                    format!("client-{}", i),
                    LinearModel::new(num_classes, feature_dim),
                    data,
                    args.learning_rate,
                )
                .with_sink(sink.clone()),
            ) as Arc<dyn ClientProxy>
        })
        .collect();

    // Server-side evaluation on the held-out test set
    let strategy = FedAvg::new(args.local_epochs).with_evaluate_fn(Box::new(
        move |_round, params| {
            let mut model = LinearModel::new(num_classes, feature_dim);
            model.set_parameters(params).ok()?;
            let (loss, accuracy) = evaluate(&model, &server_test);
            let mut metrics = Metrics::new();
            metrics.insert("accuracy".to_string(), accuracy);
            Some((loss, metrics))
        },
    ));

    let mut config = ServerConfig::new(args.num_rounds, args.local_epochs);
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent(max);
    }
    if let Some(secs) = args.round_timeout {
        config = config.with_round_timeout(Duration::from_secs(secs));
    }

    info!(
        "starting simulation: {} clients, {} rounds, {} local epoch(s)",
        args.num_clients, args.num_rounds, args.local_epochs
    );
    let orchestrator = RoundOrchestrator::new(clients, strategy, config);
    let (global, history) = orchestrator.run(None).await?;

    println!("Round summary:");
    for record in history.rounds() {
        let accuracy = record
            .eval_metrics
            .get("accuracy")
            .copied()
            .unwrap_or(f64::NAN);
        let marker = if record.degraded { " [degraded]" } else { "" };
        println!(
            "  round {:>3}: eval loss {:>8.4}, accuracy {:>6.2}%, failures {}/{}{}",
            record.round,
            record.eval_loss.unwrap_or(f64::NAN),
            accuracy * 100.0,
            record.fit_failures,
            record.fit_failures + record.eval_failures,
            marker
        );
    }
    if let Some((loss, metrics)) = history.last().and_then(|r| r.global_eval.as_ref()) {
        println!(
            "Final server-side evaluation: loss {:.4}, accuracy {:.2}%",
            loss,
            metrics.get("accuracy").copied().unwrap_or(f64::NAN) * 100.0
        );
    }
    println!(
        "Trained global model: {} tensor(s), {} parameter(s)",
        global.tensors.len(),
        global.tensors.iter().map(|t| t.len()).sum::<usize>()
    );

    Ok(())
}

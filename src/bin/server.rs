use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;

use fedsim::client::ClientProxy;
use fedsim::proto::aggregator_server::AggregatorServer;
use fedsim::strategy::FedAvg;
use fedsim::transport::{AggregatorService, RegistrationLog, RemoteClient};
use fedsim::{RoundOrchestrator, ServerConfig};

#[derive(Parser)]
#[command(name = "fedsim-server")]
#[command(about = "A federated learning aggregator driving remote clients")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50051")]
    address: String,

    /// Number of client registrations to wait for before round 1
    #[arg(long, default_value = "2")]
    expected_clients: usize,

    #[arg(long, default_value = "10")]
    num_rounds: u32,

    #[arg(long, default_value = "1")]
    local_epochs: usize,

    /// Per-call timeout in seconds; a slow client fails its round
    #[arg(long, default_value = "120")]
    round_timeout: u64,

    /// Upper bound on concurrently running client calls
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let addr: SocketAddr = args.address.parse()?;

    let log = Arc::new(RegistrationLog::new());
    let registration = tokio::spawn(
        Server::builder()
            .add_service(AggregatorServer::new(AggregatorService::new(Arc::clone(
                &log,
            ))))
            .serve(addr),
    );

    info!(
        "aggregator on {}; waiting for {} client(s) to register",
        addr, args.expected_clients
    );
    while log.count() < args.expected_clients {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let registrations = log.snapshot();
    let mut clients: Vec<Arc<dyn ClientProxy>> = Vec::with_capacity(registrations.len());
    for r in &registrations {
        info!("client {} at {}", r.client_id, r.address);
        clients.push(Arc::new(RemoteClient::new(&r.client_id, &r.address)?));
    }

    let mut config = ServerConfig::new(args.num_rounds, args.local_epochs)
        .with_round_timeout(Duration::from_secs(args.round_timeout));
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent(max);
    }

    let orchestrator = RoundOrchestrator::new(clients, FedAvg::new(args.local_epochs), config);
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
            "  round {:>3}: eval loss {:>8.4}, accuracy {:>6.2}%, fit failures {}{}",
            record.round,
            record.eval_loss.unwrap_or(f64::NAN),
            accuracy * 100.0,
            record.fit_failures,
            marker
        );
    }
    println!(
        "Trained global model: {} tensor(s), {} parameter(s)",
        global.tensors.len(),
        global.tensors.iter().map(|t| t.len()).sum::<usize>()
    );

    // Best-effort: tell every client the run is over
    for r in &registrations {
        match RemoteClient::new(&r.client_id, &r.address) {
            Ok(remote) => {
                if let Err(e) = remote.shutdown().await {
                    warn!("failed to shut down client {}: {}", r.client_id, e);
                }
            }
            Err(e) => warn!("failed to reach client {}: {}", r.client_id, e),
        }
    }

    registration.abort();
    Ok(())
}

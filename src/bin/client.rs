use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::Request;
use uuid::Uuid;

use fedsim::client::{ClientProxy, InProcessClient};
use fedsim::data::{synthetic_partition, ClientDataset, MnistData};
use fedsim::metrics::CsvSink;
use fedsim::model::LinearModel;
use fedsim::proto;
use fedsim::proto::aggregator_client::AggregatorClient;
use fedsim::proto::federated_client_server::FederatedClientServer;
use fedsim::transport::ClientService;

#[derive(Parser)]
#[command(name = "fedsim-client")]
#[command(about = "A federated learning client serving fit/evaluate calls")]
struct Args {
    /// Aggregator to announce ourselves to
    #[arg(long, default_value = "127.0.0.1:50051")]
    server_address: String,

    /// Address we listen on for fit/evaluate calls
    #[arg(long, default_value = "127.0.0.1:50052")]
    listen_address: String,

    #[arg(long)]
    client_id: Option<String>,

    #[arg(long, default_value = "0.1")]
    learning_rate: f32,

    /// Train on MNIST instead of synthetic data (downloads on first use)
    #[arg(long)]
    mnist: bool,

    #[arg(long, default_value = "metrics")]
    metrics_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let client_id = args
        .client_id
        .clone()
        .unwrap_or_else(|| format!("client-{}", &Uuid::new_v4().to_string()[..8]));

    let (data, num_classes, feature_dim) = if args.mnist {
        let mnist = MnistData::load().await?;
        let data = ClientDataset {
            train: mnist.train,
            test: mnist.test,
        };
        let dim = data.train.feature_dim();
        (data, 10, dim)
    } else {
        (
            ClientDataset {
                train: synthetic_partition(200, 10, 32),
                test: synthetic_partition(50, 10, 32),
            },
            10,
            32,
        )
    };

    let sink = Arc::new(CsvSink::new(&args.metrics_dir));
    let local: Arc<dyn ClientProxy> = Arc::new(
        InProcessClient::new(
            client_id.clone(),
            LinearModel::new(num_classes, feature_dim),
            data,
            args.learning_rate,
        )
        .with_sink(sink),
    );

    let listen_addr: SocketAddr = args.listen_address.parse()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = ClientService::new(local, shutdown_tx);

    info!("client {} serving on {}", client_id, listen_addr);
    let serve = tokio::spawn(
        Server::builder()
            .add_service(FederatedClientServer::new(service))
            .serve_with_shutdown(listen_addr, async {
                let _ = shutdown_rx.await;
            }),
    );

    register(&args.server_address, &client_id, &args.listen_address).await?;
    info!(
        "client {} registered with aggregator {}; serving until told to stop",
        client_id, args.server_address
    );

    serve.await??;
    info!("client {} stopped", client_id);
    Ok(())
}

/// Announces this client to the aggregator, retrying while it comes up.
async fn register(server_address: &str, client_id: &str, listen_address: &str) -> Result<()> {
    let url = format!("http://{}", server_address);
    let mut attempts = 0u32;
    let mut client = loop {
        match AggregatorClient::connect(url.clone()).await {
            Ok(client) => break client,
            Err(e) if attempts < 10 => {
                attempts += 1;
                warn!(
                    "aggregator not reachable yet (attempt {}): {}; retrying",
                    attempts, e
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(anyhow!("failed to reach aggregator: {}", e)),
        }
    };

    let response = client
        .register(Request::new(proto::RegisterRequest {
            client_id: client_id.to_string(),
            address: listen_address.to_string(),
        }))
        .await?
        .into_inner();
    if !response.accepted {
        return Err(anyhow!("registration rejected: {}", response.message));
    }
    Ok(())
}

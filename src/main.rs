use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera::rpc::server::{TesseraKvService, TesseraPdService};
use tessera::{MockCluster, TesseraKvServer, TesseraPdServer};

/// Serve an in-process Tessera cluster over gRPC.
#[derive(Debug, Parser)]
#[command(name = "tessera", version)]
struct Args {
    /// Address to listen on for both the coordination and region services.
    #[arg(long, default_value = "127.0.0.1:2379")]
    listen: SocketAddr,

    /// Number of stores replicating each region.
    #[arg(long, default_value_t = 3)]
    stores: usize,

    /// Keys at which to pre-split the key space.
    #[arg(long = "split", value_name = "KEY")]
    splits: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    info!("starting tessera cluster with {:?}", args);

    let addrs = vec![args.listen.to_string(); args.stores.max(1)];
    let cluster = MockCluster::bootstrap(addrs);
    for key in &args.splits {
        if cluster.split(key.as_str()).await.is_none() {
            anyhow::bail!("cannot split at {key:?}: key already starts a region");
        }
    }
    info!(regions = cluster.regions().await.len(), "region layout ready");

    Server::builder()
        .add_service(TesseraPdServer::new(TesseraPdService::new(cluster.clone())))
        .add_service(TesseraKvServer::new(TesseraKvService::new(cluster)))
        .serve_with_shutdown(args.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("gRPC server failed")?;
    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

//! Sentinel daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use sentinel::cluster::{ChannelTransport, Cluster, ClusterController, CredentialLedger};
use sentinel::config::Config;
use sentinel::coordinator::Coordinator;
use sentinel::policy::PolicyStore;
use sentinel::queue::UpdateQueue;
use sentinel::runtime::{DockerRuntime, FleetLabels};
use sentinel::scanner::Scanner;
use sentinel::store::{FileStore, KeyValueStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting Sentinel daemon with config: {:?}", cfg);

    // Durable state
    let store: Arc<dyn KeyValueStore> = match &cfg.data_dir {
        Some(dir) => Arc::new(FileStore::open(dir).await?),
        None => {
            warn!("No data_dir configured; overrides and hosts will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let policy = PolicyStore::new(Arc::clone(&store));
    let queue = Arc::new(UpdateQueue::new());

    // Container Runtime (Docker)
    let docker = Arc::new(DockerRuntime::new(cfg.swarm)?);
    if let Err(e) = docker.ping().await {
        warn!("Docker is not reachable yet: {}. Scans will retry.", e);
    }

    // Cluster subsystem
    let mut event_handle = None;
    let cluster = if cfg.cluster.enabled {
        let ledger = Arc::new(CredentialLedger::load(Arc::clone(&store)).await?);
        let (event_tx, event_rx) = mpsc::channel(128);
        let transport = Arc::new(ChannelTransport::new(
            ledger.clone(),
            event_tx,
            cfg.cluster.dispatch_timeout(),
        ));
        let controller = Arc::new(
            ClusterController::load(Arc::clone(&store), transport, ledger, cfg.cluster.settings())
                .await?,
        );
        let for_events = Arc::clone(&controller);
        event_handle = Some(tokio::spawn(async move {
            for_events.run_events(event_rx).await;
        }));
        info!("Clustering enabled");
        Cluster::Enabled(controller)
    } else {
        info!("Clustering disabled");
        Cluster::Disabled
    };

    let labels = Arc::new(FleetLabels::new(docker.clone(), cluster.clone()));
    let coordinator = Arc::new(Coordinator::new(
        queue,
        policy,
        cluster,
        labels,
        docker.clone(),
    ));

    // Scan loop
    let scanner = Scanner::new(Arc::clone(&coordinator), docker, cfg.poll_interval());
    let scan_handle = tokio::spawn(async move {
        scanner.run().await;
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    scan_handle.abort();
    if let Some(handle) = event_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

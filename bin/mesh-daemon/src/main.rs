use anyhow::{Context, Result};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use mesh_core::config::LatencyProbeKind;
use mesh_core::{MemoryStore, MeshConfig, SystemClock};
use mesh_router::{default_regions, LatencyProbe, ServiceMesh, SimulatedLatencyProbe, TcpLatencyProbe};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting mesh-daemon...");

    let config = MeshConfig::load()?;
    info!(
        "Mesh configuration: heartbeat {}s, aliveness {}s, dead after {}s, breaker {}/{}s, strategy {}",
        config.heartbeat_interval_secs,
        config.aliveness_window_secs,
        config.dead_threshold_secs,
        config.circuit_breaker_threshold,
        config.circuit_breaker_cooldown_secs,
        config.load_balance_strategy,
    );

    let store = Arc::new(MemoryStore::new());
    let mesh = Arc::new(ServiceMesh::new(config.clone(), store, Arc::new(SystemClock))?);

    for region in default_regions() {
        mesh.directory().upsert_region(&region).await?;
    }
    info!("Region directory seeded");

    let probe: Arc<dyn LatencyProbe> = match config.latency_probe {
        LatencyProbeKind::Tcp => Arc::new(TcpLatencyProbe::default()),
        LatencyProbeKind::Simulated => Arc::new(SimulatedLatencyProbe::default()),
    };
    let monitor = mesh.monitor(probe);
    let (stop_tx, stop_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(async move { monitor.run(stop_rx).await });
    info!("Monitor loop started ({:?} probe)", config.latency_probe);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr))?;
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP API listening on {}", addr);

    tokio::select! {
        res = accept_connections(listener, mesh) => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    let _ = stop_tx.send(true);
    if let Err(e) = monitor_task.await {
        warn!("Monitor loop ended abnormally: {}", e);
    }
    info!("mesh-daemon stopped");
    Ok(())
}

async fn accept_connections(listener: TcpListener, mesh: Arc<ServiceMesh>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let mesh = mesh.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| api::handle_request(req, mesh.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use corral::cluster::ClusterConfig;
use corral::engine::Engine;
use corral::notify::NotifyHub;
use corral::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    corral::observability::init_logging();

    let metrics_port: Option<u16> = std::env::var("CORRAL_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    corral::observability::init(metrics_port);

    let data_dir = std::env::var("CORRAL_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let cluster_file =
        std::env::var("CORRAL_CLUSTER_FILE").unwrap_or_else(|_| "./cluster.json".into());
    let sweep_secs: u64 = std::env::var("CORRAL_SWEEP_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let config = ClusterConfig::load(Path::new(&cluster_file))?;
    let (nodes, partitions, accounting) = config.build()?;
    info!(
        "cluster loaded: {} nodes, {} cores",
        nodes.len(),
        nodes.total_cores()
    );

    let state_path = PathBuf::from(&data_dir).join("resv_state");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        state_path,
        nodes,
        partitions,
        accounting,
        notify,
    )?);
    info!("corral up, {} reservations active", engine.resv_count().await);
    info!("  data_dir: {data_dir}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let sweeper_engine = engine.clone();
    tokio::spawn(async move {
        sweeper::run_sweeper(sweeper_engine, Duration::from_secs(sweep_secs)).await;
    });

    // Graceful shutdown: final synchronous state save on SIGTERM/ctrl-c.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, saving state");
    engine.save_now().await?;
    info!("corral stopped");
    Ok(())
}

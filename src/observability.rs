use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations created.
pub const RESV_CREATED_TOTAL: &str = "corral_resv_created_total";

/// Counter: reservations updated.
pub const RESV_UPDATED_TOTAL: &str = "corral_resv_updated_total";

/// Counter: reservations deleted by an administrator.
pub const RESV_DELETED_TOTAL: &str = "corral_resv_deleted_total";

/// Counter: create/update requests rejected for time×space conflicts.
pub const RESV_CONFLICTS_TOTAL: &str = "corral_resv_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: reservations currently in the store.
pub const RESV_ACTIVE: &str = "corral_resv_active";

/// Histogram: state snapshot write duration in seconds.
pub const STATE_SAVE_DURATION_SECONDS: &str = "corral_state_save_duration_seconds";

/// Histogram: save signals coalesced into one snapshot write.
pub const STATE_SAVE_BATCH_SIZE: &str = "corral_state_save_batch_size";

/// Counter: recurring reservations re-armed by the sweeper.
pub const SWEEP_ADVANCED_TOTAL: &str = "corral_sweep_advanced_total";

/// Counter: vestigial reservations purged by the sweeper.
pub const SWEEP_PURGED_TOTAL: &str = "corral_sweep_purged_total";

/// Counter: degraded node sets repaired by a delta re-pick.
pub const SWEEP_REPICK_TOTAL: &str = "corral_sweep_repick_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install the fmt tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

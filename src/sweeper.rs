use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::model::Ms;

/// Background task driving the periodic lifecycle pass: advances expired
/// recurring reservations, purges vestigial ones, and re-validates node
/// selections against node state changes.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as Ms;
        engine.sweep(now).await;
    }
}

//! `HeartbeatMonitor`: single background loop demoting idle backends.
//!

use std::time::Duration;

use tracing::{debug, error};

use crate::registry::Registry;

/// Spawn the monitor. Ticks every `tick`, demoting any `ready` backend whose
/// `lastHeartbeat` is older than `timeout` to `disconnected`. Per the
/// "HeartbeatMonitor and Reconnector crashes restart themselves" error
/// propagation policy, a panic inside one sweep is caught and logged
/// rather than killing the loop.
pub fn spawn(registry: Registry, tick: Duration, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let registry = registry.clone();
            let outcome = tokio::task::spawn_blocking(move || registry.sweep_stale_heartbeats(timeout)).await;
            match outcome {
                Ok(demoted) if !demoted.is_empty() => debug!(?demoted, "heartbeat monitor demoted idle backends"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "heartbeat monitor sweep panicked, restarting loop"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{now_millis, Metadata};
    use crate::registry::Registry;
    use crate::session::SessionTable;

    #[tokio::test]
    async fn monitor_demotes_stale_backend_after_one_tick() {
        let (registry, _rx) = Registry::new(EventBus::new(10), SessionTable::new());
        registry.register("a", 4001, 111, Metadata::new()).unwrap();
        // Force the heartbeat to appear stale.
        registry.sweep_stale_heartbeats(Duration::from_millis(0));
        let _ = now_millis();
        let handle = spawn(registry.clone(), Duration::from_millis(10), Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert_eq!(registry.get("a").unwrap().status, crate::model::BackendStatus::Disconnected);
    }
}

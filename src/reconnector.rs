//! `Reconnector`: per-backend probe loop started on first disconnect.
//!

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::model::{BackendStatus, PendingOutcome};
use crate::registry::Registry;

/// Tracks which backend ids already have a live probe task, so
/// `ensure_running` is idempotent under concurrent forward failures.
#[derive(Clone)]
pub struct Reconnector {
    registry: Registry,
    http: Client,
    active: Arc<DashSet<String>>,
    probe_interval: Duration,
    max_attempts: u32,
}

impl Reconnector {
    pub fn new(registry: Registry, probe_interval: Duration, probe_budget: Duration) -> Self {
        let max_attempts = (probe_budget.as_secs_f64() / probe_interval.as_secs_f64()).ceil().max(1.0) as u32;
        Self {
            registry,
            http: Client::builder().timeout(Duration::from_secs(2)).build().expect("reqwest client build"),
            active: Arc::new(DashSet::new()),
            probe_interval,
            max_attempts,
        }
    }

    /// Start a probe task for `id` unless one is already running.
    pub fn ensure_running(&self, id: &str) {
        if !self.active.insert(id.to_string()) {
            return;
        }
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            this.probe_loop(&id).await;
            this.active.remove(&id);
        });
    }

    async fn probe_loop(&self, id: &str) {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.probe_interval).await;

            let Some(info) = self.registry.get(id) else { return };
            if info.status == BackendStatus::Stopped {
                return;
            }

            let url = format!("http://127.0.0.1:{}/", info.port);
            let probe = json!({"jsonrpc": "2.0", "method": "ping", "id": "reconnector-probe"});
            let ok = self.http.post(&url).json(&probe).send().await.map(|r| r.status().is_success()).unwrap_or(false);

            if ok {
                info!(backend_id = id, attempt, "reconnector probe succeeded");
                let _ = self.registry.set_status(id, BackendStatus::Ready, None);
                return;
            }
            debug!(backend_id = id, attempt, "reconnector probe failed");
        }

        info!(backend_id = id, "reconnector exhausted probe budget, draining pending");
        let drained = self.registry.drain_pending(id);
        for pending in drained {
            let _ = pending.responder.send(PendingOutcome::Failed(crate::error::ProxyError::backend_unavailable(format!(
                "{id}: reconnection timeout"
            ))));
        }
        let _ = self.registry.set_status(id, BackendStatus::Disconnected, Some("reconnection timeout".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{now_millis, Metadata, PendingRequest};
    use crate::session::SessionTable;

    #[tokio::test]
    async fn exhausting_probe_budget_drains_pending_with_error() {
        let (registry, _rx) = Registry::new(EventBus::new(10), SessionTable::new());
        registry.register("a", 49_999, 111, Metadata::new()).unwrap();
        registry.set_status("a", BackendStatus::Disconnected, None).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        registry
            .enqueue_pending("a", PendingRequest { request: serde_json::json!({}), responder: tx, enqueued_at: now_millis() })
            .unwrap();

        let reconnector = Reconnector::new(registry.clone(), Duration::from_millis(5), Duration::from_millis(20));
        reconnector.ensure_running("a");
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Failed(_)));
        assert_eq!(registry.get("a").unwrap().status, BackendStatus::Disconnected);
    }

    #[test]
    fn ensure_running_is_idempotent() {
        let (registry, _rx) = Registry::new(EventBus::new(10), SessionTable::new());
        let reconnector = Reconnector::new(registry, Duration::from_secs(1), Duration::from_secs(30));
        reconnector.ensure_running("a");
        reconnector.ensure_running("a");
        assert_eq!(reconnector.active.len(), 1);
    }
}

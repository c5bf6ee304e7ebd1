//! `Router`: resolves a request's target backend and forwards, buffers, or
//! rejects it depending on that backend's status.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::events::EventBus;
use crate::model::{now_millis, BackendStatus, Event, EventType, PendingOutcome, PendingRequest};
use crate::reconnector::Reconnector;
use crate::registry::Registry;
use crate::session::SessionTable;

/// Where a request should be sent, per `resolve_target`'s
/// first-match-wins order.
pub enum Target {
    Backend(String),
    /// No session/header pointed anywhere and at least one backend exists
    /// to suggest.
    Unresolved { known_backends: Vec<String> },
}

/// Target resolution: `Mcp-Session-Id` binding first,
/// then `X-MCPRepl-Target`, then "no target".
pub fn resolve_target(session_target: Option<&str>, header_target: Option<&str>, registry: &Registry) -> Target {
    if let Some(id) = session_target {
        return Target::Backend(id.to_string());
    }
    if let Some(id) = header_target {
        return Target::Backend(id.to_string());
    }
    Target::Unresolved { known_backends: registry.list().into_iter().map(|b| b.id).collect() }
}

#[derive(Clone)]
pub struct RouterConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub reconnect_wait_budget: Duration,
    pub keepalive_fast: Duration,
    pub keepalive_slow: Duration,
}

/// Bundles the collaborators a forward/buffer decision needs. Cheap to
/// clone; every field is itself a cheap-clone handle.
#[derive(Clone)]
pub struct Router {
    pub registry: Registry,
    pub events: EventBus,
    pub sessions: SessionTable,
    pub http: Client,
    pub config: RouterConfig,
    pub reconnector: Reconnector,
}

impl Router {
    pub fn new(registry: Registry, events: EventBus, sessions: SessionTable, config: RouterConfig, reconnector: Reconnector) -> Self {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .expect("reqwest client build");
        Self { registry, events, sessions, http, config, reconnector }
    }

    /// Route one already-parsed JSON-RPC request to `backend_id`. Returns
    /// the eventual backend HTTP status and JSON-RPC response body, to be
    /// relayed verbatim, buffering internally if the backend is not
    /// currently reachable.
    pub async fn route(&self, backend_id: &str, session_id: Option<&str>, request: Value) -> Result<(u16, Value), ProxyError> {
        let Some(info) = self.registry.get(backend_id) else {
            return Err(ProxyError::backend_not_found(backend_id));
        };

        match info.status {
            BackendStatus::Ready => self.forward_now(backend_id, session_id, request).await,
            BackendStatus::Disconnected | BackendStatus::Reconnecting => {
                self.registry.set_status(backend_id, BackendStatus::Reconnecting, None).ok();
                self.reconnector.ensure_running(backend_id);
                self.buffer_and_wait(backend_id, request).await
            }
            BackendStatus::Stopped => Err(ProxyError::backend_stopped(backend_id)),
        }
    }

    /// Forward directly to a `ready` backend; on network failure, record
    /// the failure and either demote the backend or re-buffer the request.
    async fn forward_now(&self, backend_id: &str, session_id: Option<&str>, request: Value) -> Result<(u16, Value), ProxyError> {
        let info = self.registry.get(backend_id).ok_or_else(|| ProxyError::backend_not_found(backend_id))?;
        let method = request.get("method").and_then(Value::as_str).unwrap_or("").to_string();
        let is_tool_call = method == "tools/call";
        let tool_name = request.get("params").and_then(|p| p.get("name")).and_then(Value::as_str).unwrap_or("").to_string();
        let started = now_millis();
        let progress_token = format!("{tool_name}-{started}");

        if is_tool_call {
            self.emit_progress(session_id, &progress_token, 1, 2);
        }

        let url = format!("http://127.0.0.1:{}/", info.port);
        let result = self.http.post(&url).json(&request).send().await;

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                let duration = now_millis().saturating_sub(started);
                if is_tool_call {
                    self.emit_progress(session_id, &progress_token, 2, 2);
                }
                let event_type = if is_tool_call { EventType::ToolCall } else { EventType::CodeExecution };
                self.events.publish(Event {
                    session_id: session_id.map(str::to_string),
                    event_type,
                    timestamp: now_millis(),
                    payload: serde_json::json!({"backend_id": backend_id, "method": method}),
                    duration_millis: Some(duration),
                });
                self.events.publish(Event {
                    session_id: session_id.map(str::to_string),
                    event_type: EventType::Output,
                    timestamp: now_millis(),
                    payload: body.get("result").or_else(|| body.get("error")).cloned().unwrap_or(Value::Null),
                    duration_millis: Some(duration),
                });
                Ok((status, body))
            }
            Err(err) => {
                let message = err.to_string();
                warn!(backend_id, error = %message, "forward failed");
                match self.registry.record_forward_failure(backend_id, &message) {
                    Ok(BackendStatus::Stopped) => Err(ProxyError::backend_stopped(backend_id)),
                    Ok(_) => {
                        self.reconnector.ensure_running(backend_id);
                        self.buffer_and_wait(backend_id, request).await
                    }
                    Err(registry_err) => Err(registry_err),
                }
            }
        }
    }

    /// Push a `notifications/progress` message (step N of total) into the
    /// originating session's mailbox, keyed by a token derived from tool
    /// name and start time.
    fn emit_progress(&self, session_id: Option<&str>, token: &str, step: u32, total: u32) {
        let Some(sid) = session_id else { return };
        self.sessions.notify(
            sid,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {"progressToken": token, "progress": step, "total": total},
            }),
        );
    }

    /// Append the request to `backend_id`'s pending queue and wait up to
    /// `reconnect_wait_budget` for a flush-driven delivery.
    async fn buffer_and_wait(&self, backend_id: &str, request: Value) -> Result<(u16, Value), ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.registry.enqueue_pending(
            backend_id,
            PendingRequest { request, responder: tx, enqueued_at: now_millis() },
        )?;

        match tokio::time::timeout(self.config.reconnect_wait_budget, rx).await {
            Ok(Ok(PendingOutcome::Delivered(status, body))) => Ok((status, body)),
            Ok(Ok(PendingOutcome::Failed(err))) => Err(err),
            Ok(Err(_)) => Err(ProxyError::backend_unavailable(format!("{backend_id}: pending slot dropped"))),
            Err(_) => Err(ProxyError::timeout("reconnect wait", self.config.reconnect_wait_budget.as_millis() as u64)),
        }
    }

    /// Re-run the forward path for one previously-buffered request. Used by
    /// the flush worker; never re-buffers on failure (a flush only gets one
    /// shot — a fresh failure just fails the waiting client).
    async fn replay(&self, backend_id: &str, request: Value) -> Result<(u16, Value), ProxyError> {
        let info = self.registry.get(backend_id).ok_or_else(|| ProxyError::backend_not_found(backend_id))?;
        let url = format!("http://127.0.0.1:{}/", info.port);
        let resp = self.http.post(&url).json(&request).send().await.map_err(|e| ProxyError::backend_connection(e.to_string()))?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await.unwrap_or(Value::Null)))
    }
}

/// Background worker: listens for backend ids pushed by the Registry when
/// they become `ready`, drains the pending queue FIFO, and delivers each
/// buffered request's response to its waiting client stream. Dropped
/// (closed) response channels are skipped and logged at debug level.
pub fn spawn_flush_worker(router: Router, mut flush_rx: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(backend_id) = flush_rx.recv().await {
            let pending = router.registry.drain_pending(&backend_id);
            if pending.is_empty() {
                continue;
            }
            debug!(backend_id, count = pending.len(), "flushing buffered requests");
            for item in pending {
                if item.responder.is_closed() {
                    debug!(backend_id, "client stream closed, dropping buffered request");
                    continue;
                }
                let outcome = match router.replay(&backend_id, item.request).await {
                    Ok((status, body)) => PendingOutcome::Delivered(status, body),
                    Err(err) => PendingOutcome::Failed(err),
                };
                let _ = item.responder.send(outcome);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;
    use crate::session::SessionTable;

    fn test_router() -> (Router, mpsc::UnboundedReceiver<String>) {
        let events = EventBus::new(100);
        let (registry, flush_rx) = Registry::new(events.clone(), SessionTable::new());
        let config = RouterConfig {
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            reconnect_wait_budget: Duration::from_millis(200),
            keepalive_fast: Duration::from_secs(5),
            keepalive_slow: Duration::from_secs(15),
        };
        let reconnector = Reconnector::new(registry.clone(), Duration::from_millis(5), Duration::from_millis(20));
        (Router::new(registry, events, SessionTable::new(), config, reconnector), flush_rx)
    }

    #[test]
    fn resolve_target_prefers_session_binding() {
        let (router, _rx) = test_router();
        let target = resolve_target(Some("b1"), Some("b2"), &router.registry);
        assert!(matches!(target, Target::Backend(id) if id == "b1"));
    }

    #[test]
    fn resolve_target_falls_back_to_header() {
        let (router, _rx) = test_router();
        let target = resolve_target(None, Some("b2"), &router.registry);
        assert!(matches!(target, Target::Backend(id) if id == "b2"));
    }

    #[test]
    fn resolve_target_unresolved_lists_known_backends() {
        let (router, _rx) = test_router();
        router.registry.register("a", 4001, 111, Metadata::new()).unwrap();
        let target = resolve_target(None, None, &router.registry);
        match target {
            Target::Unresolved { known_backends } => assert_eq!(known_backends, vec!["a".to_string()]),
            _ => panic!("expected unresolved"),
        }
    }

    #[tokio::test]
    async fn route_to_stopped_backend_errors_without_buffering() {
        let (router, _rx) = test_router();
        router.registry.register("a", 4001, 111, Metadata::new()).unwrap();
        router.registry.set_status("a", BackendStatus::Stopped, None).unwrap();
        let err = router.route("a", None, serde_json::json!({"method": "tools/list"})).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendStopped { .. }));
    }

    #[tokio::test]
    async fn route_to_unknown_backend_errors() {
        let (router, _rx) = test_router();
        let err = router.route("missing", None, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendNotFound { .. }));
    }

    #[tokio::test]
    async fn buffered_request_times_out_when_never_flushed() {
        let (router, _rx) = test_router();
        router.registry.register("a", 4001, 111, Metadata::new()).unwrap();
        router.registry.set_status("a", BackendStatus::Disconnected, None).unwrap();
        let err = router.route("a", None, serde_json::json!({"method": "tools/list"})).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));
    }
}

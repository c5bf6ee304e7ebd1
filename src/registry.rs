//! `Registry`: authoritative map of `BackendID -> BackendConnection`,
//! lifecycle transitions, and the pending-request buffer.
//!
//! Each entry is guarded by its own `parking_lot::Mutex` inside a `dashmap`
//! so that one backend's snapshot/mutation never blocks another's. No
//! `.await` point ever runs while a per-entry lock is held; I/O happens
//! after the lock is released, against a snapshot.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::events::EventBus;
use crate::model::{now_millis, BackendInfo, BackendStatus, Event, EventType, Metadata, PendingOutcome, PendingRequest, Timestamp};
use crate::session::SessionTable;

struct BackendEntry {
    port: u16,
    pid: u32,
    status: BackendStatus,
    last_heartbeat: Timestamp,
    missed_heartbeats: u32,
    last_error: Option<String>,
    metadata: Metadata,
    disconnect_time: Option<Timestamp>,
    pending: VecDeque<PendingRequest>,
}

impl BackendEntry {
    fn snapshot(&self, id: &str) -> BackendInfo {
        BackendInfo {
            id: id.to_string(),
            port: self.port,
            pid: Some(self.pid),
            status: self.status,
            last_heartbeat: self.last_heartbeat,
            missed_heartbeats: self.missed_heartbeats,
            last_error: self.last_error.clone(),
            metadata: self.metadata.clone(),
            disconnect_time: self.disconnect_time,
            pending_count: self.pending.len(),
        }
    }
}

/// Outcome of `register`, distinguishing a fresh row from an in-place update
/// so the caller knows whether to emit `AGENT_START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    UpdatedInPlace,
}

/// Process-wide singleton. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    backends: Arc<DashMap<String, parking_lot::Mutex<BackendEntry>>>,
    events: EventBus,
    sessions: SessionTable,
    /// Notifies a flush worker (owned by the reconnector/router wiring) that
    /// `id` just became ready and its pending queue should be drained.
    flush_tx: mpsc::UnboundedSender<String>,
}

impl Registry {
    pub fn new(events: EventBus, sessions: SessionTable) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        (Self { backends: Arc::new(DashMap::new()), events, sessions, flush_tx }, flush_rx)
    }

    /// `register`.
    ///
    /// # Errors
    /// `ProxyError::DuplicateRegistration` if `id` is registered under a
    /// different `pid`.
    pub fn register(&self, id: &str, port: u16, pid: u32, metadata: Metadata) -> ProxyResult<RegisterOutcome> {
        if let Some(entry) = self.backends.get(id) {
            let mut guard = entry.lock();
            if guard.pid == pid {
                guard.port = port;
                guard.metadata = metadata;
                guard.last_heartbeat = now_millis();
                drop(guard);
                info!(backend_id = id, port, pid, "backend re-registered in place");
                return Ok(RegisterOutcome::UpdatedInPlace);
            }
            let existing_pid = guard.pid;
            let existing_port = guard.port;
            drop(guard);
            return Err(ProxyError::DuplicateRegistration {
                id: id.to_string(),
                existing_pid,
                existing_port,
                requested_pid: pid,
                requested_port: port,
            });
        }

        self.backends.insert(
            id.to_string(),
            parking_lot::Mutex::new(BackendEntry {
                port,
                pid,
                status: BackendStatus::Ready,
                last_heartbeat: now_millis(),
                missed_heartbeats: 0,
                last_error: None,
                metadata,
                disconnect_time: None,
                pending: VecDeque::new(),
            }),
        );

        self.events.publish(Event {
            session_id: None,
            event_type: EventType::AgentStart,
            timestamp: now_millis(),
            payload: serde_json::json!({"backend_id": id, "port": port, "pid": pid}),
            duration_millis: None,
        });
        self.sessions.notify_all(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed",
        }));
        info!(backend_id = id, port, pid, "backend registered");
        Ok(RegisterOutcome::Created)
    }

    /// `unregister`.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.backends.remove(id);
        if removed.is_some() {
            self.events.publish(Event {
                session_id: None,
                event_type: EventType::AgentStop,
                timestamp: now_millis(),
                payload: serde_json::json!({"backend_id": id}),
                duration_millis: None,
            });
            info!(backend_id = id, "backend unregistered");
        }
        removed.is_some()
    }

    /// `heartbeat`. Unknown `pid` mismatches are rejected
    /// silently (no error returned, state left untouched).
    pub fn heartbeat(&self, id: &str, port: u16, pid: u32, metadata: Metadata) {
        if let Some(entry) = self.backends.get(id) {
            let mut guard = entry.lock();
            if guard.pid != pid {
                debug!(backend_id = id, "heartbeat pid mismatch, ignoring");
                return;
            }
            guard.missed_heartbeats = 0;
            guard.last_heartbeat = now_millis();
            guard.port = port;
            guard.metadata = metadata;
            let was_ready = guard.status == BackendStatus::Ready;
            if !was_ready {
                guard.status = BackendStatus::Ready;
                guard.disconnect_time = None;
                guard.last_error = None;
            }
            let should_flush = !was_ready && !guard.pending.is_empty();
            drop(guard);
            if should_flush {
                let _ = self.flush_tx.send(id.to_string());
            }
            return;
        }

        // Unknown id: re-create using the heartbeat's own fields, enabling
        // recovery across proxy restarts.
        let _ = self.register(id, port, pid, metadata);
    }

    pub fn get(&self, id: &str) -> Option<BackendInfo> {
        self.backends.get(id).map(|e| e.lock().snapshot(id))
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        self.backends.iter().map(|e| e.value().lock().snapshot(e.key())).collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// `setStatus`. Transition to `ready` with a non-empty
    /// pending queue schedules a flush.
    pub fn set_status(&self, id: &str, status: BackendStatus, error: Option<String>) -> ProxyResult<()> {
        let entry = self.backends.get(id).ok_or_else(|| ProxyError::backend_not_found(id))?;
        let mut guard = entry.lock();
        let previous = guard.status;
        guard.status = status;
        if let Some(message) = error {
            guard.last_error = Some(message);
        }
        match status {
            BackendStatus::Ready => {
                guard.disconnect_time = None;
                guard.missed_heartbeats = 0;
            }
            BackendStatus::Disconnected if guard.disconnect_time.is_none() => {
                guard.disconnect_time = Some(now_millis());
            }
            _ => {}
        }
        let should_flush = status == BackendStatus::Ready && previous != BackendStatus::Ready && !guard.pending.is_empty();
        drop(guard);
        if should_flush {
            let _ = self.flush_tx.send(id.to_string());
        }
        Ok(())
    }

    /// Append `(request, responder)` to `id`'s pending queue. Used by the
    /// Router when a backend is not `ready`.
    pub fn enqueue_pending(&self, id: &str, pending: PendingRequest) -> ProxyResult<()> {
        let entry = self.backends.get(id).ok_or_else(|| ProxyError::backend_not_found(id))?;
        entry.lock().pending.push_back(pending);
        Ok(())
    }

    /// Drain all pending requests for `id` in FIFO order, for the
    /// Reconnector/flush worker to replay outside any lock.
    pub fn drain_pending(&self, id: &str) -> Vec<PendingRequest> {
        match self.backends.get(id) {
            Some(entry) => entry.lock().pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn pending_count(&self, id: &str) -> usize {
        self.backends.get(id).map(|e| e.lock().pending.len()).unwrap_or(0)
    }

    /// Record a forward failure: capture the truncated message, bump
    /// `missedHeartbeats`, and demote the backend to `disconnected` (or
    /// `stopped` if the outage has run past the 2 minute limit). Returns
    /// the resulting status.
    pub fn record_forward_failure(&self, id: &str, message: &str) -> ProxyResult<BackendStatus> {
        let entry = self.backends.get(id).ok_or_else(|| ProxyError::backend_not_found(id))?;
        let mut guard = entry.lock();
        let truncated: String = message.chars().take(500).collect();
        guard.last_error = Some(truncated);
        guard.missed_heartbeats += 1;

        let outage_expired = guard
            .disconnect_time
            .map(|t| now_millis().saturating_sub(t) > 120_000)
            .unwrap_or(false);

        if outage_expired {
            guard.status = BackendStatus::Stopped;
            let drained: Vec<_> = guard.pending.drain(..).collect();
            drop(guard);
            for pending in drained {
                let _ = pending.responder.send(PendingOutcome::Failed(ProxyError::backend_stopped(id)));
            }
            warn!(backend_id = id, "backend demoted to stopped after prolonged outage");
            return Ok(BackendStatus::Stopped);
        }

        guard.status = BackendStatus::Disconnected;
        if guard.disconnect_time.is_none() {
            guard.disconnect_time = Some(now_millis());
        }
        drop(guard);
        Ok(BackendStatus::Disconnected)
    }

    /// `HeartbeatMonitor` sweep: demote any `ready` backend idle past
    /// `timeout`. Returns the ids demoted.
    pub fn sweep_stale_heartbeats(&self, timeout: std::time::Duration) -> Vec<String> {
        let cutoff_ms = timeout.as_millis() as Timestamp;
        let now = now_millis();
        let mut demoted = Vec::new();
        for entry in self.backends.iter() {
            let id = entry.key().clone();
            let mut guard = entry.value().lock();
            if guard.status == BackendStatus::Ready && now.saturating_sub(guard.last_heartbeat) > cutoff_ms {
                guard.status = BackendStatus::Disconnected;
                guard.disconnect_time = Some(now);
                guard.missed_heartbeats += 1;
                drop(guard);
                demoted.push(id);
            }
        }
        for id in &demoted {
            self.events.publish(Event {
                session_id: None,
                event_type: EventType::Error,
                timestamp: now_millis(),
                payload: serde_json::json!({"backend_id": id, "message": "heartbeat timeout"}),
                duration_millis: None,
            });
        }
        demoted
    }

    pub fn disconnected_ids(&self) -> Vec<String> {
        self.backends
            .iter()
            .filter(|e| e.value().lock().status == BackendStatus::Disconnected)
            .map(|e| e.key().clone())
            .collect()
    }
}

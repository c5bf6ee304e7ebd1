//! `SessionTable`: `ClientSessionID -> ClientSession` map.
//!
//! A `dashmap` keyed by session id, each entry carrying a bounded
//! `tokio::sync::mpsc` mailbox that `notify_all` pushes into non-blockingly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::model::{now_millis, SessionInfo, Timestamp};

/// Bound on a session's outgoing notification mailbox.
const MAILBOX_CAPACITY: usize = 64;

struct SessionEntry {
    info: SessionInfo,
    mailbox: mpsc::Sender<Value>,
}

/// Process-wide singleton. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self { sessions: Arc::new(DashMap::new()) }
    }

    /// Mint a new `ClientSession`, optionally bound to a target backend.
    /// Returns the new session id and the receiving half of its mailbox.
    pub fn create(&self, target_backend_id: Option<String>, capabilities: Value) -> (String, mpsc::Receiver<Value>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let info = SessionInfo {
            id: id.clone(),
            target_backend_id,
            last_activity: now_millis(),
            capabilities,
        };
        self.sessions.insert(id.clone(), SessionEntry { info, mailbox: tx });
        (id, rx)
    }

    /// Look up a session, bumping its `lastActivity` timestamp.
    ///
    /// # Errors
    /// Returns `ProxyError::SessionNotFound` if `id` is unknown or expired.
    pub fn touch(&self, id: &str) -> ProxyResult<SessionInfo> {
        let mut entry = self.sessions.get_mut(id).ok_or_else(|| ProxyError::session_not_found(id))?;
        entry.info.last_activity = now_millis();
        Ok(entry.info.clone())
    }

    /// Look up a session without mutating it.
    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|e| e.info.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn rebind(&self, id: &str, target_backend_id: Option<String>) -> ProxyResult<()> {
        let mut entry = self.sessions.get_mut(id).ok_or_else(|| ProxyError::session_not_found(id))?;
        entry.info.target_backend_id = target_backend_id;
        Ok(())
    }

    /// Push `notification` into every open session's mailbox. Full mailboxes
    /// are skipped rather than blocked on.
    pub fn notify_all(&self, notification: Value) {
        for entry in self.sessions.iter() {
            if entry.mailbox.try_send(notification.clone()).is_err() {
                debug!(session_id = %entry.key(), "notification mailbox full, dropping");
            }
        }
    }

    /// Push `notification` into one session's mailbox, non-blockingly.
    /// Returns `false` if the session is unknown or its mailbox is full.
    pub fn notify(&self, id: &str, notification: Value) -> bool {
        match self.sessions.get(id) {
            Some(entry) => entry.mailbox.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Delete every session whose `lastActivity` is older than `older_than`.
    /// Returns the ids removed.
    pub fn reap(&self, older_than: Duration) -> Vec<String> {
        let cutoff: Timestamp = now_millis().saturating_sub(older_than.as_millis() as Timestamp);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.info.last_activity < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.sessions.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic reaper task. Runs until the process exits; the
/// returned handle is kept by the caller only to allow explicit abort in
/// tests.
pub fn spawn_reaper(table: SessionTable, idle_timeout: Duration, tick: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let reaped = table.reap(idle_timeout);
            if !reaped.is_empty() {
                debug!(count = reaped.len(), "reaped idle sessions");
            }
        }
    })
}

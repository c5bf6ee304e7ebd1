//! Core data model:
//!
//! Plain serde-derived types shared by the Registry, SessionTable, EventBus
//! and EventStore. Kept free of behavior — the owning components (`registry`,
//! `session`, `events`) implement the invariants and lifecycle transitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Free-form metadata bag attached to a backend or tool result.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Milliseconds since the Unix epoch. Plain `u64` rather than a newtype:
/// every boundary (JSON wire, sqlite column) wants the raw integer anyway.
pub type Timestamp = u64;

/// Current time in milliseconds since the epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Lifecycle status of a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Ready,
    Disconnected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A buffered `(request, client stream)` pair awaiting delivery once a
/// backend recovers. The HTTP response sink is a oneshot: the Router's
/// connection-handling task owns the live `axum` response future and is
/// woken by sending into this channel when the Reconnector flushes.
pub struct PendingRequest {
    pub request: serde_json::Value,
    pub responder: tokio::sync::oneshot::Sender<PendingOutcome>,
    pub enqueued_at: Timestamp,
}

/// What happens to a buffered request once its wait resolves.
pub enum PendingOutcome {
    /// Backend came back; here is its HTTP status and raw JSON-RPC response
    /// body, to be relayed verbatim.
    Delivered(u16, serde_json::Value),
    /// Reconnection exhausted its budget or the backend was demoted.
    Failed(crate::error::ProxyError),
}

/// A registered REPL backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: BackendStatus,
    pub last_heartbeat: Timestamp,
    pub missed_heartbeats: u32,
    pub last_error: Option<String>,
    pub metadata: Metadata,
    pub disconnect_time: Option<Timestamp>,
    pub pending_count: usize,
}

/// One MCP client connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub target_backend_id: Option<String>,
    pub last_activity: Timestamp,
    pub capabilities: serde_json::Value,
}

/// Structured activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: Option<String>,
    pub event_type: EventType,
    pub timestamp: Timestamp,
    pub payload: serde_json::Value,
    pub duration_millis: Option<u64>,
}

/// The kind of activity an `Event` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentStart,
    AgentStop,
    ToolCall,
    CodeExecution,
    Output,
    Error,
    Heartbeat,
    Progress,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AgentStart => "AGENT_START",
            Self::AgentStop => "AGENT_STOP",
            Self::ToolCall => "TOOL_CALL",
            Self::CodeExecution => "CODE_EXECUTION",
            Self::Output => "OUTPUT",
            Self::Error => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Progress => "PROGRESS",
        };
        f.write_str(s)
    }
}

/// Full request/response envelope for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub session_id: String,
    pub direction: InteractionDirection,
    pub message_type: String,
    pub request_id: Option<String>,
    pub method: Option<String>,
    pub content: Vec<u8>,
    pub content_size: usize,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionDirection {
    Inbound,
    Outbound,
}

/// High-level row in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub start_time: Timestamp,
    pub last_activity: Timestamp,
    pub status: String,
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display_matches_wire_values() {
        assert_eq!(EventType::ToolCall.to_string(), "TOOL_CALL");
        assert_eq!(EventType::Heartbeat.to_string(), "HEARTBEAT");
    }

    #[test]
    fn backend_status_display() {
        assert_eq!(BackendStatus::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}

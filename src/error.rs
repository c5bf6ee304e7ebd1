//! Error types for mcprepl-proxy
//!
//! Follows the proxy's error taxonomy from: transport,
//! authorization, routing, duplicate-registration, backend-failure, and
//! internal errors, each carrying enough structure to build a JSON-RPC
//! error envelope without leaking internals to the client.

use thiserror::Error;

/// Result type for proxy operations
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Main error type for mcprepl-proxy
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed or empty JSON-RPC envelope
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Bad bearer token
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// IP not in allowlist
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Unknown or expired `Mcp-Session-Id`
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// No backend registered under this id
    #[error("Backend not found: {id}")]
    BackendNotFound { id: String },

    /// Backend exists but is not ready to accept requests
    #[error("Backend not ready: {id} ({status})")]
    BackendNotReady { id: String, status: String },

    /// Backend unreachable after exhausting the reconnection budget
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// Backend is permanently stopped
    #[error("Backend permanently stopped: {id}")]
    BackendStopped { id: String },

    /// A second registration under the same id arrived with a different pid
    #[error("Duplicate registration for {id}: incumbent pid {existing_pid}, requested pid {requested_pid}")]
    DuplicateRegistration {
        id: String,
        existing_pid: u32,
        existing_port: u16,
        requested_pid: u32,
        requested_port: u16,
    },

    /// Configuration error (invalid or missing fields)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Failure contacting the backend's HTTP JSON-RPC endpoint
    #[error("Backend connection error: {message}")]
    BackendConnection { message: String },

    /// Launching a new backend process failed or it never registered
    #[error("Launch error: {message}")]
    Launch { message: String },

    /// Operation exceeded its configured timeout
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Internal invariant violation, caught at the connection boundary
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error (EventStore)
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ProxyError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden { message: message.into() }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    pub fn backend_not_found(id: impl Into<String>) -> Self {
        Self::BackendNotFound { id: id.into() }
    }

    pub fn backend_not_ready(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::BackendNotReady { id: id.into(), status: status.into() }
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable { message: message.into() }
    }

    pub fn backend_stopped(id: impl Into<String>) -> Self {
        Self::BackendStopped { id: id.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn backend_connection(message: impl Into<String>) -> Self {
        Self::BackendConnection { message: message.into() }
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch { message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), timeout_ms }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// JSON-RPC error code
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::SessionNotFound { .. } => -32001,
            Self::BackendNotFound { .. } => -32002,
            Self::BackendNotReady { .. } => -32003,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } => -32005,
            Self::DuplicateRegistration { .. } => -32000,
            Self::Transport { .. } => -32700,
            Self::Unauthorized { .. } | Self::Forbidden { .. } => -32001,
            Self::Internal { .. } | Self::Serialization(_) | Self::Io(_) | Self::Store(_) => -32603,
            Self::Configuration { .. } | Self::BackendConnection { .. } | Self::Launch { .. } => -32603,
            Self::BackendStopped { .. } => -32005,
        }
    }

    /// HTTP status that should carry this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::DuplicateRegistration { .. } => 409,
            Self::Transport { .. } => 400,
            Self::BackendUnavailable { .. } | Self::BackendStopped { .. } => 503,
            _ => 500,
        }
    }

    /// Sanitize the message shown to clients; full detail stays in logs.
    pub fn sanitize(&self) -> String {
        match self {
            Self::Internal { .. } => "internal error".to_string(),
            Self::Serialization(_) => "malformed request body".to_string(),
            Self::Io(_) | Self::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether a Router/Reconnector failure of this kind should be retried
    /// rather than treated as fatal to the current request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendConnection { .. } | Self::Timeout { .. } | Self::BackendUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonrpc_codes_match_spec() {
        assert_eq!(ProxyError::session_not_found("s").jsonrpc_code(), -32001);
        assert_eq!(ProxyError::backend_not_found("b").jsonrpc_code(), -32002);
        assert_eq!(ProxyError::backend_not_ready("b", "disconnected").jsonrpc_code(), -32003);
        assert_eq!(ProxyError::backend_unavailable("x").jsonrpc_code(), -32005);
        assert_eq!(
            ProxyError::DuplicateRegistration {
                id: "x".into(),
                existing_pid: 1,
                existing_port: 1,
                requested_pid: 2,
                requested_port: 2,
            }
            .jsonrpc_code(),
            -32000
        );
    }

    #[test]
    fn duplicate_registration_is_409() {
        let err = ProxyError::DuplicateRegistration {
            id: "x".into(),
            existing_pid: 1,
            existing_port: 4001,
            requested_pid: 2,
            requested_port: 4002,
        };
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let err = ProxyError::internal("leaked db connection string");
        assert_eq!(err.sanitize(), "internal error");
    }

    #[test]
    fn retryable_classification() {
        assert!(ProxyError::backend_connection("refused").is_retryable());
        assert!(ProxyError::timeout("forward", 30_000).is_retryable());
        assert!(!ProxyError::configuration("bad").is_retryable());
    }
}

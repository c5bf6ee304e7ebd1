//! Axum router assembly: one `Router` built once at startup, handlers
//! closing over shared state carrying the registry/session/events
//! collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router as AxumRouter;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ProxyConfig, SecurityConfig};
use crate::events::{EventBus, EventStore};
use crate::registry::Registry;
use crate::router::Router;
use crate::session::SessionTable;

/// Everything a request handler needs. Each field is itself a cheap-clone
/// handle (`Arc`-backed or already `Clone`), so `AppState` as a whole is
/// `Clone` without an outer `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub sessions: SessionTable,
    pub events: EventBus,
    pub store: Arc<EventStore>,
    pub router: Arc<Router>,
    pub security: Arc<SecurityConfig>,
    pub config: Arc<ProxyConfig>,
    pub proxy_port: u16,
    pub pid: u32,
    pub workspace: PathBuf,
    pub logs_dir: PathBuf,
    pub started_at: std::time::Instant,
}

pub fn build_router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/", post(mcp_entry).options(mcp_options).delete(mcp_delete).get(mcp_get))
        .route("/dashboard/api/proxy-info", get(super::dashboard::proxy_info))
        .route("/dashboard/api/sessions", get(super::dashboard::sessions))
        .route("/dashboard/api/session/{id}/shutdown", post(super::dashboard::session_shutdown))
        .route("/dashboard/api/session/{id}/restart", post(super::dashboard::session_restart))
        .route("/dashboard/api/tools", get(super::dashboard::tools))
        .route("/dashboard/api/directories", get(super::dashboard::directories))
        .route("/dashboard/api/logs", get(super::dashboard::logs))
        .route("/dashboard/api/events", get(super::dashboard::events))
        .route("/dashboard/api/events/stream", get(super::sse::events_stream))
        .route("/dashboard/api/restart", post(super::dashboard::proxy_restart))
        .route("/dashboard/api/shutdown", post(super::dashboard::proxy_shutdown))
        .fallback(super::dashboard::dashboard_static)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}

use super::mcp::{mcp_delete, mcp_entry, mcp_get, mcp_options};

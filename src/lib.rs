//! mcprepl-proxy: a persistent MCP proxy fronting a fleet of transient
//! Julia REPL backends.
//!
//! See `README.md` for the module map. The entry point is [`run`], which
//! wires the Registry, SessionTable, EventBus, EventStore and Router
//! together, starts the background tasks (HeartbeatMonitor, session reaper,
//! retention cleanup, flush worker), and serves the HTTP frontend until the
//! process is asked to shut down.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod http;
pub mod jsonrpc;
pub mod launcher;
pub mod model;
pub mod reconnector;
pub mod registry;
pub mod router;
pub mod security;
pub mod session;
pub mod toolset;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use config::{ProxyConfig, SecurityConfig};
use error::{ProxyError, ProxyResult};
use events::{EventBus, EventStore};
use http::AppState;
use reconnector::Reconnector;
use registry::Registry;
use router::{Router, RouterConfig};
use session::SessionTable;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Assemble every collaborator and serve the HTTP frontend until ctrl-c (or
/// a dashboard-triggered shutdown) ends the process.
///
/// # Errors
/// Returns an error if the workspace config directory cannot be created, the
/// event store cannot be opened, or the listening port cannot be bound.
pub async fn run(workspace: PathBuf, security: SecurityConfig, config: ProxyConfig, port: u16) -> ProxyResult<()> {
    let mcprepl_dir = workspace.join(".mcprepl");
    std::fs::create_dir_all(&mcprepl_dir)?;

    let events = EventBus::new(config.event_ring_capacity);
    let store = Arc::new(EventStore::open(&mcprepl_dir.join("events.db")).await?);
    let events = events.with_store(store.clone());

    let sessions = SessionTable::new();
    let (registry, flush_rx) = Registry::new(events.clone(), sessions.clone());

    let reconnector = Reconnector::new(registry.clone(), config.probe_interval, config.probe_budget);
    let router_config = RouterConfig {
        connect_timeout: config.forward_connect_timeout,
        read_timeout: config.forward_read_timeout,
        reconnect_wait_budget: config.reconnect_wait_budget,
        keepalive_fast: config.keepalive_fast,
        keepalive_slow: config.keepalive_slow,
    };
    let router = Arc::new(Router::new(registry.clone(), events.clone(), sessions.clone(), router_config, reconnector));

    router::spawn_flush_worker((*router).clone(), flush_rx);
    heartbeat::spawn(registry.clone(), config.heartbeat_tick, config.heartbeat_timeout);
    session::spawn_reaper(sessions.clone(), config.session_idle_timeout, std::time::Duration::from_secs(60));
    events::store::spawn_retention_task(store.clone(), config.event_retention, std::time::Duration::from_secs(3600));

    let logs_dir = workspace.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    config::write_pid_file(port)?;

    let state = AppState {
        registry,
        sessions,
        events,
        store,
        router,
        security: Arc::new(security),
        config: Arc::new(config),
        proxy_port: port,
        pid: std::process::id(),
        workspace: workspace.clone(),
        logs_dir,
        started_at: std::time::Instant::now(),
    };

    let app = http::build_router(state);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().map_err(|e| ProxyError::configuration(format!("{e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| ProxyError::configuration(format!("bind {addr}: {e}")))?;
    info!(%addr, "mcprepl-proxy listening");

    let serve_result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let pid_path = config::pid_file_path(port);
    let _ = std::fs::remove_file(&pid_path);

    if let Err(err) = serve_result {
        error!(error = %err, "server exited with error");
        return Err(ProxyError::internal(err.to_string()));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

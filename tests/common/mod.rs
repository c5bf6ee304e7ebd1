//! Shared black-box test harness: boots a real `mcprepl-proxy` HTTP
//! frontend on an ephemeral loopback port, the same way `lib::run` does,
//! and hands the test a `reqwest::Client` plus the collaborators needed to
//! inspect state that isn't exposed over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mcprepl_proxy::config::{ProxyConfig, SecurityConfig, SecurityMode};
use mcprepl_proxy::events::{EventBus, EventStore};
use mcprepl_proxy::http::{build_router, AppState};
use mcprepl_proxy::reconnector::Reconnector;
use mcprepl_proxy::registry::Registry;
use mcprepl_proxy::router::{Router, RouterConfig};
use mcprepl_proxy::session::SessionTable;

pub struct TestProxy {
    pub base_url: String,
    pub client: reqwest::Client,
    pub registry: Registry,
    pub sessions: SessionTable,
    pub events: EventBus,
}

/// Boot the full Axum app (security config + registry + router + dashboard)
/// against an in-memory event store and a loopback listener, exactly as
/// `mcprepl_proxy::run` wires things, minus PID-file/workspace bookkeeping
/// that a black-box HTTP test doesn't need.
pub async fn spawn(security: SecurityConfig) -> TestProxy {
    let config = ProxyConfig {
        // Keep reconnection-dependent tests fast.
        probe_interval: Duration::from_millis(20),
        probe_budget: Duration::from_millis(200),
        reconnect_wait_budget: Duration::from_millis(300),
        forward_connect_timeout: Duration::from_millis(500),
        forward_read_timeout: Duration::from_millis(500),
        ..ProxyConfig::default()
    };

    let events = EventBus::new(config.event_ring_capacity);
    let store = Arc::new(EventStore::open_in_memory().await.expect("in-memory event store"));
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
    mcprepl_proxy::router::spawn_flush_worker((*router).clone(), flush_rx);

    let logs_dir = tempfile::tempdir().expect("tempdir").keep();
    std::fs::create_dir_all(&logs_dir).unwrap();

    let state = AppState {
        registry: registry.clone(),
        sessions: sessions.clone(),
        events: events.clone(),
        store,
        router,
        security: Arc::new(security),
        config: Arc::new(config),
        proxy_port: 0,
        pid: std::process::id(),
        workspace: logs_dir.clone(),
        logs_dir,
        started_at: std::time::Instant::now(),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await.ok();
    });

    TestProxy {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        registry,
        sessions,
        events,
    }
}

pub async fn spawn_lax() -> TestProxy {
    spawn(SecurityConfig { mode: SecurityMode::Lax, ..SecurityConfig::default() }).await
}

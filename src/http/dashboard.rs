//! `/dashboard/api/...` REST endpoints.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::app::AppState;

pub async fn proxy_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"pid": state.pid, "port": state.proxy_port, "version": env!("CARGO_PKG_VERSION")}))
}

pub async fn sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot: serde_json::Map<String, serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|b| {
            (
                b.id.clone(),
                json!({"id": b.id, "port": b.port, "pid": b.pid, "status": b.status.to_string(), "last_heartbeat": b.last_heartbeat}),
            )
        })
        .collect();
    Json(serde_json::Value::Object(snapshot))
}

pub async fn session_shutdown(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let Some(backend) = state.registry.get(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };
    let shutdown = json!({"jsonrpc": "2.0", "method": "proxy/shutdown", "id": "dashboard-shutdown"});
    let url = format!("http://127.0.0.1:{}/", backend.port);
    let _ = state.router.http.post(&url).json(&shutdown).send().await;
    state.registry.unregister(&id);
    Json(json!({"status": "shutdown"})).into_response()
}

pub async fn session_restart(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let Some(backend) = state.registry.get(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };
    let restart = json!({"jsonrpc": "2.0", "method": "proxy/restart", "id": "dashboard-restart"});
    let url = format!("http://127.0.0.1:{}/", backend.port);
    match state.router.http.post(&url).json(&restart).send().await {
        Ok(resp) if resp.status().is_success() => Json(json!({"status": "restarted"})).into_response(),
        _ => {
            state.registry.unregister(&id);
            Json(json!({"status": "unreachable, unregistered"})).into_response()
        }
    }
}

pub async fn tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let proxy_tools: Vec<&str> = crate::toolset::TOOL_NAMES.to_vec();
    let session_tools: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|b| json!({"backend_id": b.id, "status": b.status.to_string()}))
        .collect();
    Json(json!({"proxy_tools": proxy_tools, "session_tools": session_tools}))
}

#[derive(Deserialize)]
pub struct DirectoriesQuery {
    pub path: String,
}

pub async fn directories(Query(q): Query<DirectoriesQuery>) -> Json<serde_json::Value> {
    let expanded = expand_home(&q.path);
    let mut entries = Vec::new();
    if let Ok(mut read_dir) = tokio::fs::read_dir(&expanded).await {
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            if let Ok(file_type) = entry.file_type().await {
                if file_type.is_dir() {
                    entries.push(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
    }
    entries.sort();
    entries.truncate(20);
    let is_julia_project = tokio::fs::metadata(expanded.join("Project.toml")).await.is_ok();
    Json(json!({"path": q.path, "entries": entries, "is_julia_project": is_julia_project}))
}

fn expand_home(path: &str) -> std::path::PathBuf {
    if let Some(stripped) = path.strip_prefix('~') {
        if let Some(home) = directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf()) {
            return home.join(stripped.trim_start_matches('/'));
        }
    }
    std::path::PathBuf::from(path)
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub session_id: String,
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

pub async fn logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Json<serde_json::Value> {
    let mut candidates = Vec::new();
    if let Ok(mut read_dir) = tokio::fs::read_dir(&state.logs_dir).await {
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&format!("session_{}_", q.session_id)) {
                candidates.push(entry.path());
            }
        }
    }
    candidates.sort();
    let Some(latest) = candidates.last() else {
        return Json(json!({"session_id": q.session_id, "lines": Vec::<String>::new()}));
    };
    let contents = tokio::fs::read_to_string(latest).await.unwrap_or_default();
    let tail: Vec<&str> = contents.lines().rev().take(q.lines).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    Json(json!({"session_id": q.session_id, "lines": tail}))
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub id: Option<String>,
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    100
}

pub async fn events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Json<serde_json::Value> {
    let recent = state.events.recent(q.id.as_deref(), q.limit);
    Json(json!({"events": recent}))
}

/// `GET /dashboard/` and any unmatched static asset path. The dashboard's
/// own presentation layer (the browser UI bundle) is out of scope for this
/// crate; this only serves a pre-built bundle if one happens to be present
/// on disk next to the binary, falling back to 404 otherwise.
pub async fn dashboard_static(uri: axum::http::Uri) -> Response {
    let Some(bundle_dir) = dashboard_bundle_dir() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let relative = uri.path().trim_start_matches("/dashboard/");
    let relative = if relative.is_empty() { "index.html" } else { relative };
    let path = bundle_dir.join(relative);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(axum::http::header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "dashboard bundle not installed").into_response(),
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn dashboard_bundle_dir() -> Option<std::path::PathBuf> {
    let dir = std::env::current_exe().ok()?.parent()?.join("dashboard-dist");
    dir.is_dir().then_some(dir)
}

pub async fn proxy_restart() -> Json<serde_json::Value> {
    // Self-restart requires an external supervisor; acknowledge and let the
    // process exit, relying on the caller (service manager / CLI) to relaunch.
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    Json(json!({"status": "restarting"}))
}

pub async fn proxy_shutdown() -> Json<serde_json::Value> {
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    Json(json!({"status": "shutting down"}))
}

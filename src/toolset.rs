//! `ProxyToolset`: the fixed catalog of tools the proxy serves even with no
//! backend registered.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::error::ProxyResult;
use crate::launcher;
use crate::model::BackendStatus;
use crate::registry::Registry;

pub const TOOL_NAMES: &[&str] =
    &["help", "proxy_status", "list_julia_sessions", "dashboard_url", "start_julia_session", "kill_stale_sessions"];

pub fn is_proxy_tool(name: &str) -> bool {
    TOOL_NAMES.contains(&name)
}

fn text_content(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

pub struct ToolContext<'a> {
    pub registry: &'a Registry,
    pub proxy_port: u16,
    pub logs_dir: PathBuf,
}

/// Dispatch a `tools/call` for a proxy-owned tool name. Caller has already
/// checked `is_proxy_tool(name)`.
pub async fn call(ctx: &ToolContext<'_>, name: &str, arguments: &Value) -> ProxyResult<Value> {
    match name {
        "help" => Ok(help()),
        "proxy_status" => Ok(proxy_status(ctx.registry)),
        "list_julia_sessions" => Ok(list_julia_sessions(ctx.registry)),
        "dashboard_url" => Ok(dashboard_url(ctx.proxy_port)),
        "start_julia_session" => start_julia_session(ctx, arguments).await,
        "kill_stale_sessions" => kill_stale_sessions(ctx.registry, arguments),
        other => Ok(text_content(format!("unknown proxy tool: {other}"))),
    }
}

fn help() -> Value {
    let lines: Vec<String> = TOOL_NAMES.iter().map(|n| format!("- {n}")).collect();
    text_content(format!("Available proxy tools:\n{}", lines.join("\n")))
}

fn proxy_status(registry: &Registry) -> Value {
    let backends = registry.list();
    if backends.is_empty() {
        return text_content("No backends registered.");
    }
    let mut lines = vec![format!("{} backend(s) registered:", backends.len())];
    for b in backends {
        lines.push(format!(
            "- {} :: status={} port={} pid={} pending={}",
            b.id,
            b.status,
            b.port,
            b.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            b.pending_count
        ));
    }
    text_content(lines.join("\n"))
}

fn list_julia_sessions(registry: &Registry) -> Value {
    let backends = registry.list();
    let rows: Vec<Value> = backends
        .iter()
        .map(|b| json!({"id": b.id, "port": b.port, "pid": b.pid, "status": b.status.to_string(), "last_heartbeat": b.last_heartbeat}))
        .collect();
    text_content(serde_json::to_string_pretty(&rows).unwrap_or_default())
}

fn dashboard_url(proxy_port: u16) -> Value {
    text_content(format!("http://127.0.0.1:{proxy_port}/dashboard/"))
}

async fn start_julia_session(ctx: &ToolContext<'_>, arguments: &Value) -> ProxyResult<Value> {
    let project_path = match arguments.get("project_path").and_then(Value::as_str) {
        Some(p) => PathBuf::from(p),
        None => return Ok(text_content("project_path is required")),
    };
    let session_name = arguments
        .get("session_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            project_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "session".to_string())
        });

    match launcher::launch(ctx.registry, ctx.proxy_port, &project_path, &session_name, &ctx.logs_dir).await {
        Ok(outcome) => Ok(text_content(format!(
            "started session '{session_name}' on port {} (pid {})",
            outcome.port, outcome.pid
        ))),
        Err(err) => Ok(text_content(err.to_string())),
    }
}

fn kill_stale_sessions(registry: &Registry, arguments: &Value) -> ProxyResult<Value> {
    let dry_run = arguments.get("dry_run").and_then(Value::as_bool).unwrap_or(true);
    let force = arguments.get("force").and_then(Value::as_bool).unwrap_or(false);
    let proxy_port_filter = arguments.get("proxy_port").and_then(Value::as_u64).map(|p| p as u16);

    let targets: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|b| force || b.status == BackendStatus::Disconnected)
        .filter(|b| proxy_port_filter.is_none_or_match(b.port))
        .collect();

    if targets.is_empty() {
        return Ok(text_content("no stale sessions found"));
    }

    let mut lines = Vec::new();
    for backend in &targets {
        if dry_run {
            lines.push(format!("would kill {} (pid {:?}, status {})", backend.id, backend.pid, backend.status));
            continue;
        }
        if let Some(pid) = backend.pid {
            crate::launcher::terminate(pid);
        }
        registry.unregister(&backend.id);
        lines.push(format!("killed {} (pid {:?})", backend.id, backend.pid));
    }
    Ok(text_content(lines.join("\n")))
}

trait OptionPortFilter {
    fn is_none_or_match(&self, port: u16) -> bool;
}

impl OptionPortFilter for Option<u16> {
    fn is_none_or_match(&self, port: u16) -> bool {
        match self {
            Some(p) => *p == port,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::Metadata;
    use crate::session::SessionTable;

    fn registry() -> Registry {
        Registry::new(EventBus::new(10), SessionTable::new()).0
    }

    #[test]
    fn help_lists_all_tool_names() {
        let help = help();
        let text = help["content"][0]["text"].as_str().unwrap();
        for name in TOOL_NAMES {
            assert!(text.contains(name));
        }
    }

    #[test]
    fn proxy_status_empty_registry() {
        let reg = registry();
        let status = proxy_status(&reg);
        assert!(status["content"][0]["text"].as_str().unwrap().contains("No backends"));
    }

    #[test]
    fn list_julia_sessions_reports_registered_backend() {
        let reg = registry();
        reg.register("demo", 4001, 111, Metadata::new()).unwrap();
        let listing = list_julia_sessions(&reg);
        let text = listing["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("demo"));
        assert!(text.contains("4001"));
    }

    #[test]
    fn kill_stale_dry_run_does_not_remove() {
        let reg = registry();
        reg.register("demo", 4001, 111, Metadata::new()).unwrap();
        reg.set_status("demo", BackendStatus::Disconnected, None).unwrap();
        let result = kill_stale_sessions(&reg, &json!({"dry_run": true})).unwrap();
        assert!(result["content"][0]["text"].as_str().unwrap().contains("would kill"));
        assert!(reg.exists("demo"));
    }

    #[test]
    fn kill_stale_force_false_skips_ready_backends() {
        let reg = registry();
        reg.register("demo", 4001, 111, Metadata::new()).unwrap();
        let result = kill_stale_sessions(&reg, &json!({"dry_run": false})).unwrap();
        assert!(result["content"][0]["text"].as_str().unwrap().contains("no stale"));
        assert!(reg.exists("demo"));
    }

    #[test]
    fn dashboard_url_embeds_port() {
        let url = dashboard_url(41234);
        assert!(url["content"][0]["text"].as_str().unwrap().contains("41234"));
    }
}

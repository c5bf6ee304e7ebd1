//! The MCP entry point: `POST /`, plus the `OPTIONS`/`DELETE`/`GET` handling
//! required alongside it.

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::warn;

use crate::error::ProxyError;
use crate::jsonrpc::{ErrorObject, Request as RpcRequest, Response as RpcResponse};
use crate::model::BackendStatus;
use crate::router::{resolve_target, Target};
use crate::security::{self, RequestIdentity};
use crate::toolset::{self, ToolContext};

use super::app::AppState;

const SESSION_HEADER: &str = "mcp-session-id";
const TARGET_HEADER: &str = "x-mcprepl-target";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestIdentity {
    RequestIdentity {
        authorization_header: header_str(headers, "authorization").map(str::to_string),
        forwarded_for: header_str(headers, "x-forwarded-for").map(str::to_string),
        peer_addr: peer.map(|a| a.ip()),
    }
}

fn rpc_error_response(status: StatusCode, id: Value, error: ErrorObject) -> Response {
    (status, Json(RpcResponse::failure(id, error))).into_response()
}

pub async fn mcp_entry(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    // 1. SecurityGate.
    let who = identity(&headers, Some(peer));
    if let Err(err) = security::check(&who, &state.security) {
        return rpc_error_response(
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            Value::Null,
            ErrorObject { code: err.jsonrpc_code(), message: err.sanitize(), data: None },
        );
    }

    if body.is_empty() {
        return rpc_error_response(StatusCode::BAD_REQUEST, Value::Null, ErrorObject::parse_error("empty request body"));
    }

    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(err) => {
            return rpc_error_response(StatusCode::BAD_REQUEST, Value::Null, ErrorObject::parse_error(err.to_string()))
        }
    };

    // 2. Transport rules: notifications get an empty 200, no body.
    if request.method.starts_with("notifications/") {
        return StatusCode::OK.into_response();
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let session_id = header_str(&headers, SESSION_HEADER).map(str::to_string);
    let header_target = header_str(&headers, TARGET_HEADER).map(str::to_string);

    // 3. Proxy control methods, handled in-process.
    match request.method.as_str() {
        "initialize" => return handle_initialize(&state, id, header_target, request.params).await,
        "logging/setLevel" => return handle_set_level(id, request.params),
        "tools/list" => return handle_tools_list(&state, id, session_id.as_deref()).await,
        "prompts/list" | "resources/list" => {
            let key = if request.method == "prompts/list" { "prompts" } else { "resources" };
            return Json(RpcResponse::success(id, json!({key: []}))).into_response();
        }
        "proxy/register" => return handle_register(&state, id, request.params),
        "proxy/unregister" => return handle_unregister(&state, id, request.params),
        "proxy/heartbeat" => return handle_heartbeat(&state, id, request.params),
        "proxy/status" => return handle_status(&state, id),
        "tools/call" => {
            if let Some(name) = request.params.as_ref().and_then(|p| p.get("name")).and_then(Value::as_str) {
                if toolset::is_proxy_tool(name) {
                    return handle_proxy_tool_call(&state, id, name, request.params).await;
                }
            }
        }
        _ => {}
    }

    // 4. Everything else: route to a backend.
    let session_target = match &session_id {
        Some(sid) => match state.sessions.get(sid) {
            Some(info) => info.target_backend_id,
            None => {
                return rpc_error_response(
                    StatusCode::BAD_REQUEST,
                    id,
                    ErrorObject { code: ProxyError::session_not_found(sid.clone()).jsonrpc_code(), message: "session not found".to_string(), data: None },
                )
            }
        },
        None => None,
    };

    let body_value = serde_json::to_value(&request).unwrap_or(Value::Null);
    match resolve_target(session_target.as_deref(), header_target.as_deref(), &state.registry) {
        Target::Backend(backend_id) => match state.router.route(&backend_id, session_id.as_deref(), body_value).await {
            Ok((status, result)) => (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(result)).into_response(),
            Err(err) => rpc_error_response(
                StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                id,
                ErrorObject { code: err.jsonrpc_code(), message: err.sanitize(), data: None },
            ),
        },
        Target::Unresolved { known_backends } => {
            let message = if known_backends.is_empty() {
                "no backend selected; start one with the start_julia_session proxy tool".to_string()
            } else {
                format!("no backend selected; available backends: {}", known_backends.join(", "))
            };
            rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_request(message))
        }
    }
}

async fn handle_initialize(state: &AppState, id: Value, header_target: Option<String>, params: Option<Value>) -> Response {
    let capabilities = params.unwrap_or(json!({}));
    let (session_id, _mailbox) = state.sessions.create(header_target, capabilities);
    let body = json!({
        "serverInfo": {"name": "mcprepl-proxy", "version": env!("CARGO_PKG_VERSION")},
        "capabilities": {"tools": {"listChanged": true}, "prompts": {}, "resources": {}},
    });
    let mut response = Json(RpcResponse::success(id, body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert("mcp-session-id", value);
    }
    response
}

fn handle_set_level(id: Value, params: Option<Value>) -> Response {
    const LEVELS: &[&str] = &["emergency", "alert", "critical", "error", "warning", "notice", "info", "debug"];
    let level = params.as_ref().and_then(|p| p.get("level")).and_then(Value::as_str).unwrap_or("");
    if LEVELS.contains(&level) {
        Json(RpcResponse::success(id, json!({}))).into_response()
    } else {
        rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_params(format!("unknown log level: {level}")))
    }
}

async fn handle_tools_list(state: &AppState, id: Value, session_id: Option<&str>) -> Response {
    let mut tools: Vec<Value> = toolset::TOOL_NAMES
        .iter()
        .map(|name| json!({"name": name, "description": format!("proxy tool: {name}")}))
        .collect();

    if let Some(sid) = session_id {
        if let Some(info) = state.sessions.get(sid) {
            if let Some(backend_id) = info.target_backend_id {
                if let Some(backend) = state.registry.get(&backend_id) {
                    if backend.status == BackendStatus::Ready {
                        let probe = json!({"jsonrpc": "2.0", "method": "tools/list", "id": "proxy-tools-list"});
                        let url = format!("http://127.0.0.1:{}/", backend.port);
                        let fetched = tokio::time::timeout(std::time::Duration::from_secs(2), state.router.http.post(&url).json(&probe).send()).await;
                        if let Ok(Ok(resp)) = fetched {
                            if let Ok(body) = resp.json::<Value>().await {
                                if let Some(backend_tools) = body.get("result").and_then(|r| r.get("tools")).and_then(Value::as_array) {
                                    tools.extend(backend_tools.clone());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    Json(RpcResponse::success(id, json!({"tools": tools}))).into_response()
}

fn handle_register(state: &AppState, id: Value, params: Option<Value>) -> Response {
    let Some(params) = params else {
        return rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_params("missing params"));
    };
    let (Some(backend_id), Some(port), Some(pid)) = (
        params.get("id").and_then(Value::as_str),
        params.get("port").and_then(Value::as_u64),
        params.get("pid").and_then(Value::as_u64),
    ) else {
        return rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_params("id, port and pid are required"));
    };
    let metadata = params.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default().into_iter().collect();

    match state.registry.register(backend_id, port as u16, pid as u32, metadata) {
        Ok(_) => Json(RpcResponse::success(id, json!({"status": "registered"}))).into_response(),
        Err(err @ ProxyError::DuplicateRegistration { existing_pid, existing_port, requested_pid, requested_port, .. }) => rpc_error_response(
            StatusCode::CONFLICT,
            id,
            ErrorObject {
                code: err.jsonrpc_code(),
                message: err.to_string(),
                data: Some(json!({
                    "existing_pid": existing_pid,
                    "existing_port": existing_port,
                    "requested_pid": requested_pid,
                    "requested_port": requested_port,
                })),
            },
        ),
        Err(err) => rpc_error_response(StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), id, ErrorObject { code: err.jsonrpc_code(), message: err.sanitize(), data: None }),
    }
}

fn handle_unregister(state: &AppState, id: Value, params: Option<Value>) -> Response {
    let backend_id = params.as_ref().and_then(|p| p.get("id")).and_then(Value::as_str).unwrap_or_default();
    state.registry.unregister(backend_id);
    Json(RpcResponse::success(id, json!({"status": "unregistered"}))).into_response()
}

fn handle_heartbeat(state: &AppState, id: Value, params: Option<Value>) -> Response {
    let Some(params) = params else {
        return rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_params("missing params"));
    };
    let (Some(backend_id), Some(port), Some(pid)) = (
        params.get("id").and_then(Value::as_str),
        params.get("port").and_then(Value::as_u64),
        params.get("pid").and_then(Value::as_u64),
    ) else {
        return rpc_error_response(StatusCode::BAD_REQUEST, id, ErrorObject::invalid_params("id, port and pid are required"));
    };
    let metadata = params.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default().into_iter().collect();
    state.registry.heartbeat(backend_id, port as u16, pid as u32, metadata);
    Json(RpcResponse::success(id, json!({"status": "ok"}))).into_response()
}

fn handle_status(state: &AppState, id: Value) -> Response {
    let backends = state.registry.list();
    Json(RpcResponse::success(id, json!({"backends": backends}))).into_response()
}

async fn handle_proxy_tool_call(state: &AppState, id: Value, name: &str, params: Option<Value>) -> Response {
    let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned().unwrap_or(json!({}));
    let ctx = ToolContext { registry: &state.registry, proxy_port: state.proxy_port, logs_dir: state.logs_dir.clone() };
    match toolset::call(&ctx, name, &arguments).await {
        Ok(result) => Json(RpcResponse::success(id, result)).into_response(),
        Err(err) => {
            warn!(tool = name, error = %err, "proxy tool call failed");
            rpc_error_response(StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), id, ErrorObject { code: err.jsonrpc_code(), message: err.sanitize(), data: None })
        }
    }
}

pub async fn mcp_options() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match header_str(&headers, SESSION_HEADER) {
        Some(id) => {
            state.sessions.delete(id);
            StatusCode::OK.into_response()
        }
        None => rpc_error_response(StatusCode::BAD_REQUEST, Value::Null, ErrorObject::invalid_request("missing Mcp-Session-Id")),
    }
}

pub async fn mcp_get() -> Response {
    rpc_error_response(StatusCode::METHOD_NOT_ALLOWED, Value::Null, ErrorObject::invalid_request("SSE not offered on this path"))
}

//! Black-box coverage of the MCP entry point (`POST /`): the proxy-owned
//! method dispatch, session binding, and the happy-path/duplicate-
//! registration scenarios from the spec's end-to-end section.

mod common;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn initialize_mints_a_session_header() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .post(&proxy.base_url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("mcp-session-id").is_some());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["serverInfo"]["name"], "mcprepl-proxy");
}

#[tokio::test]
async fn tools_list_with_no_target_returns_only_proxy_tools() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .post(&proxy.base_url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let tools = body["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names.len(), mcprepl_proxy::toolset::TOOL_NAMES.len());
    for expected in mcprepl_proxy::toolset::TOOL_NAMES {
        assert!(names.contains(expected), "missing proxy tool {expected}");
    }
}

#[tokio::test]
async fn request_with_unknown_session_id_is_rejected() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .post(&proxy.base_url)
        .header("mcp-session-id", "does-not-exist")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "noop"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);
}

#[tokio::test]
async fn notifications_get_an_empty_200() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .post(&proxy.base_url)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_body_is_a_parse_error() {
    let proxy = common::spawn_lax().await;
    let resp = proxy.client.post(&proxy.base_url).body(Vec::new()).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn get_is_not_allowed_on_the_mcp_path() {
    let proxy = common::spawn_lax().await;
    let resp = proxy.client.get(&proxy.base_url).send().await.unwrap();
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn duplicate_registration_preserves_the_incumbent() {
    let proxy = common::spawn_lax().await;
    let register = |port: u16, pid: u32| {
        json!({"jsonrpc": "2.0", "id": 1, "method": "proxy/register", "params": {"id": "x", "port": port, "pid": pid}})
    };

    let ok = proxy.client.post(&proxy.base_url).json(&register(4001, 111)).send().await.unwrap();
    assert_eq!(ok.status(), 200);

    let conflict = proxy.client.post(&proxy.base_url).json(&register(4002, 222)).send().await.unwrap();
    assert_eq!(conflict.status(), 409);
    let body: Value = conflict.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["data"]["existing_pid"], 111);

    let info = proxy.registry.get("x").unwrap();
    assert_eq!(info.port, 4001);
    assert_eq!(info.pid, Some(111));
}

#[tokio::test]
async fn happy_path_tool_call_is_forwarded_and_audited() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2, "result": {"content": [{"type": "text", "text": "ok"}]}
        })))
        .mount(&backend)
        .await;
    let backend_port: u16 = backend.uri().rsplit(':').next().unwrap().parse().unwrap();

    let proxy = common::spawn_lax().await;
    proxy.registry.register("julia-a", backend_port, 555, mcprepl_proxy::model::Metadata::new()).unwrap();

    let init = proxy
        .client
        .post(&proxy.base_url)
        .header("x-mcprepl-target", "julia-a")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    let session_id = init.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();

    let call = proxy
        .client
        .post(&proxy.base_url)
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "noop", "arguments": {}}}))
        .send()
        .await
        .unwrap();
    assert_eq!(call.status(), 200);
    let body: Value = call.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "ok");

    let recent = proxy.events.recent(Some(&session_id), 10);
    let kinds: Vec<_> = recent.iter().map(|e| e.event_type).collect();
    assert!(kinds.contains(&mcprepl_proxy::model::EventType::ToolCall));
    assert!(kinds.contains(&mcprepl_proxy::model::EventType::Output));
}

#[tokio::test]
async fn help_tool_call_returns_text_content_without_a_backend() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .post(&proxy.base_url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "help", "arguments": {}}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["type"], "text");
}

//! Outage-and-recovery (spec §8 scenario S2): a client request buffered
//! against a `disconnected` backend is flushed with the backend's real
//! response once the Reconnector's probe succeeds.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use serde_json::{json, Value};

/// A fake backend that refuses `ping` probes until `accept_probes` flips,
/// then answers both probes and the forwarded `tools/call` with success.
async fn fake_backend(accept_probes: Arc<AtomicBool>) -> SocketAddr {
    async fn handle(State(accept): State<Arc<AtomicBool>>, Json(body): Json<Value>) -> Json<Value> {
        let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
        if method == "ping" {
            if accept.load(Ordering::SeqCst) {
                return Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": "pong"}));
            }
            return Json(json!({"jsonrpc": "2.0", "id": body["id"], "error": {"code": -1, "message": "not ready"}}));
        }
        Json(json!({"jsonrpc": "2.0", "id": body.get("id").cloned().unwrap_or(Value::Null), "result": {"content": [{"type": "text", "text": "recovered"}]}}))
    }

    let app = axum::Router::new().route("/", post(handle)).with_state(accept_probes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[tokio::test]
async fn buffered_request_is_flushed_once_the_backend_recovers() {
    let accept_probes = Arc::new(AtomicBool::new(false));
    let backend_addr = fake_backend(accept_probes.clone()).await;

    let proxy = common::spawn_lax().await;
    proxy.registry.register("a", backend_addr.port(), 777, mcprepl_proxy::model::Metadata::new()).unwrap();
    proxy.registry.set_status("a", mcprepl_proxy::model::BackendStatus::Disconnected, None).unwrap();

    // Fire the buffered request in the background; it should hang until
    // the backend starts accepting probes.
    let client = proxy.client.clone();
    let base_url = proxy.base_url.clone();
    let call = tokio::spawn(async move {
        client
            .post(&base_url)
            .header("x-mcprepl-target", "a")
            .json(&json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": {"name": "noop", "arguments": {}}}))
            .send()
            .await
            .unwrap()
    });

    // Give the router time to buffer and the Reconnector time to start
    // probing (and fail a few times) before letting it succeed.
    tokio::time::sleep(Duration::from_millis(80)).await;
    accept_probes.store(true, Ordering::SeqCst);

    let resp = tokio::time::timeout(Duration::from_secs(2), call).await.expect("buffered call did not complete").unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "recovered");
    assert_eq!(proxy.registry.get("a").unwrap().status, mcprepl_proxy::model::BackendStatus::Ready);
}

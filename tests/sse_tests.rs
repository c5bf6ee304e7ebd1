//! Spec §8 scenario S5: SSE subscribers see a `connected` frame first, then
//! only the events matching their session filter, in publish order.

mod common;

use std::time::Duration;

use serde_json::json;

/// Reads SSE frames (each terminated by a blank line) off a streaming
/// response, buffering across `chunk()` reads since a TCP read boundary
/// need not line up with an SSE event boundary.
struct FrameReader {
    resp: reqwest::Response,
    buf: String,
}

impl FrameReader {
    fn new(resp: reqwest::Response) -> Self {
        Self { resp, buf: String::new() }
    }

    async fn next_frame(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let frame = self.buf[..end].to_string();
                self.buf.drain(..end + 2);
                return frame;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(2), self.resp.chunk())
                .await
                .expect("timed out waiting for SSE bytes")
                .expect("chunk read error")
                .expect("stream ended before a full frame arrived");
            self.buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

#[tokio::test]
async fn first_frame_is_the_connected_event() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .get(format!("{}/dashboard/api/events/stream?id=b", proxy.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut reader = FrameReader::new(resp);
    let first = reader.next_frame().await;
    assert!(first.starts_with("event: connected"), "unexpected first frame: {first:?}");
    assert!(first.contains(r#"{"status":"connected"}"#));
}

#[tokio::test]
async fn subscriber_only_sees_events_matching_its_filter() {
    let proxy = common::spawn_lax().await;
    let resp = proxy
        .client
        .get(format!("{}/dashboard/api/events/stream?id=b", proxy.base_url))
        .send()
        .await
        .unwrap();
    let mut reader = FrameReader::new(resp);
    let _connected = reader.next_frame().await;

    proxy.events.publish(mcprepl_proxy::model::Event {
        session_id: Some("b".to_string()),
        event_type: mcprepl_proxy::model::EventType::ToolCall,
        timestamp: mcprepl_proxy::model::now_millis(),
        payload: json!({"n": 1}),
        duration_millis: None,
    });
    proxy.events.publish(mcprepl_proxy::model::Event {
        session_id: Some("c".to_string()),
        event_type: mcprepl_proxy::model::EventType::ToolCall,
        timestamp: mcprepl_proxy::model::now_millis(),
        payload: json!({"n": 2}),
        duration_millis: None,
    });

    let frame = reader.next_frame().await;
    assert!(frame.starts_with("event: update"));
    assert!(frame.contains("\"session_id\":\"b\""));
    assert!(!frame.contains("\"session_id\":\"c\""));
}

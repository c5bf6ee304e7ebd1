//! `GET /dashboard/api/events/stream`: Server-Sent Events.
//!
//! Polls the EventBus ring at a fixed period and emits only events newer
//! than the last-sent watermark.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::Deserialize;

use crate::model::{now_millis, Event, Timestamp};

use super::app::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    pub id: Option<String>,
}

/// Poll-loop state: the filter/watermark plus any events from the last poll
/// still waiting to be emitted one frame at a time.
struct PollState {
    state: AppState,
    filter: Option<String>,
    last: Timestamp,
    queued: VecDeque<Event>,
}

pub async fn events_stream(
    State(state): State<AppState>,
    Query(q): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let poll_interval = state.config.sse_poll_interval;

    let connected = stream::once(async { Ok(SseEvent::default().event("connected").data(r#"{"status":"connected"}"#)) });

    // History is already served by `/dashboard/api/events`; a stream subscriber
    // should only see events published after it connects.
    let initial = PollState { state, filter: q.id, last: now_millis(), queued: VecDeque::new() };
    let updates = stream::unfold(initial, move |mut poll| async move {
        loop {
            if let Some(event) = poll.queued.pop_front() {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                return Some((Ok(SseEvent::default().event("update").data(payload)), poll));
            }

            tokio::time::sleep(poll_interval).await;
            let recent = poll.state.events.recent(poll.filter.as_deref(), 1000);
            let fresh: Vec<Event> = recent.into_iter().filter(|e| e.timestamp > poll.last).collect();
            if let Some(newest) = fresh.iter().map(|e| e.timestamp).max() {
                poll.last = newest;
            }
            poll.queued.extend(fresh);
        }
    });

    Sse::new(connected.chain(updates)).keep_alive(KeepAlive::default())
}

use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use braid_agent::RunHandle;
use braid_core::event::RunEvent;
use braid_core::types::SessionId;

pub type EventSse = Sse<KeepAliveStream<BoxStream<'static, Result<Event, axum::Error>>>>;

/// One SSE frame: `{type, node?, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SseFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub payload: serde_json::Value,
}

impl SseFrame {
    /// Opening frame telling the client which session the run belongs to.
    pub fn session(session_id: &SessionId) -> Self {
        Self {
            frame_type: "session".to_string(),
            node: None,
            payload: serde_json::json!({ "session_id": session_id }),
        }
    }
}

impl From<&RunEvent> for SseFrame {
    fn from(event: &RunEvent) -> Self {
        let payload = match event {
            RunEvent::StepStarted { step, .. } => serde_json::json!({ "step": step }),
            RunEvent::PartialOutput { text, .. } => serde_json::json!({ "text": text }),
            RunEvent::StepCompleted { step, delta, .. } => {
                serde_json::json!({ "step": step, "delta": delta })
            }
            RunEvent::RunCompleted { version } => serde_json::json!({ "version": version }),
            RunEvent::RunFailed { kind, message, .. } => {
                serde_json::json!({ "kind": kind, "message": message })
            }
        };
        Self {
            frame_type: event.type_name().to_string(),
            node: event.node().map(str::to_string),
            payload,
        }
    }
}

/// Stream a run's events to the client, optionally preceded by `opening`.
///
/// The response ends after the terminal event. A client that disconnects
/// early does not stop the run.
pub fn sse_response(handle: RunHandle, opening: Option<SseFrame>) -> EventSse {
    let frames = stream::iter(opening).chain(handle.events.map(|e| SseFrame::from(&e)));
    let events = frames.map(|frame| Event::default().event(frame.frame_type.clone()).json_data(&frame));
    Sse::new(events.boxed()).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

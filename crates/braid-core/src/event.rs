//! The Event Channel: one bounded, ordered stream of progress notifications per run.
//!
//! The engine holds an [`EventSender`], the caller holds the matching
//! [`EventStream`]. Bounded buffering gives backpressure: a slow consumer
//! slows the run down instead of growing memory. A consumer that goes away
//! does not stop the run; events are simply discarded from then on.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ErrorKind;

/// What a single applied delta changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeltaSummary {
    /// Version of the state after the delta, `None` when nothing was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub turns_appended: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scratch_keys: Vec<String>,
    /// Number of turns folded into a summary turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<usize>,
}

/// A progress notification for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    StepStarted {
        node: String,
        step: usize,
    },
    PartialOutput {
        node: String,
        text: String,
    },
    StepCompleted {
        node: String,
        step: usize,
        delta: DeltaSummary,
    },
    RunCompleted {
        version: u64,
    },
    RunFailed {
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
        message: String,
    },
}

impl RunEvent {
    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StepStarted { .. } => "step-started",
            Self::PartialOutput { .. } => "partial-output",
            Self::StepCompleted { .. } => "step-completed",
            Self::RunCompleted { .. } => "run-completed",
            Self::RunFailed { .. } => "run-failed",
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            Self::StepStarted { node, .. }
            | Self::PartialOutput { node, .. }
            | Self::StepCompleted { node, .. } => Some(node),
            Self::RunFailed { node, .. } => node.as_deref(),
            Self::RunCompleted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}

/// Create a bounded event channel.
pub fn event_channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            detached: Arc::new(AtomicBool::new(false)),
        },
        EventStream { rx },
    )
}

/// Producer half of the Event Channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<RunEvent>,
    detached: Arc<AtomicBool>,
}

impl EventSender {
    /// Emit an event, waiting for buffer space. Returns `false` once the
    /// consumer has gone away.
    pub async fn emit(&self, event: RunEvent) -> bool {
        if self.detached.load(Ordering::Relaxed) {
            return false;
        }
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                if !self.detached.swap(true, Ordering::Relaxed) {
                    debug!("Event consumer dropped, discarding further events");
                }
                false
            }
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed) || self.tx.is_closed()
    }
}

/// Consumer half of the Event Channel.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RunEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Drain events until the terminal event (inclusive) or until the
    /// producer is gone.
    pub async fn collect_until_terminal(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Stream for EventStream {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = RunEvent::StepStarted {
            node: "llm".into(),
            step: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step-started");
        assert_eq!(json["node"], "llm");
        assert_eq!(event.type_name(), "step-started");

        let failed = RunEvent::RunFailed {
            kind: ErrorKind::StepLimitExceeded,
            node: Some("loop".into()),
            message: "Run exceeded max steps (2)".into(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "run-failed");
        assert_eq!(json["kind"], "step_limit_exceeded");
        assert!(failed.is_terminal());
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = event_channel(4);
        let producer = tokio::spawn(async move {
            for step in 0..10 {
                tx.emit(RunEvent::StepStarted {
                    node: "n".into(),
                    step,
                })
                .await;
            }
            tx.emit(RunEvent::RunCompleted { version: 10 }).await;
        });

        let events = rx.collect_until_terminal().await;
        producer.await.unwrap();

        assert_eq!(events.len(), 11);
        for (i, event) in events.iter().take(10).enumerate() {
            assert_eq!(
                event,
                &RunEvent::StepStarted {
                    node: "n".into(),
                    step: i
                }
            );
        }
        assert!(events[10].is_terminal());
    }

    #[tokio::test]
    async fn test_dropped_consumer_detaches_sender() {
        let (tx, rx) = event_channel(1);
        drop(rx);
        assert!(!tx.emit(RunEvent::RunCompleted { version: 1 }).await);
        assert!(tx.is_detached());
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use braid_core::config::EngineConfig;
use braid_core::error::{BraidError, Result};
use braid_core::event::{EventSender, RunEvent};
use braid_core::types::{Role, SessionId};

use super::definition::{GraphDefinition, Next};
use super::node::NodeContext;
use crate::state::{Delta, StateContainer};

/// Limits applied to every run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Node invocations allowed per run.
    pub max_steps: usize,
    /// Deadline for a single node invocation.
    pub step_timeout: Option<Duration>,
}

impl ExecutorConfig {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            max_steps: engine.max_steps,
            step_timeout: (engine.step_timeout_secs > 0)
                .then(|| Duration::from_secs(engine.step_timeout_secs)),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// Result of a run that reached a terminal node.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: SessionId,
    /// Nodes executed, in order.
    pub visited: Vec<String>,
    /// Final state version.
    pub version: u64,
    /// Text of the final assistant turn, if the run ended on one.
    pub reply: Option<String>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn steps(&self) -> usize {
        self.visited.len()
    }

    pub fn event(&self) -> RunEvent {
        RunEvent::RunCompleted {
            version: self.version,
        }
    }
}

/// Why and where a run stopped early.
#[derive(Debug)]
pub struct RunFailure {
    pub error: BraidError,
    pub node: Option<String>,
    pub visited: Vec<String>,
}

impl RunFailure {
    pub fn event(&self) -> RunEvent {
        RunEvent::RunFailed {
            kind: self.error.kind(),
            node: self.node.clone(),
            message: self.error.to_string(),
        }
    }
}

impl From<RunFailure> for BraidError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}

pub type RunOutcome = std::result::Result<RunReport, RunFailure>;

/// The terminal event describing an outcome.
pub fn terminal_event(outcome: &RunOutcome) -> RunEvent {
    match outcome {
        Ok(report) => report.event(),
        Err(failure) => failure.event(),
    }
}

/// Drives runs of one graph.
///
/// Each step invokes the current node against a snapshot, applies the
/// returned delta, emits `step-completed` and resolves the next node.
/// Steps are strictly sequential. A failing, cancelled or timed-out step
/// contributes nothing to the state; deltas of earlier steps stay applied.
pub struct GraphExecutor {
    graph: Arc<GraphDefinition>,
    config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(graph: Arc<GraphDefinition>, config: ExecutorConfig) -> Self {
        Self { graph, config }
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the graph and emit the terminal event.
    pub async fn execute(
        &self,
        session_id: &SessionId,
        container: &mut StateContainer,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let outcome = self.run(session_id, container, events, cancel).await;
        events.emit(terminal_event(&outcome)).await;
        outcome
    }

    /// Run the graph without emitting the terminal event, so the caller can
    /// finish its own bookkeeping first.
    pub async fn run(
        &self,
        session_id: &SessionId,
        container: &mut StateContainer,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let start = Instant::now();
        let graph = &*self.graph;
        let mut visited: Vec<String> = Vec::new();
        let mut current = graph.entry();

        info!(
            session_id = %session_id,
            entry = graph.entry_name(),
            version = container.version(),
            "Run started"
        );

        let fail = |error: BraidError, node: &str, visited: Vec<String>| {
            error!(session_id = %session_id, node, kind = %error.kind(), error = %error, "Run failed");
            RunFailure {
                error,
                node: Some(node.to_string()),
                visited,
            }
        };

        loop {
            let step = visited.len();
            let name = graph.name(current);

            if cancel.is_cancelled() {
                return Err(fail(BraidError::Cancelled, name, visited));
            }
            if step >= self.config.max_steps {
                return Err(fail(
                    BraidError::StepLimitExceeded(self.config.max_steps),
                    name,
                    visited,
                ));
            }

            let started = RunEvent::StepStarted {
                node: name.to_string(),
                step,
            };
            if let Err(e) = emit_or_cancel(events, started, cancel).await {
                return Err(fail(e, name, visited));
            }
            debug!(session_id = %session_id, node = name, step, "Step started");
            let step_start = Instant::now();

            let ctx = NodeContext::new(
                session_id.clone(),
                name,
                step,
                events.clone(),
                cancel.clone(),
            );
            let invocation = graph.node(current).invoke(&ctx, container.snapshot());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BraidError::Cancelled),
                r = with_deadline(invocation, self.config.step_timeout, name) => r,
            };
            visited.push(name.to_string());

            let delta = match result {
                // A node may finish in the same instant the run is cancelled
                Ok(_) if cancel.is_cancelled() => {
                    return Err(fail(BraidError::Cancelled, name, visited));
                }
                Ok(delta) => delta,
                Err(e) => return Err(fail(e, name, visited)),
            };

            let applied = !delta.is_empty();
            let mut summary = delta.summarize(None);
            match container.apply_delta(delta) {
                Ok(version) => {
                    if applied {
                        summary.version = Some(version);
                    }
                }
                Err(e) => return Err(fail(e, name, visited)),
            }

            debug!(
                session_id = %session_id,
                node = name,
                step,
                applied,
                elapsed_ms = step_start.elapsed().as_millis() as u64,
                "Step completed"
            );
            let completed = RunEvent::StepCompleted {
                node: name.to_string(),
                step,
                delta: summary,
            };
            // The delta is already committed; only the notification is abandoned
            if let Err(e) = emit_or_cancel(events, completed, cancel).await {
                return Err(fail(e, name, visited));
            }

            match graph.resolve(current, container.state()) {
                Next::Node(next) => current = next,
                Next::End => break,
            }
        }

        let state = container.state();
        let reply = state
            .last_turn()
            .filter(|t| t.role == Role::Assistant)
            .map(|t| t.content.clone());
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            session_id = %session_id,
            steps = visited.len(),
            version = state.version,
            elapsed_ms,
            "Run completed"
        );

        Ok(RunReport {
            session_id: session_id.clone(),
            visited,
            version: state.version,
            reply,
            elapsed_ms,
        })
    }
}

/// Emit a step event unless the run is cancelled while waiting for buffer
/// space. A consumer that holds the stream but stops reading must not keep a
/// cancelled run alive.
async fn emit_or_cancel(
    events: &EventSender,
    event: RunEvent,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BraidError::Cancelled),
        _ = events.emit(event) => Ok(()),
    }
}

async fn with_deadline<F>(invocation: F, deadline: Option<Duration>, node: &str) -> Result<Delta>
where
    F: Future<Output = Result<Delta>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, invocation)
            .await
            .unwrap_or_else(|_| {
                Err(BraidError::Timeout {
                    node: node.to_string(),
                    secs: limit.as_secs(),
                })
            }),
        None => invocation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Node, NodeHandler, END};
    use crate::state::StateSnapshot;
    use braid_core::error::ErrorKind;
    use braid_core::event::event_channel;
    use braid_core::types::Turn;
    use futures::future::BoxFuture;

    struct Stuck;

    impl NodeHandler for Stuck {
        fn invoke<'a>(
            &'a self,
            _ctx: &'a NodeContext,
            _state: StateSnapshot,
        ) -> BoxFuture<'a, Result<Delta>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Delta::new(0))
            })
        }
    }

    fn append(text: &'static str) -> Node {
        Node::from_fn(move |s| Ok(Delta::against(s).append_turn(Turn::assistant(text))))
    }

    fn executor(graph: GraphDefinition, max_steps: usize, timeout: Option<u64>) -> GraphExecutor {
        GraphExecutor::new(
            Arc::new(graph),
            ExecutorConfig {
                max_steps,
                step_timeout: timeout.map(Duration::from_secs),
            },
        )
    }

    #[tokio::test]
    async fn test_linear_run_applies_each_delta() {
        let graph = GraphBuilder::new()
            .node("a", append("one"))
            .node("b", append("two"))
            .edge("a", "b")
            .edge("b", END)
            .entry("a")
            .build()
            .unwrap();
        let exec = executor(graph, 10, None);
        let (tx, mut rx) = event_channel(32);
        let mut container = StateContainer::new();

        let report = exec
            .execute(&SessionId::from_string("s"), &mut container, &tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.visited, vec!["a", "b"]);
        assert_eq!(report.version, 2);
        assert_eq!(report.reply.as_deref(), Some("two"));

        let types: Vec<_> = rx
            .collect_until_terminal()
            .await
            .iter()
            .map(|e| e.type_name())
            .collect();
        assert_eq!(
            types,
            vec![
                "step-started",
                "step-completed",
                "step-started",
                "step-completed",
                "run-completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_self_loop_hits_step_limit() {
        let graph = GraphBuilder::new()
            .node("loop", append("again"))
            .edge("loop", "loop")
            .entry("loop")
            .build()
            .unwrap();
        let exec = executor(graph, 2, None);
        let (tx, _rx) = event_channel(32);
        let mut container = StateContainer::new();

        let failure = exec
            .run(&SessionId::from_string("s"), &mut container, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BraidError::StepLimitExceeded(2)));
        assert_eq!(failure.visited.len(), 2);
        assert_eq!(failure.node.as_deref(), Some("loop"));
        // Both completed steps stay committed
        assert_eq!(container.version(), 2);
    }

    #[tokio::test]
    async fn test_failed_step_applies_nothing() {
        let graph = GraphBuilder::new()
            .node("ok", append("kept"))
            .node("bad", Node::from_fn(|_| Err(BraidError::LlmFatal("400".into()))))
            .edge("ok", "bad")
            .entry("ok")
            .build()
            .unwrap();
        let exec = executor(graph, 10, None);
        let (tx, mut rx) = event_channel(32);
        let mut container = StateContainer::new();

        let failure = exec
            .execute(&SessionId::from_string("s"), &mut container, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.node.as_deref(), Some("bad"));
        assert_eq!(container.version(), 1);

        let events = rx.collect_until_terminal().await;
        let failed: Vec<_> = events.iter().filter(|e| e.type_name() == "run-failed").collect();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            RunEvent::RunFailed { kind: ErrorKind::Fatal, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_deadline_times_out() {
        let graph = GraphBuilder::new()
            .node("stuck", Node::custom(Stuck))
            .entry("stuck")
            .build()
            .unwrap();
        let exec = executor(graph, 5, Some(5));
        let (tx, _rx) = event_channel(32);
        let mut container = StateContainer::new();

        let failure = exec
            .run(&SessionId::from_string("s"), &mut container, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BraidError::Timeout { secs: 5, .. }));
        assert_eq!(failure.error.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_step() {
        let graph = GraphBuilder::new()
            .node("stuck", Node::custom(Stuck))
            .entry("stuck")
            .build()
            .unwrap();
        let exec = executor(graph, 5, None);
        let (tx, _rx) = event_channel(32);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut container = StateContainer::new();
        let failure = exec
            .run(&SessionId::from_string("s"), &mut container, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BraidError::Cancelled));
        assert_eq!(container.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_consumer_stops_reading() {
        let graph = GraphBuilder::new()
            .node("a", append("one"))
            .node("b", append("two"))
            .edge("a", "b")
            .edge("b", END)
            .entry("a")
            .build()
            .unwrap();
        let exec = executor(graph, 10, None);
        // Held but never read: the second event fills the buffer
        let (tx, _rx) = event_channel(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut container = StateContainer::new();
        let failure = tokio::time::timeout(
            Duration::from_secs(3),
            exec.run(&SessionId::from_string("s"), &mut container, &tx, &cancel),
        )
        .await
        .expect("cancelled run must not stay blocked on the event buffer")
        .unwrap_err();

        assert!(matches!(failure.error, BraidError::Cancelled));
        assert_eq!(failure.node.as_deref(), Some("a"));
        // Step "a" was applied before the buffer filled up
        assert_eq!(container.version(), 1);
    }

    #[tokio::test]
    async fn test_empty_delta_reports_no_version() {
        let graph = GraphBuilder::new()
            .node("noop", Node::from_fn(|s| Ok(Delta::against(s))))
            .entry("noop")
            .build()
            .unwrap();
        let exec = executor(graph, 5, None);
        let (tx, mut rx) = event_channel(32);
        let mut container = StateContainer::new();
        exec.execute(&SessionId::from_string("s"), &mut container, &tx, &CancellationToken::new())
            .await
            .unwrap();

        let events = rx.collect_until_terminal().await;
        assert!(matches!(
            &events[1],
            RunEvent::StepCompleted { delta, .. } if delta.version.is_none()
        ));
        assert_eq!(events[2], RunEvent::RunCompleted { version: 0 });
    }
}

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use braid_core::error::{BraidError, Result};
use braid_core::types::{SessionId, ToolCall, ToolContext, Turn};
use braid_tools::ToolRegistry;

use super::llm::TOOL_REQUESTS_KEY;
use crate::graph::NodeContext;
use crate::state::{Delta, StateSnapshot};

/// Executes the tool calls recorded by the preceding LLM node.
///
/// Every call produces one tool turn, in request order. Recoverable tool
/// errors become error turns so the model can react to them; a fatal tool
/// error fails the step.
pub struct ToolNode {
    registry: Arc<ToolRegistry>,
    parallel: bool,
}

impl ToolNode {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            parallel: true,
        }
    }

    /// Run independent calls concurrently (on by default).
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn invoke(&self, ctx: &NodeContext, state: StateSnapshot) -> Result<Delta> {
        let Some(raw) = state.scratch.get(TOOL_REQUESTS_KEY) else {
            warn!(node = %ctx.node, "Tool node reached without pending tool requests");
            return Ok(Delta::against(&state));
        };
        let calls: Vec<ToolCall> = serde_json::from_value(raw.clone())
            .map_err(|e| BraidError::LlmParse(format!("malformed tool requests: {}", e)))?;

        let turns = if self.parallel && calls.len() > 1 {
            join_all(calls.iter().map(|call| self.run_call(&ctx.session_id, call)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?
        } else {
            let mut turns = Vec::with_capacity(calls.len());
            for call in &calls {
                turns.push(self.run_call(&ctx.session_id, call).await?);
            }
            turns
        };

        let mut delta = Delta::against(&state);
        for turn in turns {
            delta = delta.append_turn(turn);
        }
        Ok(delta.remove_scratch(TOOL_REQUESTS_KEY))
    }

    async fn run_call(&self, session_id: &SessionId, call: &ToolCall) -> Result<Turn> {
        let ctx = ToolContext {
            session_id: session_id.clone(),
            call_id: call.id.clone(),
        };
        match self
            .registry
            .execute(&call.name, call.arguments.clone(), ctx)
            .await
        {
            Ok(result) => {
                debug!(tool = %call.name, call_id = %call.id, is_error = result.is_error, "Tool finished");
                Ok(Turn::tool_result(&call.id, &call.name, result.content, result.is_error))
            }
            Err(e) if e.is_recoverable_tool_error() => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool failed");
                Ok(Turn::tool_result(
                    &call.id,
                    &call.name,
                    format!("Error: {}", e),
                    true,
                ))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeltaOp, StateContainer};
    use braid_core::event::event_channel;
    use braid_core::types::{Role, SessionState};
    use braid_test_utils::{BrokenTool, EchoTool, FatalTool};
    use tokio_util::sync::CancellationToken;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::with_builtins();
        registry.register(EchoTool);
        registry.register(BrokenTool);
        registry.register(FatalTool);
        Arc::new(registry)
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    fn container_with(calls: Vec<ToolCall>) -> StateContainer {
        let mut state = SessionState::default();
        state.turns.push(Turn::user("go"));
        state.turns.push(Turn::assistant_with_calls("", calls.clone()));
        state
            .scratch
            .insert(TOOL_REQUESTS_KEY.into(), serde_json::to_value(calls).unwrap());
        StateContainer::from_state(state)
    }

    fn ctx() -> NodeContext {
        let (tx, _rx) = event_channel(8);
        NodeContext::new(SessionId::from_string("s"), "tools", 1, tx, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_results_keep_request_order() {
        let node = ToolNode::new(registry());
        let mut container = container_with(vec![
            call("c1", "add", serde_json::json!({"a": 2, "b": 3})),
            call("c2", "echo", serde_json::json!({"text": "hi"})),
        ]);

        let delta = node.invoke(&ctx(), container.snapshot()).await.unwrap();
        container.apply_delta(delta).unwrap();

        let state = container.state();
        assert!(!state.scratch.contains_key(TOOL_REQUESTS_KEY));
        let tools: Vec<_> = state.turns.iter().filter(|t| t.role == Role::Tool).collect();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tools[0].content, "5");
        assert_eq!(tools[1].content, "hi");
    }

    #[tokio::test]
    async fn test_recoverable_errors_become_error_turns() {
        let node = ToolNode::new(registry()).parallel(false);
        let container = container_with(vec![
            call("c1", "broken", serde_json::json!({})),
            call("c2", "no_such_tool", serde_json::json!({})),
            call("c3", "divide", serde_json::json!({"a": 1, "b": 0})),
        ]);

        let delta = node.invoke(&ctx(), container.snapshot()).await.unwrap();
        let turns: Vec<_> = delta
            .ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::AppendTurn(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(turns.len(), 3);
        assert!(turns.iter().all(|t| t.is_error));
        assert!(turns[0].content.starts_with("Error:"));
        assert!(turns[1].content.contains("no_such_tool"));
    }

    #[tokio::test]
    async fn test_fatal_tool_error_fails_step() {
        let node = ToolNode::new(registry());
        let container = container_with(vec![
            call("c1", "echo", serde_json::json!({"text": "x"})),
            call("c2", "fatal", serde_json::json!({})),
        ]);

        let err = node.invoke(&ctx(), container.snapshot()).await.unwrap_err();
        assert!(matches!(err, BraidError::ToolFatal { .. }));
    }

    #[tokio::test]
    async fn test_missing_requests_is_a_no_op() {
        let node = ToolNode::new(registry());
        let container = StateContainer::new();
        let delta = node.invoke(&ctx(), container.snapshot()).await.unwrap();
        assert!(delta.is_empty());
    }
}

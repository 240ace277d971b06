use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use braid_core::error::Result;
use braid_core::event::{EventSender, RunEvent};
use braid_core::types::{SessionId, SessionState};

use crate::nodes::{LlmNode, SummaryNode, ToolNode};
use crate::state::{Delta, StateSnapshot};

/// What a node sees of the run it is part of.
///
/// Partial output goes out through [`NodeContext::emit_partial`] while the
/// node is still working, so it always precedes the step's
/// `step-completed` event.
pub struct NodeContext {
    pub session_id: SessionId,
    pub node: String,
    pub step: usize,
    events: EventSender,
    cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        session_id: SessionId,
        node: impl Into<String>,
        step: usize,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            node: node.into(),
            step,
            events,
            cancel,
        }
    }

    /// Stream a fragment of output to the caller.
    pub async fn emit_partial(&self, text: impl Into<String>) {
        self.events
            .emit(RunEvent::PartialOutput {
                node: self.node.clone(),
                text: text.into(),
            })
            .await;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Extension point for node kinds outside the built-in set.
///
/// `Ok(delta)` is normal completion; `Err` fails the run and the delta of
/// this step is never applied.
pub trait NodeHandler: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        ctx: &'a NodeContext,
        state: StateSnapshot,
    ) -> BoxFuture<'a, Result<Delta>>;
}

/// Adapts a synchronous closure into a node.
pub struct FnNode<F>(pub F);

impl<F> NodeHandler for FnNode<F>
where
    F: Fn(&SessionState) -> Result<Delta> + Send + Sync + 'static,
{
    fn invoke<'a>(
        &'a self,
        _ctx: &'a NodeContext,
        state: StateSnapshot,
    ) -> BoxFuture<'a, Result<Delta>> {
        let result = (self.0)(&state);
        Box::pin(async move { result })
    }
}

/// The closed set of node variants a graph can hold.
pub enum Node {
    Llm(LlmNode),
    Tool(ToolNode),
    Summary(SummaryNode),
    Custom(Arc<dyn NodeHandler>),
}

impl Node {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&SessionState) -> Result<Delta> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(FnNode(f)))
    }

    pub fn custom(handler: impl NodeHandler) -> Self {
        Self::Custom(Arc::new(handler))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Llm(_) => "llm",
            Self::Tool(_) => "tool",
            Self::Summary(_) => "summary",
            Self::Custom(_) => "custom",
        }
    }

    /// Run one step against a snapshot and return the resulting delta.
    pub async fn invoke(&self, ctx: &NodeContext, state: StateSnapshot) -> Result<Delta> {
        match self {
            Self::Llm(node) => node.invoke(ctx, state).await,
            Self::Tool(node) => node.invoke(ctx, state).await,
            Self::Summary(node) => node.invoke(ctx, state).await,
            Self::Custom(handler) => handler.invoke(ctx, state).await,
        }
    }
}

impl From<LlmNode> for Node {
    fn from(node: LlmNode) -> Self {
        Self::Llm(node)
    }
}

impl From<ToolNode> for Node {
    fn from(node: ToolNode) -> Self {
        Self::Tool(node)
    }
}

impl From<SummaryNode> for Node {
    fn from(node: SummaryNode) -> Self {
        Self::Summary(node)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.kind())
    }
}

//! The braid engine: versioned session state, agent graphs, the node
//! variants that run inside them, and the runtime that drives one run per
//! session at a time.

pub mod graph;
pub mod nodes;
pub mod prebuilt;
pub mod runtime;
pub mod session;
pub mod state;
pub mod tokens;

pub use graph::{
    Condition, ExecutorConfig, GraphBuilder, GraphDefinition, GraphExecutor, Node, NodeContext,
    NodeHandler, RunFailure, RunOutcome, RunReport, Target, END,
};
pub use nodes::{LlmNode, SummaryNode, ToolNode, SUMMARY_KEY, TOOL_REQUESTS_KEY};
pub use runtime::{ChatRuntime, RunHandle};
pub use session::{RunGuard, SessionRegistry};
pub use state::{Delta, DeltaOp, StateContainer, StateSnapshot};

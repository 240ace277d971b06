//! Graph Execution Engine.
//!
//! A graph is an arena of named [`Node`]s with index-based routes between
//! them. Each node has at most one outgoing [`Edge`]: a static target or a
//! conditional set of branches with a default. Nodes with no edge are
//! terminal. The [`GraphExecutor`] walks the graph for one session at a
//! time, applying each node's delta to the session's state container and
//! reporting progress on the run's event channel.

pub mod definition;
pub mod edge;
pub mod executor;
pub mod node;

pub use definition::{GraphBuilder, GraphDefinition, Next, NodeIndex, Topology};
pub use edge::{evaluate_condition, Condition, Edge, Target, END};
pub use executor::{terminal_event, ExecutorConfig, GraphExecutor, RunFailure, RunOutcome, RunReport};
pub use node::{FnNode, Node, NodeContext, NodeHandler};

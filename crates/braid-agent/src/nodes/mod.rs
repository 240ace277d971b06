//! Built-in node variants: model calls, tool execution and history compaction.

pub mod llm;
pub mod summary;
pub mod tool;

pub use llm::{extract_tool_markers, LlmNode, TOOL_REQUESTS_KEY};
pub use summary::{SummaryNode, SUMMARY_KEY};
pub use tool::ToolNode;

//! Ready-made graphs: the chat agent and the title generator.

use std::sync::Arc;

use braid_core::config::{AppConfig, ModelConfig};
use braid_core::error::Result;
use braid_core::traits::LlmClient;
use braid_tools::ToolRegistry;

use crate::graph::{Condition, GraphBuilder, GraphDefinition, END};
use crate::nodes::{LlmNode, SummaryNode, ToolNode, TOOL_REQUESTS_KEY};

pub const SUMMARIZE_NODE: &str = "summarize";
pub const LLM_NODE: &str = "llm";
pub const TOOLS_NODE: &str = "tools";
pub const TITLE_NODE: &str = "title";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
     Answer clearly and concisely. Use the available tools for date, time \
     and arithmetic questions instead of guessing.";

const TITLE_PROMPT: &str = "Write a short title, at most eight words, for a \
     conversation that starts with the user's message. Reply with the title \
     only, without quotes.";

/// The standard chat topology:
///
/// ```text
/// summarize -> llm -> (tool_requests exists) -> tools -> llm
///                  \-> END
/// ```
pub fn chat_graph(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
) -> Result<GraphDefinition> {
    let system_prompt = config
        .engine
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let model_node = LlmNode::new(llm.clone(), config.model.clone())
        .with_system_prompt(system_prompt)
        .with_tools(tools.definitions())
        .include_prior_tool_turns(config.engine.include_prior_tool_turns);
    let summary_node = SummaryNode::with_model(config.summary.clone(), llm, config.model.clone());
    let tool_node = ToolNode::new(tools).parallel(config.engine.parallel_tools);

    GraphBuilder::new()
        .node(SUMMARIZE_NODE, summary_node)
        .node(LLM_NODE, model_node)
        .node(TOOLS_NODE, tool_node)
        .edge(SUMMARIZE_NODE, LLM_NODE)
        .conditional(
            LLM_NODE,
            vec![(Condition::scratch_present(TOOL_REQUESTS_KEY), TOOLS_NODE.into())],
            Some(END),
        )
        .edge(TOOLS_NODE, LLM_NODE)
        .entry(SUMMARIZE_NODE)
        .build()
}

/// A single model call that turns a first message into a session title.
pub fn title_graph(model: &ModelConfig, llm: Arc<dyn LlmClient>) -> Result<GraphDefinition> {
    GraphBuilder::new()
        .node(
            TITLE_NODE,
            LlmNode::new(llm, model.clone()).with_system_prompt(TITLE_PROMPT),
        )
        .entry(TITLE_NODE)
        .build()
}

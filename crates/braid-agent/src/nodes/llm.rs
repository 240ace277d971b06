use std::sync::{Arc, LazyLock};

use futures::StreamExt;
use regex::Regex;
use tracing::{debug, warn};

use braid_core::config::ModelConfig;
use braid_core::error::{BraidError, Result};
use braid_core::traits::LlmClient;
use braid_core::types::*;
use braid_llm::calculate_backoff;

use crate::graph::NodeContext;
use crate::state::{Delta, StateSnapshot};

/// Scratch key holding the tool calls requested by the latest model turn.
pub const TOOL_REQUESTS_KEY: &str = "tool_requests";

const SUMMARY_PREAMBLE: &str = "The earlier conversation was condensed to fit the model context. \
     Treat this summary as known facts rather than repeating it verbatim:\n";

const MARKER_OPEN: &str = "<tool_call>";
const MARKER_CLOSE: &str = "</tool_call>";

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").unwrap());

/// Calls the model with the session's turns and appends its reply.
///
/// Text fragments are streamed as partial output while they arrive. Tool
/// requests, native or written as `<tool_call>{..}</tool_call>` markers,
/// are recorded under [`TOOL_REQUESTS_KEY`] for the tool node.
pub struct LlmNode {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    system_prompt: Option<String>,
    tools: Vec<ToolDefinition>,
    include_prior_tool_turns: bool,
    stream: bool,
}

impl LlmNode {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            llm,
            model,
            system_prompt: None,
            tools: Vec::new(),
            include_prior_tool_turns: false,
            stream: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Send tool traffic from before the latest user turn to the model.
    pub fn include_prior_tool_turns(mut self, include: bool) -> Self {
        self.include_prior_tool_turns = include;
        self
    }

    /// Emit partial output while the reply streams in (on by default).
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// The turn list sent to the model for this state.
    pub fn request_turns(&self, state: &SessionState) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(state.turns.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            turns.push(Turn::system(prompt.clone()));
        }

        let cutoff = if self.include_prior_tool_turns {
            0
        } else {
            state.last_user_index().unwrap_or(0)
        };

        for (i, turn) in state.turns.iter().enumerate() {
            if turn.summary {
                turns.push(Turn::system(format!("{}{}", SUMMARY_PREAMBLE, turn.content)));
                continue;
            }
            if i < cutoff {
                if turn.role == Role::Tool || turn.is_tool_only() {
                    continue;
                }
                if !turn.tool_calls.is_empty() {
                    let mut visible = turn.clone();
                    visible.tool_calls.clear();
                    turns.push(visible);
                    continue;
                }
            }
            turns.push(turn.clone());
        }
        turns
    }

    pub async fn invoke(&self, ctx: &NodeContext, state: StateSnapshot) -> Result<Delta> {
        let request = self.request_turns(&state);
        debug!(node = %ctx.node, turns = request.len(), "Calling model");

        let reply = call_model(
            ctx,
            &*self.llm,
            &self.model,
            request,
            &self.tools,
            self.stream,
        )
        .await?;

        if reply.stop == Some(StopReason::MaxTokens) {
            warn!(node = %ctx.node, model = %self.model.model_id, "Model hit max tokens");
        }

        let (content, mut marker_calls) = extract_tool_markers(&reply.text);
        let mut calls = reply.tool_calls;
        calls.append(&mut marker_calls);

        let mut delta = Delta::against(&state);
        if !calls.is_empty() {
            debug!(node = %ctx.node, count = calls.len(), "Model requested tools");
            delta = delta.set_scratch(TOOL_REQUESTS_KEY, serde_json::to_value(&calls)?);
        } else if state.scratch.contains_key(TOOL_REQUESTS_KEY) {
            delta = delta.remove_scratch(TOOL_REQUESTS_KEY);
        }
        Ok(delta.append_turn(Turn::assistant_with_calls(content.trim(), calls)))
    }
}

/// A complete model reply.
#[derive(Debug, Default)]
pub(crate) struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop: Option<StopReason>,
}

/// Call the model, retrying transient failures with backoff as long as no
/// partial output has reached the caller yet.
pub(crate) async fn call_model(
    ctx: &NodeContext,
    llm: &dyn LlmClient,
    model: &ModelConfig,
    turns: Vec<Turn>,
    tools: &[ToolDefinition],
    stream_partials: bool,
) -> Result<ModelReply> {
    let retry = &model.retry;
    let mut attempt = 0u32;

    loop {
        let mut emitted = false;
        let result = tokio::select! {
            r = stream_once(ctx, llm, model, turns.clone(), tools, stream_partials, &mut emitted) => r,
            _ = ctx.cancel_token().cancelled() => Err(BraidError::Cancelled),
        };

        match result {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_transient() && !emitted && attempt < retry.max_retries => {
                let delay = calculate_backoff(attempt, retry);
                attempt += 1;
                warn!(
                    node = %ctx.node,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient model error, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel_token().cancelled() => return Err(BraidError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Default)]
struct CallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

async fn stream_once(
    ctx: &NodeContext,
    llm: &dyn LlmClient,
    model: &ModelConfig,
    turns: Vec<Turn>,
    tools: &[ToolDefinition],
    stream_partials: bool,
    emitted: &mut bool,
) -> Result<ModelReply> {
    let mut stream = llm.chat_stream(model, turns, tools).await?;

    let mut reply = ModelReply::default();
    let mut calls: Vec<CallAccumulator> = Vec::new();
    let mut filter = MarkerFilter::default();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(text) => {
                if stream_partials {
                    let visible = filter.feed(&text);
                    if !visible.is_empty() {
                        *emitted = true;
                        ctx.emit_partial(visible).await;
                    }
                }
                reply.text.push_str(&text);
            }
            StreamDelta::ThinkingDelta(_) => {}
            StreamDelta::ToolUseStart { index, id, name } => {
                while calls.len() <= index {
                    calls.push(CallAccumulator::default());
                }
                calls[index].id = id;
                calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(call) = calls.get_mut(index) {
                    call.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(reason) => reply.stop = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                debug!(node = %ctx.node, input_tokens, output_tokens, "Model usage");
            }
        }
    }

    if stream_partials {
        let rest = filter.finish();
        if !rest.is_empty() {
            *emitted = true;
            ctx.emit_partial(rest).await;
        }
    }

    reply.tool_calls = calls
        .into_iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| ToolCall {
            id: if c.id.is_empty() { new_call_id() } else { c.id },
            arguments: parse_arguments(&c.input_json),
            name: c.name,
        })
        .collect();
    Ok(reply)
}

fn new_call_id() -> String {
    format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

/// Pull `<tool_call>{"name": .., "arguments": ..}</tool_call>` markers out of
/// model text. Markers that do not parse are left in place.
pub fn extract_tool_markers(text: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    let mut content = String::with_capacity(text.len());
    let mut last = 0;

    for caps in MARKER.captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        match parse_marker(body.as_str()) {
            Some(call) => {
                content.push_str(&text[last..whole.start()]);
                last = whole.end();
                calls.push(call);
            }
            None => warn!(marker = body.as_str(), "Ignoring malformed tool_call marker"),
        }
    }
    content.push_str(&text[last..]);
    (content, calls)
}

fn parse_marker(body: &str) -> Option<ToolCall> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = match value.get("arguments").or_else(|| value.get("parameters")) {
        // Some models double-encode the arguments
        Some(serde_json::Value::String(raw)) => parse_arguments(raw),
        Some(args) => args.clone(),
        None => serde_json::json!({}),
    };
    Some(ToolCall {
        id: new_call_id(),
        name,
        arguments,
    })
}

/// Withholds `<tool_call>` markers from streamed partial output, including
/// markers split across fragments.
#[derive(Default)]
struct MarkerFilter {
    pending: String,
    inside: bool,
}

impl MarkerFilter {
    fn feed(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut out = String::new();
        loop {
            let tag = if self.inside { MARKER_CLOSE } else { MARKER_OPEN };
            if let Some(pos) = self.pending.find(tag) {
                if !self.inside {
                    out.push_str(&self.pending[..pos]);
                }
                self.pending.drain(..pos + tag.len());
                self.inside = !self.inside;
                continue;
            }
            let cut = self.pending.len() - partial_suffix(&self.pending, tag);
            if !self.inside {
                out.push_str(&self.pending[..cut]);
            }
            self.pending.drain(..cut);
            return out;
        }
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if self.inside {
            String::new()
        } else {
            rest
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| text.ends_with(&tag[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeltaOp, StateContainer};
    use braid_core::config::RetryConfig;
    use braid_core::event::{event_channel, EventStream, RunEvent};
    use braid_test_utils::{Scripted, ScriptedLlm};
    use tokio_util::sync::CancellationToken;

    fn model() -> ModelConfig {
        let mut model = ModelConfig::new("test-model");
        model.retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        };
        model
    }

    fn ctx() -> (NodeContext, EventStream) {
        let (tx, rx) = event_channel(64);
        (
            NodeContext::new(SessionId::from_string("s"), "llm", 0, tx, CancellationToken::new()),
            rx,
        )
    }

    fn user_state(text: &str) -> StateSnapshot {
        Arc::new(SessionState {
            turns: vec![Turn::user(text)],
            ..Default::default()
        })
    }

    async fn partials(ctx: NodeContext, mut rx: EventStream) -> Vec<String> {
        drop(ctx);
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            if let RunEvent::PartialOutput { text, .. } = event {
                out.push(text);
            }
        }
        out
    }

    fn appended(delta: &Delta) -> Turn {
        delta
            .ops
            .iter()
            .find_map(|op| match op {
                DeltaOp::AppendTurn(t) => Some(t.clone()),
                _ => None,
            })
            .expect("delta appends a turn")
    }

    #[tokio::test]
    async fn test_streams_partials_and_appends_reply() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::text(["Hel", "lo!"])]));
        let node = LlmNode::new(llm.clone(), model());
        let (ctx, rx) = ctx();

        let delta = node.invoke(&ctx, user_state("hi")).await.unwrap();
        assert_eq!(delta.ops.len(), 1);
        let turn = appended(&delta);
        assert_eq!(turn.content, "Hello!");
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(partials(ctx, rx).await, vec!["Hel", "lo!"]);
    }

    #[tokio::test]
    async fn test_native_tool_call_lands_in_scratch() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::tool_call(
            "add",
            serde_json::json!({"a": 1, "b": 2}),
        )]));
        let node = LlmNode::new(llm, model());
        let (ctx, _rx) = ctx();

        let mut container = StateContainer::new();
        container
            .apply_delta(Delta::new(0).append_turn(Turn::user("1+2?")))
            .unwrap();
        let delta = node.invoke(&ctx, container.snapshot()).await.unwrap();
        container.apply_delta(delta).unwrap();

        let requests: Vec<ToolCall> =
            serde_json::from_value(container.state().scratch[TOOL_REQUESTS_KEY].clone()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "add");
        assert_eq!(requests[0].arguments["b"], 2);
        assert!(container.state().last_turn().unwrap().is_tool_only());
    }

    #[tokio::test]
    async fn test_textual_markers_are_parsed_and_hidden() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::text([
            "Let me check. <tool_",
            "call>{\"name\": \"now_utc\", \"arguments\": {}}</tool_call>",
        ])]));
        let node = LlmNode::new(llm, model());
        let (ctx, rx) = ctx();

        let delta = node.invoke(&ctx, user_state("time?")).await.unwrap();
        let scratch_set = delta
            .ops
            .iter()
            .any(|op| matches!(op, DeltaOp::SetScratch { key, .. } if key == TOOL_REQUESTS_KEY));
        assert!(scratch_set);
        let turn = appended(&delta);
        assert_eq!(turn.content, "Let me check.");
        assert_eq!(turn.tool_calls[0].name, "now_utc");
        assert_eq!(partials(ctx, rx).await.concat(), "Let me check. ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Scripted::transient("503"),
            Scripted::transient("429"),
            Scripted::text(["ok"]),
        ]));
        let node = LlmNode::new(llm.clone(), model());
        let (ctx, _rx) = ctx();

        node.invoke(&ctx, user_state("hi")).await.unwrap();
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_transient() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Scripted::transient("503"),
            Scripted::transient("503"),
            Scripted::transient("503"),
            Scripted::text(["never"]),
        ]));
        let node = LlmNode::new(llm.clone(), model());
        let (ctx, _rx) = ctx();

        let err = node.invoke(&ctx, user_state("hi")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_after_partial_output() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Scripted::BreakAfter(vec!["half an ans".into()]),
            Scripted::text(["full answer"]),
        ]));
        let node = LlmNode::new(llm.clone(), model());
        let (ctx, _rx) = ctx();

        let err = node.invoke(&ctx, user_state("hi")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::fatal("401")]));
        let node = LlmNode::new(llm.clone(), model());
        let (ctx, _rx) = ctx();

        let err = node.invoke(&ctx, user_state("hi")).await.unwrap_err();
        assert!(matches!(err, BraidError::LlmFatal(_)));
        assert_eq!(llm.calls(), 1);
    }

    #[test]
    fn test_prior_tool_traffic_is_filtered() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let call = ToolCall {
            id: "c1".into(),
            name: "add".into(),
            arguments: serde_json::json!({"a": 1, "b": 2}),
        };
        let state = SessionState {
            turns: vec![
                Turn::summary("user likes maths"),
                Turn::user("1+2?"),
                Turn::assistant_with_calls("", vec![call.clone()]),
                Turn::tool_result("c1", "add", "3", false),
                Turn::assistant_with_calls("Checking", vec![call.clone()]),
                Turn::tool_result("c1", "add", "3", false),
                Turn::assistant("It is 3."),
                Turn::user("and 2+2?"),
                Turn::assistant_with_calls("", vec![call]),
                Turn::tool_result("c1", "add", "4", false),
            ],
            ..Default::default()
        };

        let node = LlmNode::new(llm.clone(), model()).with_system_prompt("be brief");
        let turns = node.request_turns(&state);
        let roles: Vec<_> = turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::Tool
            ]
        );
        assert!(turns[1].content.contains("user likes maths"));
        assert!(turns[3].tool_calls.is_empty());
        assert_eq!(turns[3].content, "Checking");

        let unfiltered = LlmNode::new(llm, model())
            .include_prior_tool_turns(true)
            .request_turns(&state);
        assert_eq!(unfiltered.len(), state.turns.len() + 1);
    }

    #[test]
    fn test_marker_filter_handles_split_tags() {
        let mut filter = MarkerFilter::default();
        let mut out = String::new();
        for chunk in ["a <to", "ol_call>{\"x\":", "1}</tool", "_call> b <", "c"] {
            out.push_str(&filter.feed(chunk));
        }
        out.push_str(&filter.finish());
        assert_eq!(out, "a  b <c");
    }

    #[test]
    fn test_malformed_marker_is_kept() {
        let (content, calls) = extract_tool_markers("x <tool_call>not json</tool_call>");
        assert!(calls.is_empty());
        assert_eq!(content, "x <tool_call>not json</tool_call>");

        let (content, calls) = extract_tool_markers(
            "<tool_call>{\"name\": \"add\", \"arguments\": \"{\\\"a\\\": 1}\"}</tool_call>",
        );
        assert_eq!(content, "");
        assert_eq!(calls[0].arguments["a"], 1);
    }
}

//! Test doubles shared across the workspace: a scripted model client,
//! a handful of tools with fixed behaviour, and state fixtures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use braid_core::config::ModelConfig;
use braid_core::error::{BraidError, Result};
use braid_core::traits::{LlmClient, Tool};
use braid_core::types::*;

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Stream these text fragments, then stop.
    Text(Vec<String>),
    /// Request a native tool call, optionally with some leading text.
    ToolCall {
        text: String,
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Fail to open the stream with a retryable error.
    Transient(String),
    /// Fail to open the stream with a non-retryable error.
    Fatal(String),
    /// Stream these fragments, then break with a transient error.
    BreakAfter(Vec<String>),
    /// Never answer.
    Hang,
    /// Answer with the given text after a delay.
    Delayed(Duration, String),
}

impl Scripted {
    pub fn text<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Text(fragments.into_iter().map(Into::into).collect())
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::ToolCall {
            text: String::new(),
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments,
        }
    }

    pub fn transient(msg: &str) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn fatal(msg: &str) -> Self {
        Self::Fatal(msg.to_string())
    }
}

/// An `LlmClient` that replays a script, one entry per call.
///
/// Once the script runs out every call answers with "done".
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of `chat_stream` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Turn lists sent on each call, in order.
    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.requests.lock().unwrap().clone()
    }

    fn next_entry(&self) -> Scripted {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::text(["done"]))
    }
}

fn finish(mut deltas: Vec<Result<StreamDelta>>, reason: StopReason) -> Vec<Result<StreamDelta>> {
    deltas.push(Ok(StreamDelta::Stop(reason)));
    deltas
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        turns: Vec<Turn>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(turns);
        let entry = self.next_entry();

        Box::pin(async move {
            let deltas: Vec<Result<StreamDelta>> = match entry {
                Scripted::Text(fragments) => finish(
                    fragments
                        .into_iter()
                        .map(|f| Ok(StreamDelta::TextDelta(f)))
                        .collect(),
                    StopReason::EndTurn,
                ),
                Scripted::ToolCall {
                    text,
                    id,
                    name,
                    arguments,
                } => {
                    let mut deltas = Vec::new();
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(text)));
                    }
                    deltas.push(Ok(StreamDelta::ToolUseStart { index: 0, id, name }));
                    deltas.push(Ok(StreamDelta::ToolInputDelta {
                        index: 0,
                        delta: arguments.to_string(),
                    }));
                    finish(deltas, StopReason::ToolUse)
                }
                Scripted::Transient(msg) => return Err(BraidError::LlmTransient(msg)),
                Scripted::Fatal(msg) => return Err(BraidError::LlmFatal(msg)),
                Scripted::BreakAfter(fragments) => {
                    let mut deltas: Vec<Result<StreamDelta>> = fragments
                        .into_iter()
                        .map(|f| Ok(StreamDelta::TextDelta(f)))
                        .collect();
                    deltas.push(Err(BraidError::LlmTransient("connection reset".into())));
                    deltas
                }
                Scripted::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Scripted::Delayed(delay, text) => {
                    tokio::time::sleep(delay).await;
                    finish(vec![Ok(StreamDelta::TextDelta(text))], StopReason::EndTurn)
                }
            };
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// Echoes its `text` argument back.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the text argument."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let text = input
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BraidError::ToolValidation("missing 'text'".into()))?;
            Ok(ToolResult::success(text))
        })
    }
}

/// Always fails with a recoverable error.
pub struct BrokenTool;

impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "Always fails."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async {
            Err(BraidError::ToolExecution {
                tool: "broken".into(),
                message: "disk on fire".into(),
            })
        })
    }
}

/// Always fails fatally.
pub struct FatalTool;

impl Tool for FatalTool {
    fn name(&self) -> &str {
        "fatal"
    }
    fn description(&self) -> &str {
        "Always aborts the run."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async {
            Err(BraidError::ToolFatal {
                tool: "fatal".into(),
                message: "credentials revoked".into(),
            })
        })
    }
}

/// A state holding `n` alternating user/assistant turns.
pub fn state_with_turns(n: usize) -> SessionState {
    let turns = (0..n)
        .map(|i| {
            if i % 2 == 0 {
                Turn::user(format!("question {}", i / 2))
            } else {
                Turn::assistant(format!("answer {}", i / 2))
            }
        })
        .collect();
    SessionState {
        turns,
        ..Default::default()
    }
}

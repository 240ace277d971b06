use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use braid_core::config::ModelConfig;
use braid_core::error::{BraidError, Result};
use braid_core::traits::LlmClient;
use braid_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, SiliconFlow, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiToolCall {
    #[serde(default)]
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<OaiFunction>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

impl OaiMessage {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Map turns onto chat-completions messages. Summary turns are already
/// system turns; tool results keep the id of the call they answer.
pub(crate) fn convert_turns(turns: Vec<Turn>) -> Vec<OaiMessage> {
    turns
        .into_iter()
        .map(|turn| match turn.role {
            Role::Assistant if !turn.tool_calls.is_empty() => {
                let calls = turn
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(index, call)| OaiToolCall {
                        index,
                        id: Some(call.id.clone()),
                        r#type: Some("function".to_string()),
                        function: Some(OaiFunction {
                            name: Some(call.name.clone()),
                            arguments: Some(call.arguments.to_string()),
                        }),
                    })
                    .collect();
                OaiMessage {
                    role: Role::Assistant.as_str().to_string(),
                    content: Some(turn.content).filter(|c| !c.is_empty()),
                    tool_calls: Some(calls),
                    tool_call_id: None,
                }
            }
            Role::Tool => OaiMessage {
                tool_call_id: turn.tool_call_id,
                ..OaiMessage::plain(Role::Tool, turn.content)
            },
            role => OaiMessage::plain(role, turn.content),
        })
        .collect()
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let parsed: std::result::Result<StreamChunk, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(chunk) => {
            let mut deltas = Vec::new();

            if let Some(usage) = chunk.usage {
                deltas.push(Ok(StreamDelta::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }));
            }

            let choice = match chunk.choices.into_iter().next() {
                Some(c) => c,
                None => return deltas,
            };

            if let Some(delta) = choice.delta {
                if let Some(text) = delta.reasoning_content {
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::ThinkingDelta(text)));
                    }
                }
                if let Some(text) = delta.content {
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(text)));
                    }
                }
                // Some providers send name + arguments in the same chunk
                if let Some(tool_calls) = delta.tool_calls {
                    for tc in tool_calls {
                        if let Some(func) = tc.function {
                            if let Some(name) = func.name {
                                deltas.push(Ok(StreamDelta::ToolUseStart {
                                    index: tc.index,
                                    id: tc.id.unwrap_or_default(),
                                    name,
                                }));
                            }
                            if let Some(args) = func.arguments {
                                deltas.push(Ok(StreamDelta::ToolInputDelta {
                                    index: tc.index,
                                    delta: args,
                                }));
                            }
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                let stop = match reason.as_str() {
                    "tool_calls" => StopReason::ToolUse,
                    "length" => StopReason::MaxTokens,
                    _ => StopReason::EndTurn,
                };
                deltas.push(Ok(StreamDelta::Stop(stop)));
            }

            deltas
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            vec![]
        }
    }
}

/// Map an HTTP failure onto the transient/fatal split.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> BraidError {
    let msg = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        BraidError::LlmTransient(msg)
    } else {
        BraidError::LlmFatal(msg)
    }
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        turns: Vec<Turn>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let url = match config.base_url.as_deref() {
                Some(base) if base.ends_with("/chat/completions") => base.to_string(),
                Some(base) => format!("{}/chat/completions", base.trim_end_matches('/')),
                None => OPENAI_API_URL.to_string(),
            };

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_turns(turns),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                stream: true,
                tools: convert_tools(&tools),
            };

            let mut req = self.http.post(&url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            // Connection-level failures are worth retrying
            let response = req
                .send()
                .await
                .map_err(|e| BraidError::LlmTransient(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(classify_status(status, &body));
            }

            let sse_stream = SseStream::new(response.bytes_stream());

            let delta_stream = sse_stream
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_chunk() {
        let deltas = parse_chunk(sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "Hel"));
    }

    #[test]
    fn test_parse_reasoning_and_finish() {
        let deltas = parse_chunk(sse(
            r#"{"choices":[{"delta":{"reasoning_content":"hmm"},"finish_reason":"stop"}]}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[0], Ok(StreamDelta::ThinkingDelta(_))));
        assert!(matches!(&deltas[1], Ok(StreamDelta::Stop(StopReason::EndTurn))));
    }

    #[test]
    fn test_parse_tool_call_chunk() {
        let deltas = parse_chunk(sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add","arguments":"{\"a\":1"}}]}}]}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert!(
            matches!(&deltas[0], Ok(StreamDelta::ToolUseStart { index: 0, id, name }) if id == "call_1" && name == "add")
        );
        assert!(matches!(&deltas[1], Ok(StreamDelta::ToolInputDelta { index: 0, .. })));
    }

    #[test]
    fn test_parse_done_and_garbage() {
        assert!(parse_chunk(sse("[DONE]")).is_empty());
        assert!(parse_chunk(sse("not json")).is_empty());
    }

    #[test]
    fn test_convert_turns_tool_roundtrip() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "now_utc".into(),
            arguments: serde_json::json!({}),
        };
        let turns = vec![
            Turn::summary("earlier: greeting"),
            Turn::user("what time is it?"),
            Turn::assistant_with_calls("", vec![call]),
            Turn::tool_result("call_1", "now_utc", "2025-01-01T00:00:00Z", false),
        ];
        let msgs = convert_turns(turns);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[2].role, "assistant");
        assert!(msgs[2].content.is_none());
        assert_eq!(msgs[2].tool_calls.as_ref().map(|c| c.len()), Some(1));
        assert_eq!(msgs[3].role, "tool");
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key").is_transient());
    }
}

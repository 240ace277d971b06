use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM client — streaming model invocation.
///
/// A provider that only returns whole responses yields a single `TextDelta`
/// followed by `Stop`. Errors are classified as `LlmTransient` (retryable)
/// or `LlmFatal`.
pub trait LlmClient: Send + Sync + 'static {
    /// Send the turn history and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        turns: Vec<Turn>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Tool — extensible tool execution.
///
/// `Ok(ToolResult::error(..))` and recoverable `Err`s are surfaced to the
/// model as a tool turn; `Err(BraidError::ToolFatal { .. })` aborts the run.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Session store — persistence backend for session state and the session catalog.
pub trait SessionStore: Send + Sync + 'static {
    /// Persist the full state of a session, replacing any previous copy.
    fn save_state(&self, sid: &SessionId, state: &SessionState) -> BoxFuture<'_, Result<()>>;

    /// Load the persisted state of a session.
    fn load_state(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionState>>>;

    /// Insert or replace a catalog record.
    fn upsert_record(&self, record: &SessionRecord) -> BoxFuture<'_, Result<()>>;

    /// Fetch one catalog record.
    fn get_record(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>>;

    /// List catalog records, most recently updated first.
    fn list_records(&self) -> BoxFuture<'_, Result<Vec<SessionRecord>>>;

    /// Remove a session's state and catalog record. Returns whether anything existed.
    fn delete(&self, sid: &SessionId) -> BoxFuture<'_, Result<bool>>;
}

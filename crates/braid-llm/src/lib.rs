pub mod providers;
pub mod retry;
pub mod streaming;

use braid_core::config::ModelConfig;
use braid_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::{calculate_backoff, FallbackClient};

/// Create an LLM client based on the provider name.
///
/// Every supported provider speaks the OpenAI chat-completions protocol
/// (OpenAI, SiliconFlow, vLLM, Ollama, Groq, OpenRouter, ...).
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    tracing::debug!(provider = %config.provider, model = %config.model_id, "Creating LLM client");
    Box::new(OpenAiClient::new())
}

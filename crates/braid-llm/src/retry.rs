use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use braid_core::config::{ModelConfig, RetryConfig};
use braid_core::error::{BraidError, Result};
use braid_core::traits::LlmClient;
use braid_core::types::*;

/// Exponential backoff for the given (zero-based) retry attempt, with 0.8x-1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// An LLM client that falls back to alternative models when the primary
/// cannot open a stream. Retrying a single model is the caller's concern
/// (the LLM-call node owns its retry bound), so each client is tried once.
pub struct FallbackClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
}

impl FallbackClient {
    pub fn new(primary: Box<dyn LlmClient>, fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>) -> Self {
        Self { primary, fallbacks }
    }
}

impl LlmClient for FallbackClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        turns: Vec<Turn>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let primary_err = match self.primary.chat_stream(&config, turns.clone(), &tools).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            if !self.fallbacks.is_empty() {
                info!(error = %primary_err, "Primary LLM failed, trying fallback models");
            }

            // The run fails as transient if any model failed transiently
            let mut saw_transient = primary_err.is_transient();
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client.chat_stream(fb_config, turns.clone(), &tools).await {
                    Ok(stream) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(model = %fb_config.model_id, error = %e, "Fallback model also failed");
                        saw_transient |= e.is_transient();
                    }
                }
            }

            if saw_transient && !primary_err.is_transient() {
                return Err(BraidError::LlmTransient(primary_err.to_string()));
            }
            Err(primary_err)
        })
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};

/// Top-level braid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Execution engine limits and chat graph behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on node invocations per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-step deadline. 0 disables it.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Bound of each run's event buffer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
    /// Send tool traffic from earlier user turns back to the model.
    #[serde(default)]
    pub include_prior_tool_turns: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_secs: default_step_timeout(),
            event_buffer: default_event_buffer(),
            system_prompt: None,
            parallel_tools: default_parallel_tools(),
            include_prior_tool_turns: false,
        }
    }
}

fn default_max_steps() -> usize { 25 }
fn default_step_timeout() -> u64 { 120 }
fn default_event_buffer() -> usize { 64 }
fn default_parallel_tools() -> bool { true }

/// How the summary node condenses old turns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStrategy {
    /// Ask the model for a summary.
    #[default]
    Model,
    /// Concatenate truncated turns locally.
    Heuristic,
}

/// Summarization (history compaction) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_summary_enabled")]
    pub enabled: bool,
    /// Compact when the session holds more turns than this.
    #[serde(default = "default_summary_max_turns")]
    pub max_turns: usize,
    /// Number of most recent turns kept verbatim.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Also compact when the estimated token count exceeds this (0 = off).
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default)]
    pub strategy: SummaryStrategy,
    /// Per-turn truncation used by the heuristic strategy.
    #[serde(default = "default_max_chars_per_turn")]
    pub max_chars_per_turn: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: default_summary_enabled(),
            max_turns: default_summary_max_turns(),
            keep_recent: default_keep_recent(),
            max_context_tokens: default_max_context_tokens(),
            strategy: SummaryStrategy::default(),
            max_chars_per_turn: default_max_chars_per_turn(),
        }
    }
}

fn default_summary_enabled() -> bool { true }
fn default_summary_max_turns() -> usize { 40 }
fn default_keep_recent() -> usize { 2 }
fn default_max_context_tokens() -> usize { 128_000 }
fn default_max_chars_per_turn() -> usize { 400 }

/// Storage backend for session state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Drop idle, non-running sessions from memory after this many seconds.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::default(),
            db_path: default_db_path(),
            idle_ttl_secs: None,
        }
    }
}

fn default_db_path() -> String { "~/.braid/sessions.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String { "127.0.0.1:8000".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BraidError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| BraidError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config from environment variables, for running without a file.
    pub fn from_env() -> Result<Self> {
        let model_id = std::env::var("BRAID_MODEL")
            .map_err(|_| BraidError::Config("BRAID_MODEL is not set".into()))?;
        let mut model = ModelConfig::new(model_id);
        model.base_url = std::env::var("BRAID_BASE_URL").ok();
        model.api_key = std::env::var("BRAID_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        Ok(Self::with_model(model))
    }

    /// Defaults everywhere except the model.
    pub fn with_model(model: ModelConfig) -> Self {
        Self {
            model,
            fallback_models: vec![],
            engine: EngineConfig::default(),
            summary: SummaryConfig::default(),
            sessions: SessionsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_steps == 0 {
            return Err(BraidError::Config("engine.max_steps must be at least 1".into()));
        }
        if self.summary.enabled && self.summary.keep_recent >= self.summary.max_turns {
            return Err(BraidError::Config(
                "summary.keep_recent must be smaller than summary.max_turns".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the SQLite database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.sessions.db_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Leave the reference untouched if the var is unset
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

use std::io::Write;

use braid_core::config::{AppConfig, StorageKind, SummaryStrategy};
use braid_core::error::BraidError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "siliconflow"
model_id = "Qwen/Qwen3-8B"
api_key = "sk-test-key"
base_url = "https://api.siliconflow.cn/v1/chat/completions"
max_tokens = 2048
temperature = 0.5

[model.retry]
max_retries = 5
initial_backoff_ms = 200
max_backoff_ms = 5000

[[fallback_models]]
model_id = "Qwen/Qwen2.5-7B-Instruct"

[engine]
max_steps = 12
step_timeout_secs = 30
event_buffer = 128
system_prompt = "You are terse."
parallel_tools = false
include_prior_tool_turns = true

[summary]
enabled = true
max_turns = 10
keep_recent = 4
max_context_tokens = 8000
strategy = "heuristic"
max_chars_per_turn = 200

[sessions]
storage = "memory"
db_path = "/tmp/braid-test/sessions.db"
idle_ttl_secs = 600

[gateway]
bind = "0.0.0.0:9999"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "siliconflow");
    assert_eq!(config.model.model_id, "Qwen/Qwen3-8B");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);
    assert_eq!(config.model.retry.max_retries, 5);
    assert_eq!(config.model.retry.max_backoff_ms, 5000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "openai");

    assert_eq!(config.engine.max_steps, 12);
    assert_eq!(config.engine.step_timeout_secs, 30);
    assert_eq!(config.engine.system_prompt.as_deref(), Some("You are terse."));
    assert!(!config.engine.parallel_tools);
    assert!(config.engine.include_prior_tool_turns);

    assert_eq!(config.summary.max_turns, 10);
    assert_eq!(config.summary.keep_recent, 4);
    assert_eq!(config.summary.strategy, SummaryStrategy::Heuristic);

    assert_eq!(config.sessions.storage, StorageKind::Memory);
    assert_eq!(config.sessions.idle_ttl_secs, Some(600));
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("BRAID_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "gpt-4o"
api_key = "${BRAID_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("BRAID_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[model]\nmodel_id = \"llama3.2\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert!(config.fallback_models.is_empty());
    assert_eq!(config.engine.max_steps, 25);
    assert!(config.engine.parallel_tools);
    assert_eq!(config.summary.max_turns, 40);
    assert_eq!(config.summary.keep_recent, 2);
    assert_eq!(config.sessions.storage, StorageKind::Sqlite);
    assert_eq!(config.gateway.bind, "127.0.0.1:8000");
}

#[test]
fn test_effective_config_round_trips_through_toml() {
    let config = AppConfig::parse("[model]\nmodel_id = \"m\"\n").expect("parse");
    let printed = toml::to_string_pretty(&config).expect("serialize");
    let reparsed = AppConfig::parse(&printed).expect("reparse");
    assert_eq!(reparsed.model.model_id, "m");
    assert_eq!(reparsed.summary.strategy, config.summary.strategy);
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("braid.toml")).unwrap_err();
    assert!(matches!(err, BraidError::ConfigNotFound(_)));
}

#[test]
fn test_missing_model_section_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_steps = 3\n").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, BraidError::Config(_)));
}

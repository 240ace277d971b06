use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use braid_agent::{prebuilt, ChatRuntime};
use braid_core::config::AppConfig;
use braid_core::event::RunEvent;
use braid_core::traits::LlmClient;
use braid_core::types::SessionId;
use braid_gateway::GatewayServer;
use braid_llm::FallbackClient;
use braid_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "braid", version, about = "Agent-graph chat server")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "braid.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the bind address from the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one chat turn and print the reply as it streams
    Run {
        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
        /// The message to send (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Show the effective configuration
    Config,
    /// Print the chat graph topology as JSON
    Graph,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("braid=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "braid", &mut io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            let tools = Arc::new(ToolRegistry::with_builtins());
            let graph = prebuilt::chat_graph(&config, build_llm(&config), tools)?;
            println!("{}", serde_json::to_string_pretty(&graph.topology())?);
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            let runtime = Arc::new(build_runtime(&config)?);
            let idle_ttl = config.sessions.idle_ttl_secs.map(Duration::from_secs);
            let server = GatewayServer::new(config.gateway.clone(), runtime).with_idle_ttl(idle_ttl);

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    signal.cancel();
                }
            });
            server.run(shutdown).await?;
        }
        Commands::Run { session, message } => {
            let mut text = message.join(" ");
            if text.trim().is_empty() {
                io::stdin().read_to_string(&mut text)?;
            }
            let runtime = Arc::new(build_runtime(&config)?);
            run_once(runtime, session.map(|s| SessionId::from_string(&s)), &text).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Explicit path, then `~/.braid/config.toml`, then the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".braid").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    eprintln!("Warning: No config file found. Set BRAID_MODEL or create braid.toml");
    Ok(AppConfig::from_env()?)
}

/// Primary model client, wrapped in a fallback chain when fallbacks are configured.
fn build_llm(config: &AppConfig) -> Arc<dyn LlmClient> {
    let primary = braid_llm::create_client(&config.model);
    if config.fallback_models.is_empty() {
        return Arc::from(primary);
    }
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|mc| (mc.clone(), braid_llm::create_client(mc)))
        .collect();
    Arc::new(FallbackClient::new(primary, fallbacks))
}

fn build_runtime(config: &AppConfig) -> anyhow::Result<ChatRuntime> {
    let store = braid_memory::open_store(config)?;
    let tools = Arc::new(ToolRegistry::with_builtins());
    info!(
        model = %config.model.model_id,
        tools = tools.len(),
        storage = ?config.sessions.storage,
        "Runtime initialized"
    );
    Ok(ChatRuntime::from_config(config, build_llm(config), tools, store)?)
}

async fn run_once(
    runtime: Arc<ChatRuntime>,
    session_id: Option<SessionId>,
    message: &str,
) -> anyhow::Result<()> {
    let mut handle = runtime.submit(session_id, message).await?;
    let session_id = handle.session_id.clone();

    // Ctrl-C cancels the run; the partial state is discarded
    let ctrl_c_runtime = runtime.clone();
    let ctrl_c_session = session_id.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_runtime.cancel(&ctrl_c_session);
        }
    });

    let mut failure = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            RunEvent::PartialOutput { text, .. } => {
                print!("{}", text);
                io::stdout().flush().ok();
            }
            RunEvent::StepStarted { node, .. } if node == prebuilt::TOOLS_NODE => {
                eprintln!("[{}]", node);
            }
            RunEvent::RunCompleted { .. } => {
                println!();
                break;
            }
            RunEvent::RunFailed { kind, node, message } => {
                println!();
                failure = Some(match node {
                    Some(node) => format!("{:?} at {}: {}", kind, node, message),
                    None => format!("{:?}: {}", kind, message),
                });
                break;
            }
            _ => {}
        }
    }
    watcher.abort();

    let report = handle.wait().await?;
    eprintln!("session: {} ({} steps)", session_id, report.steps());
    if let Some(failure) = failure {
        warn!(session_id = %session_id, "Run failed");
        anyhow::bail!(failure);
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

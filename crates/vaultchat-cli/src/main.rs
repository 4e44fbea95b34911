//! Vaultchat CLI - chat with an agent about a notes vault
//!
//! Drives the active session controller from vaultchat-core: one turn per
//! invocation, streamed to the terminal, with prompts answered
//! interactively.

mod prompts;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use vaultchat_core::config::{ConfigManager, GeneralConfig};
use vaultchat_core::session::{
    ActiveSessionController, ControllerConfig, EventReceiver, FileSessionStore, PendingPrompt,
    ProcessTurnClient, PromptResponse, SendMessageRequest, SendOutcome, SessionEvent,
    SessionStore,
};

#[derive(Parser)]
#[command(name = "vaultchat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chat with an agent about a notes vault", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one chat turn against a vault
    Chat {
        /// Vault directory
        #[arg(long, default_value = ".")]
        vault: PathBuf,

        /// Vault identifier (defaults to the vault directory name)
        #[arg(long)]
        vault_id: Option<String>,

        /// Resume a stored session
        #[arg(long)]
        resume: Option<String>,

        /// Allow every tool call without asking (use with caution!)
        #[arg(long)]
        auto_approve: bool,

        /// The message to send
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },

    /// List stored sessions
    Sessions {
        /// Only sessions of this vault
        #[arg(long)]
        vault_id: Option<String>,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(cli.verbose, &config_manager.config().general)?;

    match cli.command {
        Commands::Chat {
            vault,
            vault_id,
            resume,
            auto_approve,
            prompt,
        } => {
            let vault = absolute_vault_path(&vault)?;
            let vault_id = vault_id.unwrap_or_else(|| default_vault_id(&vault));
            let mut request = SendMessageRequest::new(vault_id, vault, prompt.join(" "));
            if let Some(session_id) = resume {
                request = request.resume(session_id);
            }
            run_chat(&config_manager, request, auto_approve).await?
        }
        Commands::Sessions { vault_id } => list_sessions(&config_manager, vault_id.as_deref()).await?,
        Commands::Config => show_config(&config_manager)?,
    }

    Ok(())
}

/// Install the tracing subscriber
///
/// Logs go to stderr at `log_level` (or debug with `--verbose`) and, when
/// `log_dir` is set, to a daily rolling file as well.
fn init_logging(verbose: bool, general: &GeneralConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let directives = if verbose {
        "info,vaultchat_core=debug".to_string()
    } else {
        general.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&directives))?;

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &general.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vaultchat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

fn absolute_vault_path(vault: &Path) -> anyhow::Result<PathBuf> {
    // Use dunce::canonicalize to avoid UNC path prefix on Windows (\\?\)
    match dunce::canonicalize(vault) {
        Ok(path) => Ok(path),
        Err(e) => anyhow::bail!("Vault {} is not accessible: {}", vault.display(), e),
    }
}

fn default_vault_id(vault: &Path) -> String {
    vault
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string())
}

fn build_controller(config_manager: &ConfigManager) -> ActiveSessionController {
    let config = config_manager.config();
    ActiveSessionController::new(
        Arc::new(ProcessTurnClient::from_config(&config.agent)),
        Arc::new(FileSessionStore::new(config.session.resolve_sessions_dir())),
        ControllerConfig::from_config(config),
    )
}

async fn run_chat(
    config_manager: &ConfigManager,
    request: SendMessageRequest,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let controller = build_controller(config_manager);
    let (_subscription, mut events) = controller.subscribe_channel();

    if auto_approve {
        println!("{}", style("Auto-approve mode is ON").yellow());
    }

    match controller.send_message(request).await? {
        SendOutcome::Started { session_id, .. } => {
            println!("{}", style(format!("Session {}", session_id)).dim());
        }
        SendOutcome::Failed { code, message } => {
            anyhow::bail!("{}: {}", code, message);
        }
        SendOutcome::Superseded => {
            anyhow::bail!("The turn was superseded before it started");
        }
    }

    stream_turn(&controller, &mut events, auto_approve).await
}

/// Print events until the turn ends; Ctrl-C interrupts the agent
async fn stream_turn(
    controller: &ActiveSessionController,
    events: &mut EventReceiver,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!();
                println!("{}", style("Interrupting...").yellow());
                controller.abort_processing().await;
                continue;
            }
        };
        let Some(event) = event else {
            anyhow::bail!("Event stream closed unexpectedly");
        };

        match event {
            SessionEvent::ResponseChunk { content, .. } => {
                print!("{}", content);
                std::io::stdout().flush()?;
            }
            SessionEvent::ToolStart { tool_name, .. } => {
                println!();
                println!("  {} {}", style("[Tool:").dim(), style(&tool_name).yellow());
            }
            SessionEvent::ToolEnd { .. } => {
                println!("  {}", style("✓ done").green().dim());
            }
            SessionEvent::PromptPending { prompt } => {
                let response = if auto_approve {
                    PromptResponse::allow()
                } else {
                    ask_user(prompt.clone()).await?
                };
                if !controller.respond_to_prompt(&prompt.id, response) {
                    println!("{}", style("The prompt is no longer pending").red());
                }
            }
            SessionEvent::PromptResponseRejected { prompt_id, .. } => {
                tracing::debug!("Response for prompt {} was rejected", prompt_id);
            }
            SessionEvent::ResponseEnd {
                context_usage,
                duration_ms,
                ..
            } => {
                println!();
                let mut summary = Vec::new();
                if let Some(ms) = duration_ms {
                    summary.push(format!("{:.1}s", ms as f64 / 1000.0));
                }
                if let Some(usage) = context_usage {
                    match usage.percentage {
                        Some(percent) => summary.push(format!(
                            "{} tokens ({:.0}% of context)",
                            usage.used_tokens, percent
                        )),
                        None => summary.push(format!("{} tokens", usage.used_tokens)),
                    }
                }
                if !summary.is_empty() {
                    println!("{}", style(summary.join(" · ")).dim());
                }
                return Ok(());
            }
            SessionEvent::Error { code, message } => {
                println!();
                anyhow::bail!("{}: {}", code, message);
            }
            SessionEvent::SessionCleared => {
                anyhow::bail!("The session was cleared");
            }
            SessionEvent::SessionReady { .. }
            | SessionEvent::ResponseStart { .. }
            | SessionEvent::ToolInput { .. } => {}
        }
    }
}

async fn ask_user(prompt: PendingPrompt) -> anyhow::Result<PromptResponse> {
    tokio::task::spawn_blocking(move || prompts::ask(&prompt)).await?
}

async fn list_sessions(config_manager: &ConfigManager, vault_id: Option<&str>) -> anyhow::Result<()> {
    let store = FileSessionStore::new(config_manager.config().session.resolve_sessions_dir());
    let sessions = match vault_id {
        Some(vault_id) => store.list_for_vault(vault_id).await?,
        None => store.list().await?,
    };

    println!("{}", style("Sessions:").bold());
    println!();
    if sessions.is_empty() {
        println!("  {}", style("No sessions stored").dim());
        return Ok(());
    }

    for session in sessions {
        println!(
            "  {} {} {}",
            style("•").cyan(),
            style(&session.title).bold(),
            style(format!("[{}]", session.vault_id)).dim()
        );
        println!(
            "    {} · {} messages · {} tokens · updated {}",
            session.id,
            session.messages.len(),
            session.cumulative_tokens,
            session
                .updated_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn show_config(config_manager: &ConfigManager) -> anyhow::Result<()> {
    let config = config_manager.config();
    println!("{}", style("Configuration:").bold());
    println!();
    println!("  Config file: {}", style(config_manager.path().display()).green());
    println!(
        "  Sessions dir: {}",
        style(config.session.resolve_sessions_dir().display()).dim()
    );
    println!();
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r2auto_config::{
    apply_env_overrides, find_config_path, load_config, resolve_path, save_config, state_dir,
    Config, ModelConfig, KNOWN_PROVIDERS,
};
use r2auto_core::agent::{AgentLoop, ContextBuilder, LoopSettings, ModelClient, RigModelClient, RunOutcome};
use r2auto_core::{AgentError, CodeRunner, ConversationState, Notice, Presenter, ToolChannel, ToolRouter};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, ollama, openai};
use tokio::sync::mpsc;

mod terminal;

use terminal::TerminalPresenter;

const EXIT_ENGINE_LOST: u8 = 1;
const EXIT_STARTUP: u8 = 2;

#[derive(Parser)]
#[command(name = "r2auto", about = "LLM-driven binary analysis on top of radare2", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging for the agent core
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a binary interactively
    Run {
        /// File to open in radare2
        target: PathBuf,
        /// Initial instruction (defaults to agent.defaultPrompt)
        prompt: Option<String>,
    },
    /// Show resolved configuration
    Status,
    /// Write a starter config file
    Onboard {
        #[arg(long)]
        non_interactive: bool,
    },
}

/// How an interactive session finished.
enum SessionEnd {
    Finished(RunOutcome),
    EngineLost(String),
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Onboard { non_interactive } => run_onboard(cli.config, non_interactive),
        Commands::Status => run_status(&cli.config.unwrap_or_else(find_config_path)),
        Commands::Run { target, prompt } => {
            return run(cli.config, cli.verbose, target, prompt);
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

fn run(config_arg: Option<PathBuf>, verbose: bool, target: PathBuf, prompt: Option<String>) -> ExitCode {
    let config = match prepare(config_arg, verbose, &target) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    #[cfg(unix)]
    let saved_term = terminal::save_terminal_state();

    let goal = prompt.unwrap_or_else(|| config.agent.default_prompt.clone());
    let result = runtime.block_on(run_session(&config, &target, &goal));

    #[cfg(unix)]
    if let Some(ref saved) = saved_term {
        terminal::restore_terminal_state(saved);
    }
    // The input thread may still be parked in readline.
    runtime.shutdown_background();

    match &result {
        Ok(SessionEnd::Finished(outcome)) => tracing::info!("Session ended: {outcome:?}"),
        Ok(SessionEnd::EngineLost(detail)) => eprintln!("Error: radare2 session lost: {detail}"),
        Err(e) => eprintln!("Error: {e:#}"),
    }
    ExitCode::from(exit_status(&result))
}

fn exit_status(result: &Result<SessionEnd>) -> u8 {
    match result {
        Ok(SessionEnd::Finished(_)) => 0,
        Ok(SessionEnd::EngineLost(_)) => EXIT_ENGINE_LOST,
        Err(_) => EXIT_STARTUP,
    }
}

/// Load and validate configuration, set up logging and proxy settings.
///
/// Runs before the async runtime exists so environment changes are not
/// racing other threads.
fn prepare(config_arg: Option<PathBuf>, verbose: bool, target: &Path) -> Result<Config> {
    let config_path = config_arg.unwrap_or_else(find_config_path);
    let mut config = load_config(&config_path)?;
    apply_env_overrides(&mut config);

    init_logging(config.log_file.as_deref(), verbose)?;
    tracing::debug!("Loaded config from {}", config_path.display());

    config.validate()?;

    if let Some(proxy) = config.model.proxy() {
        std::env::set_var("HTTPS_PROXY", proxy);
        std::env::set_var("HTTP_PROXY", proxy);
        tracing::info!("Routing model traffic through proxy {proxy}");
    }

    if !target.is_file() {
        anyhow::bail!("target binary not found: {}", target.display());
    }
    Ok(config)
}

fn init_logging(log_file: Option<&str>, verbose: bool) -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    let core_level = if verbose {
        "debug"
    } else if log_file.is_some() {
        "info"
    } else {
        "warn"
    };
    let filter = format!("{base_filter},r2auto_core={core_level}");
    let builder =
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter));

    match log_file {
        Some(path) => {
            let path = resolve_path(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file '{}'", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn run_session(config: &Config, target: &Path, goal: &str) -> Result<SessionEnd> {
    let model = create_model(&config.model)?;
    let client: Arc<dyn ModelClient> = Arc::new(RigModelClient::new(model, &config.model));

    let preamble = ContextBuilder::new(target)
        .with_inline_actions(config.agent.inline_actions)
        .with_instructions_file(config.agent.instructions_file.as_deref().map(resolve_path))
        .build_system_prompt()?;

    let channel = Arc::new(ToolChannel::spawn_with_config(&config.engine, target).await?);
    let code = CodeRunner::new(&config.code, Some(channel.clone()));
    let router = ToolRouter::new(channel, code, config.agent.max_observation_chars);

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let output = match terminal::spawn_input_thread(input_tx, state_dir().join("history")) {
        Ok(output) => output,
        Err(e) => {
            router.close().await;
            return Err(e);
        }
    };
    let presenter: Arc<dyn Presenter> = Arc::new(TerminalPresenter::new(
        output,
        config.display.max_observation_lines,
    ));

    presenter.on_notice(Notice::SessionStarted {
        target: target.display().to_string(),
        model: client.model_name().to_string(),
    });

    let mut agent = AgentLoop::new(
        client,
        router,
        presenter,
        input_rx,
        preamble,
        LoopSettings::from_config(config),
    );
    let result = agent.run(goal).await;
    let transcript = agent.shutdown().await;

    if config.agent.save_transcripts {
        match save_transcript(&transcript, &config.agent.transcript_dir, target) {
            Ok(path) => tracing::info!("Transcript saved to {}", path.display()),
            Err(e) => tracing::warn!("Failed to save transcript: {e:#}"),
        }
    }

    match result {
        Ok(outcome) => Ok(SessionEnd::Finished(outcome)),
        Err(AgentError::EngineUnavailable(detail)) => Ok(SessionEnd::EngineLost(detail)),
        Err(e) => Err(e.into()),
    }
}

fn save_transcript(transcript: &ConversationState, dir: &str, target: &Path) -> Result<PathBuf> {
    let dir = resolve_path(dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create '{}'", dir.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{name}-{stamp}.jsonl"));
    transcript.save_jsonl(&path)?;
    Ok(path)
}

/// Build the completion model for the configured provider.
#[allow(deprecated)]
fn create_model(config: &ModelConfig) -> Result<CompletionModelHandle<'static>> {
    let model_name = config.model.as_str();

    match config.provider.as_str() {
        "anthropic" => {
            let key = config
                .api_key()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Anthropic provider selected but no API key found"))?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            tracing::info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key = config
                .api_key()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("OpenAI provider selected but no API key found"))?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(base) = config.api_base() {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI-compatible endpoint: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(base) = config.api_base() {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => anyhow::bail!(
            "Unknown provider '{other}'. Valid providers: {}",
            KNOWN_PROVIDERS.join(", ")
        ),
    }
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    use std::io::{self, Write};
    print!("{prompt} [{default}]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Write a starter config file.
fn run_onboard(config_arg: Option<PathBuf>, non_interactive: bool) -> Result<()> {
    let config_path = config_arg.unwrap_or_else(|| state_dir().join("config.json"));
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `r2auto onboard` again.");
        return Ok(());
    }

    let mut cfg = Config::default();
    if !non_interactive {
        println!("Interactive setup");
        cfg.model.provider = prompt_with_default(
            &format!("Provider ({})", KNOWN_PROVIDERS.join("/")),
            &cfg.model.provider,
        )?
        .to_lowercase();
        cfg.model.model = prompt_with_default("Model", &cfg.model.model)?;
        let base = prompt_with_default("API base URL (empty for provider default)", "")?;
        cfg.model.api_base = Some(base).filter(|b| !b.is_empty());
        if cfg.model.provider != "ollama" {
            let key = prompt_with_default("API key (empty to use OPENAI_API_KEY)", "")?;
            cfg.model.api_key = Some(key).filter(|k| !k.is_empty());
        }
        cfg.engine.program = prompt_with_default("radare2 executable", &cfg.engine.program)?;
    }

    save_config(&config_path, &cfg)?;
    println!("Created config: {}", config_path.display());
    println!();
    println!("Next: run `r2auto run <binary>` to start an analysis session.");
    Ok(())
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Show resolved configuration.
fn run_status(config_path: &Path) -> Result<()> {
    println!("r2auto status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, using defaults; run `r2auto onboard`)",
            config_path.display()
        );
    }

    let mut config = load_config(config_path)?;
    apply_env_overrides(&mut config);

    println!("  Provider:  {}", config.model.provider);
    println!("  Model:     {}", config.model.model);
    println!(
        "  API base:  {}",
        config.model.api_base().unwrap_or("(provider default)")
    );
    println!(
        "  API key:   {}",
        config.model.api_key().map(mask_key).unwrap_or_else(|| "(not set)".into())
    );
    if let Some(proxy) = config.model.proxy() {
        println!("  Proxy:     {proxy}");
    }
    println!();

    let engine = match which::which(&config.engine.program) {
        Ok(path) => format!("{} (found)", path.display()),
        Err(_) => format!("{} (not found on PATH)", config.engine.program),
    };
    println!("  Engine:    {engine}");
    println!("  Command timeout: {}s", config.engine.command_timeout_secs);
    println!(
        "  Transcripts: {}",
        if config.agent.save_transcripts {
            resolve_path(&config.agent.transcript_dir).display().to_string()
        } else {
            "disabled".to_string()
        }
    );

    match config.validate() {
        Ok(()) => println!("\n  Ready."),
        Err(e) => println!("\n  Not ready: {e}"),
    }
    Ok(())
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sensei_core::{find_topic, Provider, SendOutcome, SessionController, Topic, TOPICS};
use sensei_providers::GeminiProvider;

mod chat;
mod config;
mod render;

use chat::TurnEnd;
use config::{Config, Overrides};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: every reply fragment and request payload
    Trace,
    /// Verbose: request lifecycle, session changes
    Debug,
    /// Standard: high-level flow
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "sensei")]
#[command(author, version, about = "AlgoSensei: an algorithm tutor for the terminal", long_about = None)]
pub struct Cli {
    /// Ask a single question, print the answer and exit
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Topic to start on (id or number, see `sensei topics`)
    #[arg(long)]
    pub topic: Option<String>,

    /// Model to use (overrides config)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Temperature (0.0-2.0)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Base URL for the API (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_tokens,
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the curriculum topics
    Topics,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let interactive = atty::is(atty::Stream::Stdout);
    let live_view = interactive && cli.command.is_none();
    init_logging(&cli, live_view)?;

    let config = Config::load(&cli.overrides())?;

    match &cli.command {
        Some(Commands::Topics) => {
            list_topics();
            return Ok(());
        }
        Some(Commands::Config) => return show_config(&config),
        None => {}
    }

    let topic = resolve_topic(cli.topic.as_deref())?;
    let controller = build_controller(&config);
    if controller.credential_missing() {
        render::print_remediation();
        return Ok(());
    }

    match &cli.prompt {
        Some(prompt) => one_shot(&controller, topic, prompt, interactive).await,
        None => chat::run_chat(&controller, topic, interactive).await,
    }
}

fn init_logging(cli: &Cli, live_view: bool) -> Result<()> {
    // --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else if live_view {
        // Log lines would corrupt the in-place redraw
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn resolve_topic(key: Option<&str>) -> Result<Option<&'static Topic>> {
    key.map(|key| {
        find_topic(key).ok_or_else(|| {
            anyhow::anyhow!("Unknown topic '{key}'. Run `sensei topics` to list them.")
        })
    })
    .transpose()
}

fn build_controller(config: &Config) -> SessionController {
    let base_url = config.base_url.clone();
    SessionController::new(
        config.api_key(),
        move |api_key| {
            let provider = GeminiProvider::connect(api_key, base_url.as_deref())?;
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        },
        config.controller_config(),
    )
}

async fn one_shot(
    controller: &SessionController,
    topic: Option<&'static Topic>,
    prompt: &str,
    interactive: bool,
) -> Result<()> {
    if topic.is_some() {
        chat::open_session(controller, topic, interactive).await?;
    } else {
        controller
            .start_session(None)
            .await
            .context("Failed to start chat session")?;
    }

    match chat::send_message(controller, prompt, interactive).await? {
        TurnEnd::Finished(Ok(SendOutcome::Failed { reason, .. })) => {
            anyhow::bail!("Reply failed: {reason}")
        }
        TurnEnd::Finished(Ok(_)) => Ok(()),
        TurnEnd::Finished(Err(e)) => Err(e.into()),
        TurnEnd::Interrupted => anyhow::bail!("Interrupted"),
    }
}

fn list_topics() {
    println!("{}", render::text_to_ansi(&render::topics_text(TOPICS, None)));
}

fn show_config(config: &Config) -> Result<()> {
    println!("Configuration:");
    println!("  File: {}", Config::config_path()?.display());
    println!("  API key: {}", config.masked_api_key());
    println!("  Model: {}", config.model);
    println!("  Temperature: {}", config.temperature);
    if let Some(max_tokens) = config.max_output_tokens {
        println!("  Max output tokens: {}", max_tokens);
    }
    if let Some(base_url) = &config.base_url {
        println!("  Base URL: {}", base_url);
    }
    match config.stream_timeout() {
        Some(timeout) => println!("  Stream timeout: {}s", timeout.as_secs()),
        None => println!("  Stream timeout: disabled"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "sensei",
            "--topic",
            "dp",
            "-m",
            "gemini-2.5-pro",
            "-t",
            "0.2",
            "--max-tokens",
            "256",
        ]);
        let overrides = cli.overrides();
        assert_eq!(cli.topic.as_deref(), Some("dp"));
        assert_eq!(overrides.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(overrides.temperature, Some(0.2));
        assert_eq!(overrides.max_output_tokens, Some(256));
        assert_eq!(cli.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_cli_subcommands() {
        let cli = Cli::parse_from(["sensei", "topics"]);
        assert!(matches!(cli.command, Some(Commands::Topics)));
        let cli = Cli::parse_from(["sensei", "config"]);
        assert!(matches!(cli.command, Some(Commands::Config)));
    }

    #[test]
    fn test_resolve_topic() {
        assert_eq!(resolve_topic(None).unwrap(), None);
        assert_eq!(resolve_topic(Some("3")).unwrap().map(|t| t.id), Some("stack_queue"));
        assert!(resolve_topic(Some("graphs")).is_err());
    }

    #[test]
    fn test_missing_key_disables_controller() {
        let config = Config {
            api_key: Some(" ".to_string()),
            ..Config::default()
        };
        assert!(build_controller(&config).credential_missing());

        let config = Config {
            api_key: Some("key".to_string()),
            ..Config::default()
        };
        assert!(!build_controller(&config).credential_missing());
    }
}

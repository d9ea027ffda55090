//! Parley CLI, the main entry point.
//!
//! Commands:
//! - `chat`    Interactive chat with streamed answers
//! - `ask`     One shell request over a history file
//! - `config`  Show or initialize the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use parley::commands;
use parley_config::AppConfig;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: chat with tool-calling language models",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this provider instead of the configured default
    #[arg(short, long, global = true)]
    provider: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively; type /exit to quit
    Chat,

    /// Answer one request and update the history file
    Ask {
        /// What to ask
        utterance: String,

        /// JSON history file, created if missing
        #[arg(long, default_value = "parley-history.json")]
        history: PathBuf,
    },

    /// Show the configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Config { init } = cli.command {
        return commands::config::run(init).await;
    }

    let mut config = AppConfig::load()?;
    if let Some(provider) = cli.provider {
        config.default_provider = provider;
    }

    match cli.command {
        Commands::Chat => commands::chat::run(&config).await?,
        Commands::Ask { utterance, history } => {
            commands::ask::run(&config, &utterance, &history).await?
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

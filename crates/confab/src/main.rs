mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// confab - a multi-conversation chat bot backend for local language models
#[derive(Parser, Debug)]
#[command(version = confab::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat with the bot from the terminal
    Chat {
        /// Path to configuration file
        #[arg(short, long, default_value = "confab.yaml")]
        config: String,

        /// Model to talk to (defaults to default_model, then the first model)
        #[arg(short, long)]
        model: Option<String>,

        /// Use instruct mode if the model allows it
        #[arg(long)]
        instruct: bool,
    },

    /// Build missing init caches
    Warm {
        /// Path to configuration file
        #[arg(short, long, default_value = "confab.yaml")]
        config: String,
    },

    /// Validate the configuration and model catalog
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "confab.yaml")]
        config: String,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            config,
            model,
            instruct,
        } => commands::chat::run(&config, model.as_deref(), instruct).await,
        Commands::Warm { config } => commands::warm::run(&config).await,
        Commands::Check { config, format } => commands::check::run(&config, &format).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use draftsave::config::DraftsaveToml;

mod cmd;

#[derive(Parser)]
#[command(name = "draftsave")]
#[command(version, about = "Keep form drafts saved to a remote autosave endpoint")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to draftsave.toml. Defaults to ./draftsave.toml, then the user config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Endpoint base URL. Overrides DRAFTSAVE_ENDPOINT and draftsave.toml.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch a JSON form file and autosave it while it changes
    Watch {
        /// Document (response) id to save against
        document_id: String,

        /// JSON object file holding the form contents
        #[arg(short, long)]
        file: PathBuf,

        /// Periodic save interval in milliseconds. Overrides draftsave.toml.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// How often to check the file for changes, in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,

        /// Start in offline mode; type `online` on stdin to reconnect
        #[arg(long)]
        offline: bool,
    },
    /// Save a JSON form file once and exit
    Save {
        /// Document (response) id to save against
        document_id: String,

        /// JSON object file holding the form contents
        #[arg(short, long)]
        file: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default draftsave.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let working_dir = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&working_dir, cli.config.as_deref(), command.clone())?;
        }
        Commands::Save { document_id, file } => {
            let settings = DraftsaveToml::load_or_default(cli.config.as_deref(), &working_dir)?;
            draftsave::logging::init_tracing(&settings.logging, cli.verbose);
            cmd::cmd_save(&cli, &settings, document_id, file).await?;
        }
        Commands::Watch {
            document_id,
            file,
            interval_ms,
            poll_ms,
            offline,
        } => {
            let settings = DraftsaveToml::load_or_default(cli.config.as_deref(), &working_dir)?;
            draftsave::logging::init_tracing(&settings.logging, cli.verbose);
            let watch = cmd::WatchArgs {
                document_id,
                file,
                interval_ms: *interval_ms,
                poll_ms: *poll_ms,
                start_offline: *offline,
            };
            cmd::cmd_watch(&cli, &settings, watch).await?;
        }
    }

    Ok(())
}

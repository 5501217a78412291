#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use wa_relay::{daemon, Config, RelayError};

/// `wa-relay` - WhatsApp messages in, webhook replies out.
#[derive(Parser, Debug)]
#[command(name = "wa-relay")]
#[command(version)]
#[command(about = "Relay WhatsApp messages to a webhook and send back delayed replies.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: $WA_RELAY_CONFIG_DIR or ~/.wa-relay)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay (default)
    Run,

    /// Upload the local credential bundle to the remote store
    Sync {
        /// Re-upload every blob, ignoring the sync index
        #[arg(long)]
        full: bool,
    },

    /// Restore the credential bundle from the remote store
    Fetch,

    /// Unlink the device and delete local and remote credentials
    Logout {
        /// Confirm the destructive operation
        #[arg(long)]
        yes: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the config JSON Schema to stdout
    Schema,
    /// Print the effective configuration path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    // Schema output must stay clean stdout and does not need a config file.
    if let Some(Commands::Config {
        command: ConfigCommands::Schema,
    }) = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match Config::load_or_init(cli.config_dir.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            if e.downcast_ref::<RelayError>().is_some_and(RelayError::is_fatal) {
                tracing::error!("{e:#}");
                eprintln!("Set the missing value in config.toml or the environment, then restart.");
            }
            return Err(e);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => daemon::run(config).await,
        Commands::Sync { full } => daemon::sync_once(&config, full).await,
        Commands::Fetch => daemon::fetch_once(&config).await,
        Commands::Logout { yes } => {
            if !yes {
                bail!("Logout deletes the linked session everywhere; rerun with --yes to confirm");
            }
            daemon::logout(&config).await
        }
        Commands::Config {
            command: ConfigCommands::Path,
        } => {
            println!("{}", config.config_path.display());
            Ok(())
        }
        Commands::Config {
            command: ConfigCommands::Schema,
        } => unreachable!("handled before config load"),
    }
}

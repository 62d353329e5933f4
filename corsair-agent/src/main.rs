//! Command-line agent for corsair.
//!
//! Scrapes a local exposition endpoint and ships the samples to the remote
//! sink until interrupted, plus helpers for writing and checking the
//! configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use corsair::config::DEFAULT_CONFIG_PATH;
use corsair::secret::{decode_secret, encode_secret};
use corsair::{AgentConfig, CorsairError, Driver, QueueManager, RejectGate, Scraper, SigningClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// corsair: host-side telemetry shipping agent.
#[derive(Parser)]
#[command(name = "corsair", version, about)]
struct Cli {
    /// Log filter, e.g. "info" or "corsair=debug". Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the scrape-and-ship pipeline until Ctrl-C.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Write a new configuration file.
    Init {
        /// Account (team) id.
        #[arg(long)]
        team_id: String,

        /// Access key.
        #[arg(long)]
        ak: String,

        /// Secret key, in clear text; it is stored obfuscated.
        #[arg(long)]
        sk: String,

        /// Base URL of the remote sink.
        #[arg(long)]
        remote_host: Option<String>,

        /// Host identifier reported to the remote sink.
        #[arg(long)]
        host: Option<String>,

        /// Path of the configuration file to write.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Ask the remote sink whether this identity may upload.
    Check {
        /// Path to the configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print the obfuscated form of a secret key.
    EncodeSk {
        /// The secret key.
        secret: String,
    },

    /// Print the secret key hidden in an obfuscated value.
    DecodeSk {
        /// The obfuscated value.
        encoded: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::Init {
            team_id,
            ak,
            sk,
            remote_host,
            host,
            config,
            force,
        } => cmd_init(
            &config,
            InitArgs {
                team_id,
                ak,
                sk,
                remote_host,
                host,
            },
            force,
        ),
        Commands::Check { config } => cmd_check(&config).await,
        Commands::EncodeSk { secret } => encode_secret(&secret)
            .map(|encoded| println!("{encoded}"))
            .map_err(Into::into),
        Commands::DecodeSk { encoded } => decode_secret(&encoded)
            .map(|secret| println!("{secret}"))
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `corsair run`.
async fn cmd_run(path: &Path) -> Result<(), CorsairError> {
    let config = AgentConfig::load(path)?;
    info!(config = %path.display(), team_id = %config.team_id, "configuration loaded");

    let auth = Arc::new(config.auth_context()?);
    let client = SigningClient::new(config.write_url(), auth, config.remote_timeout)?
        .with_external_labels(config.external_labels());
    let gate = Arc::new(RejectGate::new(config.reject_policy()));
    let queue = QueueManager::new(
        config.queue.clone(),
        config.flush_deadline,
        Arc::new(client),
        gate,
    )?;
    let scraper = Scraper::new(&config.scrape_url, config.scrape_timeout)?;

    let driver = Driver::new(scraper, Arc::new(queue), config.scrape_interval);
    driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("interrupted, flushing queue");
        })
        .await
}

/// Identity fields for `corsair init`.
struct InitArgs {
    team_id: String,
    ak: String,
    sk: String,
    remote_host: Option<String>,
    host: Option<String>,
}

/// Implements `corsair init`.
fn cmd_init(path: &Path, args: InitArgs, force: bool) -> Result<(), CorsairError> {
    if path.exists() && !force {
        return Err(corsair::error::ConfigError::Invalid {
            field: "config",
            reason: format!("'{}' already exists, pass --force to overwrite", path.display()),
        }
        .into());
    }

    let defaults = AgentConfig::default();
    let config = AgentConfig {
        team_id: args.team_id,
        uploader_uid: format!("uid-{}", uuid::Uuid::new_v4()),
        ak: args.ak,
        sk: encode_secret(&args.sk)?,
        host: args.host.unwrap_or_else(|| defaults.host.clone()),
        remote_host: args.remote_host.unwrap_or_default(),
        ..defaults
    };
    config.save(path)?;

    println!("Wrote {} (uploader {})", path.display(), config.uploader_uid);
    Ok(())
}

/// Implements `corsair check`.
async fn cmd_check(path: &Path) -> Result<(), CorsairError> {
    let config = AgentConfig::load(path)?;
    let client = SigningClient::new(
        config.write_url(),
        Arc::new(config.auth_context()?),
        config.remote_timeout,
    )?;

    let url = config.source_check_url();
    client.check_source(&url).await?;
    println!("Identity accepted by {url}");
    Ok(())
}

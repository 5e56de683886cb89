//! Command-line interface for the proxy
//!
//! Argument parsing, command definitions and command execution.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{checksum, config::CONFIG_FILENAME, logging, server, Config};

/// Command-line interface for the proxy
#[derive(Parser, Debug)]
#[command(name = "pypi-proxy")]
#[command(about = "Caching and uploading proxy for PyPI-style package indexes")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, short = 'c', default_value = CONFIG_FILENAME, global = true)]
    pub config: PathBuf,

    /// Log level, overriding the configured one
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server
    Start {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Rebuild every checksum ledger in the cache and upload directories
    Rehash,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
}

/// Parse arguments and execute the command
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    handle_command(cli).await
}

async fn handle_command(cli: Cli) -> Result<()> {
    if let Commands::Init { force } = cli.command {
        logging::init_subscriber(&Default::default(), cli.log_level.as_deref());
        return handle_init(&cli.config, force);
    }

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init_subscriber(&config.logging, cli.log_level.as_deref());

    match cli.command {
        Commands::Start { host, port } => handle_start(config, host, port).await,
        Commands::Rehash => handle_rehash(&config).await,
        Commands::Init { .. } => Ok(()),
    }
}

async fn handle_start(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    info!(host = %config.server.host, port = config.server.port, "Starting proxy");
    server::run_server(config).await
}

async fn handle_rehash(config: &Config) -> Result<()> {
    for root in [&config.package.cache_dir, &config.package.upload_dir] {
        if !root.is_dir() {
            warn!(path = %root.display(), "Skipping missing directory");
            continue;
        }
        let count = checksum::rebuild_tree(root)
            .await
            .with_context(|| format!("Failed to rehash {}", root.display()))?;
        info!(path = %root.display(), files = count, "Ledgers rebuilt");
    }
    Ok(())
}

fn handle_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to overwrite", path.display());
    }
    let yaml = Config::default().to_yaml()?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

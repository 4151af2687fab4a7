//! drmchain Node
//!
//! Runs the handshake and gossip endpoints for one node, dials the
//! configured peers and gossips lines read from stdin to every connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use drmchain_crypto::NodeIdentity;
use drmchain_network::{Connection, Network, OnConnect};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::{load_identity, parse_level, save_identity, NodeConfig};

/// drmchain node
#[derive(Parser)]
#[command(name = "drmchain-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.drmchain/config.toml")]
    config: PathBuf,

    /// Log level (defaults to the configured level)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run,

    /// Write a default configuration file
    GenConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Generate a new identity
    Keygen {
        /// Overwrite an existing key file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_path(&cli.config)?;

    match cli.command {
        Commands::Run => {
            let config = NodeConfig::load_or_create(&config_path).await?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level))?;
            cmd_run(config).await
        }
        Commands::GenConfig { force } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            cmd_gen_config(&config_path, force).await
        }
        Commands::Keygen { force } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            cmd_keygen(&config_path, force).await
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = parse_level(level).unwrap_or(tracing::Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn cmd_run(config: NodeConfig) -> Result<()> {
    config.validate()?;

    let key_file = expand_path(&config.identity.key_file)?;
    let identity = if key_file.exists() {
        load_identity(&key_file).await?
    } else {
        let identity = NodeIdentity::generate();
        save_identity(&identity, &key_file).await?;
        info!("Generated new identity, saved to {:?}", key_file);
        identity
    };

    let network =
        Network::new(identity, config.network.clone()).context("Failed to create network")?;

    let on_connection: OnConnect = Arc::new(spawn_inbox);
    network
        .open(on_connection)
        .await
        .context("Failed to open network")?;
    info!("Node tag: {}", network.identity().tag());

    for peer in &config.peers {
        let identity = peer.identity()?;
        match network.connect_to(identity, peer.handshake_addr).await {
            Ok(connection) => info!("Connected to {} ({})", peer.tag, connection.session_id()),
            Err(e) => warn!("Failed to connect to {} at {}: {}", peer.tag, peer.handshake_addr, e),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.is_empty() => {
                    let payload = Bytes::from(line);
                    for connection in network.connections() {
                        if let Err(e) = connection.tunnel().send(payload.clone()) {
                            warn!("Failed to send to {}: {}", connection.peer().tag(), e);
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    // stdin closed, keep serving until interrupted
                    tokio::signal::ctrl_c().await?;
                    info!("Shutting down...");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    network.close().await.context("Failed to close network")?;
    Ok(())
}

async fn cmd_gen_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let config = NodeConfig::default();
    config.save(config_path).await?;

    println!("Config written to {:?}", config_path);
    Ok(())
}

async fn cmd_keygen(config_path: &Path, force: bool) -> Result<()> {
    let config = NodeConfig::load_or_create(config_path).await?;
    let key_file = expand_path(&config.identity.key_file)?;

    if key_file.exists() && !force {
        anyhow::bail!(
            "Identity already exists at {:?}. Use --force to overwrite.",
            key_file
        );
    }

    let identity = NodeIdentity::generate();
    save_identity(&identity, &key_file).await?;
    info!("Identity saved to {:?}", key_file);

    println!("Node tag: {}", identity.tag());
    Ok(())
}

/// Log whatever a connection delivers until its tunnel closes
fn spawn_inbox(connection: Arc<dyn Connection>) {
    let tag = connection.peer().tag();
    let mut inbox = connection.tunnel().subscribe();

    tokio::spawn(async move {
        while let Some(payload) = inbox.recv().await {
            match std::str::from_utf8(&payload) {
                Ok(text) => info!("[{}] {}", tag, text),
                Err(_) => info!("[{}] {} bytes", tag, payload.len()),
            }
        }
        debug!("Inbox for {} closed", tag);
    });
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}

//! Node configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use drmchain_crypto::{NodeIdentity, PublicIdentity};
use drmchain_network::NetworkConfig;
use serde::{Deserialize, Serialize};

/// Secret key material on disk: signing key then exchange key
const IDENTITY_FILE_LEN: usize = 64;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transport settings
    pub network: NetworkConfig,
    /// Where the node's keys live
    pub identity: IdentityConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Peers dialled on start-up
    pub peers: Vec<PeerConfig>,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded secret keys
    pub key_file: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("~/.drmchain/identity.key"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `--log-level`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A peer to connect to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's public identity tag
    pub tag: String,
    /// The peer's handshake address
    pub handshake_addr: SocketAddr,
}

impl PeerConfig {
    /// Parse the configured tag
    pub fn identity(&self) -> Result<PublicIdentity> {
        PublicIdentity::from_tag(&self.tag)
            .with_context(|| format!("Invalid peer tag {:?}", self.tag))
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.network
            .validate()
            .context("Invalid network configuration")?;

        for peer in &self.peers {
            peer.identity()?;
        }

        if parse_level(&self.logging.level).is_none() {
            anyhow::bail!("Unknown log level {:?}", self.logging.level);
        }
        Ok(())
    }
}

/// Map a level name to a tracing level
pub fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

/// Read a key file written by [`save_identity`]
pub async fn load_identity(path: &Path) -> Result<NodeIdentity> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read identity file {:?}", path))?;
    let bytes = hex::decode(contents.trim()).context("Identity file is not valid hex")?;

    if bytes.len() != IDENTITY_FILE_LEN {
        anyhow::bail!(
            "Identity file must hold {} bytes, found {}",
            IDENTITY_FILE_LEN,
            bytes.len()
        );
    }

    let mut signing = [0u8; 32];
    let mut exchange = [0u8; 32];
    signing.copy_from_slice(&bytes[..32]);
    exchange.copy_from_slice(&bytes[32..]);
    Ok(NodeIdentity::from_keys(signing, exchange))
}

/// Write the identity's secret keys, hex-encoded
pub async fn save_identity(identity: &NodeIdentity, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let (signing, exchange) = identity.export_secrets();
    let identity_data = hex::encode([signing, exchange].concat());
    tokio::fs::write(path, identity_data)
        .await
        .with_context(|| format!("Failed to write identity file {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("drmchain-node-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.peers.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let peer = NodeIdentity::generate();
        let contents = format!(
            r#"
[logging]
level = "debug"

[[peers]]
tag = "{}"
handshake_addr = "10.0.0.2:2503"
"#,
            peer.tag()
        );

        let config: NodeConfig = toml::from_str(&contents).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.network.response_timeout, Duration::from_secs(5));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].identity().unwrap(), *peer.public_identity());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.peers.push(PeerConfig {
            tag: "not a tag".to_string(),
            handshake_addr: "127.0.0.1:2503".parse().unwrap(),
        });
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.network.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_create_writes_defaults() {
        let dir = scratch_dir("config");
        let path = dir.join("config.toml");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let created = NodeConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());

        let loaded = NodeConfig::load(&path).await.unwrap();
        assert_eq!(loaded.network.gossip_addr, created.network.gossip_addr);
        assert_eq!(loaded.identity.key_file, created.identity.key_file);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_file_reloads_same_identity() {
        let dir = scratch_dir("identity");
        let path = dir.join("identity.key");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let identity = NodeIdentity::generate();
        save_identity(&identity, &path).await.unwrap();
        let loaded = load_identity(&path).await.unwrap();
        assert_eq!(loaded.tag(), identity.tag());

        tokio::fs::write(&path, "abcd").await.unwrap();
        assert!(load_identity(&path).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}

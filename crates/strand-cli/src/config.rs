//! Configuration system for the Strand CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Strand configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TCP listen address
    #[serde(default = "default_relay_listen_addr")]
    pub listen_addr: String,
    /// Heartbeat interval announced to nodes, in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// X25519 static key of the server
    #[serde(default = "default_relay_key_path")]
    pub private_key_file: PathBuf,
    /// Control plane public key (RSA PEM) used to verify node credentials
    #[serde(default = "default_credential_key_path")]
    pub credential_public_key_file: PathBuf,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// X25519 static key of the node
    #[serde(default = "default_node_key_path")]
    pub private_key_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn strand_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".strand")
}

fn default_relay_listen_addr() -> String {
    "0.0.0.0:7800".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    strand_core::HEARTBEAT_INTERVAL.as_secs()
}

fn default_relay_key_path() -> PathBuf {
    strand_home().join("relay_key")
}

fn default_credential_key_path() -> PathBuf {
    strand_home().join("credential_public.pem")
}

fn default_node_key_path() -> PathBuf {
    strand_home().join("private_key")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_relay_listen_addr(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            private_key_file: default_relay_key_path(),
            credential_public_key_file: default_credential_key_path(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key_file: default_node_key_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("strand/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_create(Self::default_path())
    }

    /// Load config from `path`, writing the defaults there first if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Parse the relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid relay listen address '{}': {}", self.relay.listen_addr, e))
    }

    /// Where `keygen` stores a key by default
    #[must_use]
    pub fn key_file(&self, relay: bool) -> &Path {
        if relay {
            &self.relay.private_key_file
        } else {
            &self.node.private_key_file
        }
    }

    /// Heartbeat interval announced by the relay server
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.relay.heartbeat_interval_secs)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay_listen_addr()?;

        if self.relay.heartbeat_interval_secs == 0 || self.relay.heartbeat_interval_secs > 3600 {
            anyhow::bail!("Heartbeat interval must be between 1 and 3600 seconds");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.listen_addr, "0.0.0.0:7800");
        assert_eq!(config.relay.heartbeat_interval_secs, 30);
        assert!(config.node.private_key_file.ends_with(".strand/private_key"));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.relay.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.relay.listen_addr = "127.0.0.1:7800".to_string();
        config.relay.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        config.relay.heartbeat_interval_secs = 10;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.relay.listen_addr, deserialized.relay.listen_addr);
        assert_eq!(config.node.private_key_file, deserialized.node.private_key_file);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[node]\nprivate_key_file = \"/etc/strand/key\"\n").unwrap();
        assert_eq!(config.key_file(false), Path::new("/etc/strand/key"));
        assert_eq!(config.key_file(true), config.relay.private_key_file.as_path());
        assert_eq!(config.relay.listen_addr, "0.0.0.0:7800");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let mut edited = created.clone();
        edited.relay.listen_addr = "127.0.0.1:9000".to_string();
        edited.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.relay.listen_addr, "127.0.0.1:9000");
    }
}

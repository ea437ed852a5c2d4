//! Profiler configuration

use std::path::Path;

use anyhow::{Context, Result};
use cadet_core::CoreConfig;
use serde::{Deserialize, Serialize};

/// How the simulated peers are linked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Peer i links to peer i + 1
    Line,
    /// A line whose ends are linked as well
    Ring,
}

/// Whole profiler configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Settings of every simulated core
    #[serde(default = "CoreConfig::testing")]
    pub core: CoreConfig,
    /// What to run
    #[serde(default)]
    pub profiler: RunConfig,
}

/// Workload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of peers
    pub peers: usize,
    pub topology: Topology,
    /// Channels opened across the overlay
    pub channels: usize,
    /// Messages sent on every channel
    pub messages: usize,
    /// Payload bytes per message
    pub payload_size: usize,
    /// Virtual seconds to run after the traffic, letting timers fire
    pub settle_secs: u64,
    /// Port every peer listens on
    pub port: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            peers: 5,
            topology: Topology::Line,
            channels: 1,
            messages: 100,
            payload_size: 1024,
            settle_secs: 120,
            port: "profiler".to_string(),
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::testing(),
            profiler: RunConfig::default(),
        }
    }
}

impl ProfilerConfig {
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
        if let Err(e) = self.core.validate() {
            anyhow::bail!("Invalid [core] settings: {}", e);
        }

        let run = &self.profiler;
        if run.peers < 2 {
            anyhow::bail!("peers must be at least 2");
        }
        if run.topology == Topology::Ring && run.peers < 3 {
            anyhow::bail!("a ring needs at least 3 peers");
        }
        if run.channels == 0 {
            anyhow::bail!("channels must be at least 1");
        }
        if run.payload_size == 0 || run.payload_size > cadet_core::MAX_CHANNEL_PAYLOAD {
            anyhow::bail!(
                "payload_size must be between 1 and {}",
                cadet_core::MAX_CHANNEL_PAYLOAD
            );
        }
        if run.port.is_empty() {
            anyhow::bail!("port name must not be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ProfilerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ProfilerConfig = toml::from_str("[profiler]\npeers = 8\ntopology = \"ring\"\n").unwrap();
        assert_eq!(config.profiler.peers, 8);
        assert_eq!(config.profiler.topology, Topology::Ring);
        assert_eq!(config.profiler.messages, 100);
        assert_eq!(config.core.max_routes, CoreConfig::testing().max_routes);
    }

    #[test]
    fn test_small_ring_rejected() {
        let mut config = ProfilerConfig::default();
        config.profiler.peers = 2;
        config.profiler.topology = Topology::Ring;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("cadet-profiler-{}.toml", std::process::id()));
        let mut config = ProfilerConfig::default();
        config.profiler.channels = 3;
        config.save(&path).await.unwrap();

        let loaded = ProfilerConfig::load_or_create(&path).await.unwrap();
        assert_eq!(loaded.profiler.channels, 3);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}

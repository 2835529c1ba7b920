// Configuration management for the PeerMesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peermesh/config.json
// - Linux: ~/.config/peermesh/config.json
// - Windows: %APPDATA%\peermesh\config.json

use anyhow::{Context, Result};
use peermesh_core::MeshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Room joined on the relay
    pub room: String,

    /// Signaling relay address
    pub relay_address: String,

    /// Where received files are written
    pub download_dir: Option<String>,

    /// Engine settings
    pub mesh: MeshConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room: "lobby".to_string(),
            relay_address: "ws://127.0.0.1:3000".to_string(),
            download_dir: None,
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peermesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("peermesh");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Engine configuration with the configured room filled in
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            room: self.room.clone(),
            ..self.mesh.clone()
        }
    }

    /// Download directory, defaulting to `<data dir>/downloads`
    pub fn download_path(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(Self::data_dir()?.join("downloads")),
        }
    }

    /// Set a config value (not persisted)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "room" => {
                if value.is_empty() {
                    anyhow::bail!("Room must not be empty");
                }
                self.room = value.to_string();
            }
            "relay_address" => {
                self.relay_address = value.to_string();
            }
            "download_dir" => {
                self.download_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "channel_label" => {
                self.mesh.channel_label = value.to_string();
            }
            "chunk_size" => {
                let size: usize = value.parse().context("Invalid number")?;
                if size == 0 {
                    anyhow::bail!("Chunk size must be at least 1");
                }
                self.mesh.chunk_size = size;
            }
            "chunk_interval_ms" => {
                self.mesh.chunk_interval_ms = value.parse().context("Invalid number")?;
            }
            "max_buffered_amount" => {
                self.mesh.max_buffered_amount = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("room".to_string(), self.room.clone()),
            ("relay_address".to_string(), self.relay_address.clone()),
            (
                "download_dir".to_string(),
                self.download_dir
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("channel_label".to_string(), self.mesh.channel_label.clone()),
            ("chunk_size".to_string(), self.mesh.chunk_size.to_string()),
            (
                "chunk_interval_ms".to_string(),
                format!("{}ms", self.mesh.chunk_interval_ms),
            ),
            (
                "max_buffered_amount".to_string(),
                self.mesh.max_buffered_amount.to_string(),
            ),
            (
                "ice_servers".to_string(),
                self.mesh.ice_servers.len().to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.room, "lobby");
        assert_eq!(config.mesh.chunk_size, 1000);
        assert_eq!(config.mesh_config().room, "lobby");
    }

    #[test]
    fn test_load_creates_then_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        config.set("room", "standup").unwrap();
        config.set("chunk_size", "4096").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.mesh_config().chunk_size, 4096);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("chunk_size", "0").is_err());
        assert!(config.set("chunk_size", "many").is_err());
        assert!(config.set("room", "").is_err());
        assert!(config.set("listen_port", "80").is_err());

        config.set("download_dir", "/tmp/in").unwrap();
        assert_eq!(config.download_path().unwrap(), PathBuf::from("/tmp/in"));
        config.set("download_dir", "").unwrap();
        assert_eq!(config.download_dir, None);
    }
}

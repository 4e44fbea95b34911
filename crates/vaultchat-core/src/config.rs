//! Configuration management for vaultchat
//!
//! Handles loading and saving the TOML configuration: which agent CLI to
//! drive, session controller tuning, and general settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default deadline for a pending prompt, in seconds
pub const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 60;

/// Default capacity of the turn client -> controller event channel
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent CLI settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Session controller settings
    #[serde(default)]
    pub session: SessionSettings,
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Agent CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable that speaks the stream-json protocol
    pub command: String,
    /// Extra arguments appended to the command line
    pub args: Vec<String>,
    /// Model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            model: None,
        }
    }
}

/// Session controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// How long a pending prompt waits for a human before auto-deny
    pub prompt_timeout_secs: u64,
    /// Capacity of the bounded event channel between agent and controller
    pub event_buffer: usize,
    /// Where session metadata is stored (defaults to the data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            prompt_timeout_secs: DEFAULT_PROMPT_TIMEOUT_SECS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            sessions_dir: None,
        }
    }
}

impl SessionSettings {
    /// Prompt deadline as a duration
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    /// Resolve the sessions directory, falling back to the platform data dir
    pub fn resolve_sessions_dir(&self) -> PathBuf {
        if let Some(dir) = &self.sessions_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|p| p.join("vaultchat"))
            .unwrap_or_else(|| PathBuf::from(".vaultchat"))
            .join("sessions")
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// Optional directory for rolling log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_dir: None,
        }
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("vaultchat").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Path this manager reads from and saves to
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

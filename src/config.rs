//! Configuration for vtshell.
//!
//! # Configuration File
//!
//! The configuration file is located at `~/.vtshell/config.toml`:
//!
//! ```toml
//! # Command to run (defaults to $SHELL, then /bin/sh)
//! shell = "/bin/bash"
//!
//! # TERM value for the child
//! term = "ansi"
//!
//! # Rows of the inline virtual terminal
//! height = 10
//!
//! # Forward bells to the real terminal
//! bell = true
//!
//! # Log filter (overridden by VTSHELL_LOG)
//! log_level = "info"
//! ```
//!
//! Every key is optional. Command line flags override the file.
//! `vtshell --init-config` writes a file with the defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_DIR: &str = ".vtshell";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] io::Error),

    #[error("Could not determine config path")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command to run in the virtual terminal
    pub shell: Option<String>,
    /// TERM for the child
    pub term: String,
    /// Rows of the virtual terminal
    pub height: u16,
    /// Ring the real terminal's bell on BEL
    pub bell: bool,
    /// Default log filter
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            term: "ansi".to_string(),
            height: 10,
            bell: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file. A missing file gives the defaults.
    pub fn try_load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to `~/.vtshell/config.toml`, returning the path
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let dir = config_dir().ok_or(ConfigError::NoHome)?;
        fs::create_dir_all(&dir).map_err(ConfigError::Write)?;
        let path = dir.join(CONFIG_FILE);
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// The configured shell, else `$SHELL`, else `/bin/sh`
    pub fn shell_command(&self) -> String {
        self.shell
            .clone()
            .filter(|shell| !shell.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// `~/.vtshell`, home of the config file and the log
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(CONFIG_DIR))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

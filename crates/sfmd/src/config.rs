//! sfmd configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SFM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sfm/config.toml
//!   3. ~/.config/sfm/config.toml
//!
//! The daemon is the only thing that reads configuration; the library
//! crates take every collaborator as an explicit constructor argument.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmdConfig {
    /// Name other devices see in discovery and handshakes.
    pub device_name: String,
    /// TCP port for the transfer API; also advertised over mDNS.
    pub listen_port: u16,
    /// Directory where received files are written.
    pub download_dir: PathBuf,
    /// Directory holding device.pub, device.key, and the trust store.
    pub identity_dir: PathBuf,
    /// Discard sessions with no chunk activity for this many seconds.
    pub session_idle_secs: u64,
}

impl Default for SfmdConfig {
    fn default() -> Self {
        let airdrop_dir = config_dir().join("airdrop");
        Self {
            device_name: default_device_name(),
            listen_port: sfm_airdrop::discovery::DEFAULT_PORT,
            download_dir: airdrop_dir.clone(),
            identity_dir: airdrop_dir,
            session_idle_secs: 300,
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sfm-device".to_string())
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("sfm")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SfmdConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SfmdConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SFM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply SFM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SFM_DEVICE_NAME") {
            self.device_name = v;
        }
        if let Ok(v) = std::env::var("SFM_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("SFM_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SFM_IDENTITY_DIR") {
            self.identity_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SFM_SESSION_IDLE_SECS") {
            if let Ok(secs) = v.parse() {
                self.session_idle_secs = secs;
            }
        }
    }
}

//! Configuration file support
//!
//! Loads defaults from `<config dir>/bwprobe/config.toml`. Every field is
//! optional; command-line flags win over anything set here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::serve::DispatchMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Default test duration in seconds
    pub duration_secs: Option<u64>,

    /// Default number of parallel streams
    pub parallel_streams: Option<u16>,

    /// Send size per write (e.g. "128K", "1M")
    pub buffer_size: Option<String>,

    /// Per-stream UDP rate (e.g. "10M", "1G")
    pub bandwidth: Option<String>,

    /// Skip the control handshake (raw streaming peers)
    pub no_control: Option<bool>,

    pub tcp_nodelay: Option<bool>,

    /// TCP window size (e.g. "1M", "512K")
    pub window_size: Option<String>,

    pub json_output: Option<bool>,

    /// Log file path, rotated daily
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,

    /// Address family preference (ipv4, ipv6, dual)
    pub address_family: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    pub port: Option<u16>,

    /// Bind address (e.g. "127.0.0.1")
    pub bind: Option<String>,

    /// Serve TCP (control and data)
    pub tcp: Option<bool>,

    /// Serve UDP datagrams
    pub udp: Option<bool>,

    pub dispatch: Option<DispatchMode>,

    /// Evict UDP senders silent for this long
    pub session_timeout_secs: Option<u64>,

    /// Receive buffer for raw data connections (e.g. "128K")
    pub buffer_size: Option<String>,

    pub log_file: Option<String>,

    pub log_level: Option<String>,

    pub address_family: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bwprobe")
            .join("config.toml")
    }
}

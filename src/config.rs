//! Endpoint resolution and viewer configuration.
//!
//! Storage location of the optional config file:
//! - Linux: ~/.config/framescope/config.json
//! - Windows: %APPDATA%\framescope\config.json
//! - MacOS: ~/Library/Application Support/framescope/config.json

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client::ReconnectPolicy;
use crate::stats::DEFAULT_HISTORY_CAPACITY;

pub const DEFAULT_WS_PORT: u16 = 8080;
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid ws_port {0:?}")]
    InvalidPort(String),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Where the stream lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Resolves the endpoint from optional overrides.
    ///
    /// A missing `ws_host`, or one that is literally `localhost`, resolves to
    /// `fallback_host` (the host the viewer itself was reached on).
    pub fn resolve(ws_host: Option<&str>, ws_port: Option<u16>, fallback_host: &str) -> Self {
        let host = match ws_host.map(str::trim) {
            Some(host) if !host.is_empty() && host != DEFAULT_HOST => host,
            _ => fallback_host,
        };

        Self {
            host: host.to_string(),
            port: ws_port.unwrap_or(DEFAULT_WS_PORT),
            path: DEFAULT_WS_PATH.to_string(),
        }
    }

    /// Resolves from a URL query string such as `?ws_host=cam.local&ws_port=9000`.
    pub fn from_query(query: &str, fallback_host: &str) -> Result<Self, ConfigError> {
        let mut ws_host = None;
        let mut ws_port = None;

        for pair in query.trim_start_matches('?').split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "ws_host" => ws_host = Some(value),
                "ws_port" if !value.is_empty() => {
                    let port = value
                        .parse::<u16>()
                        .map_err(|_| ConfigError::InvalidPort(value.to_string()))?;
                    ws_port = Some(port);
                }
                _ => {}
            }
        }

        Ok(Self::resolve(ws_host, ws_port, fallback_host))
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Viewer settings. Every field has a default so partial files are fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub ws_host: Option<String>,
    pub ws_port: u16,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub history_capacity: usize,
    /// Pause between the disconnect and reconnect of a manual refresh.
    pub refresh_delay_ms: u64,
    /// How many recent frames the trend summary covers.
    pub chart_points: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            ws_host: None,
            ws_port: DEFAULT_WS_PORT,
            max_reconnect_attempts: ReconnectPolicy::DEFAULT_MAX_ATTEMPTS,
            reconnect_base_delay_ms: ReconnectPolicy::DEFAULT_BASE_DELAY.as_millis() as u64,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            refresh_delay_ms: 1000,
            chart_points: 50,
        }
    }
}

impl ViewerConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("framescope").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `explicit` if given (it must exist), otherwise the default path
    /// if a file is there, otherwise the built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading viewer config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1"));
        }
        if self.ws_port == 0 {
            return Err(ConfigError::InvalidPort(self.ws_port.to_string()));
        }
        Ok(())
    }

    pub fn endpoint(&self, fallback_host: &str) -> Endpoint {
        Endpoint::resolve(self.ws_host.as_deref(), Some(self.ws_port), fallback_host)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
        }
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

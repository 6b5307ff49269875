//! Client configuration file (`ftclient.toml`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TransferError};
use crate::protocol::timeouts;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds to wait for the peer to connect back (0 = wait forever)
    pub accept_timeout_secs: u64,
    /// Control connect timeout in ms (0 = OS default)
    pub connect_timeout_ms: u64,
    /// How often blocked reads and accepts check for Ctrl-C
    pub poll_interval_ms: u64,
    /// Where GET writes files
    pub output_dir: PathBuf,
    /// Progress bar while receiving a file
    pub progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            accept_timeout_secs: timeouts::ACCEPT_SECS,
            connect_timeout_ms: timeouts::CONNECT_MS,
            poll_interval_ms: timeouts::POLL_INTERVAL_MS,
            output_dir: PathBuf::from("."),
            progress: false,
        }
    }
}

impl ClientConfig {
    pub fn accept_deadline(&self) -> Option<Duration> {
        (self.accept_timeout_secs > 0).then(|| Duration::from_secs(self.accept_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        toml::from_str(data).map_err(|e| TransferError::Config(e.to_string()))
    }

    /// Load `path`. A missing file at the default location means defaults;
    /// an explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let data = std::fs::read_to_string(p)
                    .map_err(|e| TransferError::Config(format!("{}: {}", p.display(), e)))?;
                Self::from_toml(&data)
            }
            None => match std::fs::read_to_string(default_path()) {
                Ok(data) => Self::from_toml(&data),
                Err(_) => Ok(Self::default()),
            },
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("ftlink");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("ftlink");
    }
    PathBuf::from(".ftlink")
}

pub fn default_path() -> PathBuf {
    config_dir().join("ftclient.toml")
}

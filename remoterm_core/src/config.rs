//! Client configuration, read from `<config_dir>/remoterm/config.json`.
//!
//! Every field has a default, so an absent file or a partial file is fine.
//! Durations are written as integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use directories::ProjectDirs;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::SyncStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to locate the configuration directory")]
    NoConfigDir,
    #[error("could not read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed configuration in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// WebSocket endpoint of the terminal backend.
    pub url: String,
    pub token: Option<String>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8022/terminal".into(),
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_ms")]
    pub create_timeout: Duration,
    /// Output chunks retained per session for replay; oldest go first.
    pub max_buffered_chunks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(10),
            max_buffered_chunks: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the
    /// exponential delay. Must be within `0.0..=1.0`.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Weight of the newest sample in the latency average.
    pub smoothing: f64,
    /// Consecutive failed probes before the link counts as unhealthy.
    pub failure_threshold: u32,
    pub thresholds: QualityThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            smoothing: 0.3,
            failure_threshold: 3,
            thresholds: QualityThresholds::default(),
        }
    }
}

/// Upper latency bounds (exclusive, milliseconds) of each quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_ms: f64,
    pub good_ms: f64,
    pub fair_ms: f64,
    pub poor_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: 100.0,
            good_ms: 300.0,
            fair_ms: 700.0,
            poor_ms: 1500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote profile API, e.g. `https://host/api`.
    pub api_url: Option<String>,
    pub token: Option<String>,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// Strategy applied by automatic (non-interactive) sync.
    pub auto_strategy: SyncStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            fetch_timeout: Duration::from_secs(15),
            auto_strategy: SyncStrategy::Merge,
        }
    }
}

impl ClientConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj = ProjectDirs::from("", "", "remoterm").ok_or(ConfigError::NoConfigDir)?;
        Ok(proj.config_dir().join("config.json"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No configuration at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

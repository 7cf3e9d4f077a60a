//! # Configuration
//!
//! Settings for the engine, the cart service adapter and logging.
//!
//! Values are layered in three steps, lowest priority first:
//!
//! 1.  Built-in defaults ([`CartConfig::default`]).
//! 2.  An optional JSON file ([`CartConfig::from_json_file`]), camelCase keys,
//!     any subset of fields.
//! 3.  [`ConfigOverrides`] collected by the binary from CLI flags and
//!     environment variables. Only `Some` values override.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Android emulator loopback address of a locally run cart backend.
pub const DEFAULT_BASE_URL: &str = "http://10.0.2.2:8080/api/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid base url {url:?}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Timing of the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// How long an accepted operation waits for same-line intents to merge
    /// before its request is sent.
    pub coalesce_window_ms: u64,
    /// Upper bound on every service call made by the engine.
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 300,
            request_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Connection settings for the remote cart service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub http_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: None,
            max_retries: 3,
            http_timeout_ms: 15_000,
        }
    }
}

impl ServiceConfig {
    /// The base URL with a trailing slash, so relative paths join under it.
    pub fn normalized_base_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|source| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            source,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Logging bootstrap options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogOptions {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    /// Directory for the rolling JSON log; console only when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Number of rolled files kept at startup.
    pub keep_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "cart.log".to_string(),
            keep_files: 7,
        }
    }
}

/// # Cart Config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CartConfig {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
    pub logging: LogOptions,
}

/// Values collected from the command line or environment. `None` keeps the
/// lower layer's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_retries: Option<u32>,
    pub http_timeout_ms: Option<u64>,
    pub coalesce_window_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl CartConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_json_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn merge(self, other: ConfigOverrides) -> Self {
        CartConfig {
            engine: EngineConfig {
                coalesce_window_ms: other.coalesce_window_ms.unwrap_or(self.engine.coalesce_window_ms),
                request_timeout_ms: other.request_timeout_ms.unwrap_or(self.engine.request_timeout_ms),
            },
            service: ServiceConfig {
                base_url: other.base_url.unwrap_or(self.service.base_url),
                auth_token: other.auth_token.or(self.service.auth_token),
                max_retries: other.max_retries.unwrap_or(self.service.max_retries),
                http_timeout_ms: other.http_timeout_ms.unwrap_or(self.service.http_timeout_ms),
            },
            logging: LogOptions {
                level: other.log_level.unwrap_or(self.logging.level),
                log_dir: other.log_dir.or(self.logging.log_dir),
                ..self.logging
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.normalized_base_url()?;
        if self.engine.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "requestTimeoutMs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.service.http_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "httpTimeoutMs",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

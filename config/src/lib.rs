//! Configuration for Quire, read from `~/.quire/config.toml`.
//!
//! ```toml
//! [server]
//! base_url = "http://127.0.0.1:8000"
//! request_timeout_secs = 10
//!
//! [retry]
//! max_retries = 2
//!
//! [vault]
//! markdown_only = true
//!
//! [log]
//! filter = "info"
//! ```
//!
//! Every section is optional. String values may reference environment
//! variables as `${NAME}`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "QUIRE_CONFIG";
/// Overrides `[server] base_url`.
pub const BASE_URL_ENV: &str = "QUIRE_API_BASE_URL";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 2;

const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct QuireConfig {
    pub server: Option<ServerConfig>,
    pub retry: Option<RetrySection>,
    pub vault: Option<VaultConfig>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    pub base_url: Option<String>,
    /// Timeout for document-store calls. Generation streams have none.
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    /// Refuse to open documents without a `.md` extension.
    #[serde(default = "default_true")]
    pub markdown_only: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            markdown_only: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"quire_engine=debug,info"`.
    pub filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${NAME}` with the value of `NAME`, or nothing when it is unset.
/// An unterminated `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        if !name.is_empty() {
            out.push_str(&env::var(name).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

/// `$QUIRE_CONFIG`, or `~/.quire/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".quire").join("config.toml"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl QuireConfig {
    /// Load from [`config_path`]. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Server URL: command line, then `$QUIRE_API_BASE_URL`, then `[server]`, then the default.
    #[must_use]
    pub fn base_url(&self, cli_override: Option<&str>) -> String {
        self.base_url_with_env(cli_override, env::var(BASE_URL_ENV).ok())
    }

    fn base_url_with_env(&self, cli_override: Option<&str>, env_value: Option<String>) -> String {
        non_empty(cli_override.map(str::to_string))
            .or_else(|| non_empty(env_value))
            .or_else(|| {
                non_empty(
                    self.server
                        .as_ref()
                        .and_then(|s| s.base_url.as_deref())
                        .map(expand_env_vars),
                )
            })
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.server
            .as_ref()
            .and_then(|s| s.request_timeout_secs)
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.retry
            .as_ref()
            .and_then(|r| r.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    #[must_use]
    pub fn markdown_only(&self) -> bool {
        self.vault.as_ref().is_none_or(|v| v.markdown_only)
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<String> {
        non_empty(
            self.log
                .as_ref()
                .and_then(|l| l.filter.as_deref())
                .map(expand_env_vars),
        )
    }
}

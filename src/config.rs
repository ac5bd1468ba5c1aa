//! Process configuration, built once from the environment.

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::{
    backlog::BacklogKind,
    delivery::qrz::QrzClientConfig,
    runtime::handle::RuntimeConfig,
    types::{DEFAULT_LOGBOOK_URL, DEFAULT_PORT},
};

/// Logbook credential.
pub const ENV_API_KEY: &str = "QRZ_KEY";
/// Listen host.
pub const ENV_HOST: &str = "QSORELAY_HOST";
/// Listen port.
pub const ENV_PORT: &str = "QSORELAY_PORT";
/// Backlog location.
pub const ENV_BACKLOG: &str = "QSORELAY_BACKLOG";
/// Backlog backend, `file` or `sqlite`.
pub const ENV_BACKLOG_KIND: &str = "QSORELAY_BACKLOG_KIND";
/// Disables delivery when truthy.
pub const ENV_OFFLINE: &str = "QSORELAY_OFFLINE";
/// Peer receiving a copy of every datagram.
pub const ENV_FORWARD: &str = "QSORELAY_FORWARD";
/// Logbook endpoint override.
pub const ENV_LOGBOOK_URL: &str = "QSORELAY_LOGBOOK_URL";
/// Per-request timeout in seconds.
pub const ENV_TIMEOUT_SECS: &str = "QSORELAY_TIMEOUT_SECS";
/// Backlog re-drain period in seconds, `0` disables.
pub const ENV_RETRY_SECS: &str = "QSORELAY_RETRY_SECS";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_BACKLOG: &str = "~/.qrzlogger.sqlite3";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration error, reported before anything is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No credential and not offline.
    #[error("API key must be provided via the QRZ_KEY environment variable")]
    MissingApiKey,
    /// A variable could not be parsed.
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
        /// Parse failure.
        reason: String,
    },
    /// `~/` used without a home directory.
    #[error("cannot expand {0:?}: HOME is not set")]
    NoHome(String),
}

/// Logbook API key. `Debug` never shows the secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wraps a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The secret, for the request body only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when no key was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "ApiKey(<unset>)")
        } else {
            write!(f, "ApiKey(<redacted>)")
        }
    }
}

/// Everything the relay needs, passed by value into each component.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Backlog location, already home-expanded.
    pub backlog_path: PathBuf,
    /// Backlog backend.
    pub backlog_kind: BacklogKind,
    /// Logbook credential; empty only when offline.
    pub api_key: ApiKey,
    /// Persist without attempting delivery.
    pub offline: bool,
    /// Peer receiving every raw datagram.
    pub forward_to: Option<SocketAddr>,
    /// Logbook endpoint.
    pub logbook_url: String,
    /// Bound on one delivery attempt.
    pub request_timeout: Duration,
    /// Backlog re-drain period while running.
    pub retry_interval: Option<Duration>,
}

impl RelayConfig {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let offline = match get(ENV_OFFLINE) {
            Some(v) => parse_bool(ENV_OFFLINE, &v)?,
            None => false,
        };

        let api_key = ApiKey::new(get(ENV_API_KEY).unwrap_or_default());
        if api_key.is_empty() && !offline {
            return Err(ConfigError::MissingApiKey);
        }

        let port = match get(ENV_PORT) {
            Some(v) => parse_with(ENV_PORT, &v, |s| s.trim().parse::<u16>())?,
            None => DEFAULT_PORT,
        };

        let raw_backlog = get(ENV_BACKLOG).unwrap_or_else(|| DEFAULT_BACKLOG.to_string());
        let backlog_path = expand_home(&raw_backlog, lookup("HOME").as_deref())?;
        let backlog_kind = match get(ENV_BACKLOG_KIND) {
            Some(v) => parse_with(ENV_BACKLOG_KIND, &v, |s| s.parse::<BacklogKind>())?,
            None => BacklogKind::infer(&backlog_path),
        };

        let forward_to = get(ENV_FORWARD)
            .map(|v| parse_with(ENV_FORWARD, &v, |s| s.trim().parse::<SocketAddr>()))
            .transpose()?;

        let timeout_secs = match get(ENV_TIMEOUT_SECS) {
            Some(v) => parse_with(ENV_TIMEOUT_SECS, &v, |s| s.trim().parse::<u64>())?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: ENV_TIMEOUT_SECS,
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        let retry_secs = match get(ENV_RETRY_SECS) {
            Some(v) => parse_with(ENV_RETRY_SECS, &v, |s| s.trim().parse::<u64>())?,
            None => 0,
        };

        Ok(Self {
            host: get(ENV_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            backlog_path,
            backlog_kind,
            api_key,
            offline,
            forward_to,
            logbook_url: get(ENV_LOGBOOK_URL).unwrap_or_else(|| DEFAULT_LOGBOOK_URL.to_string()),
            request_timeout: Duration::from_secs(timeout_secs),
            retry_interval: (retry_secs > 0).then(|| Duration::from_secs(retry_secs)),
        })
    }

    /// `host:port` for the UDP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the logbook client.
    pub fn client_config(&self) -> QrzClientConfig {
        QrzClientConfig {
            url: self.logbook_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.request_timeout,
        }
    }

    /// Settings for the relay runtime.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            offline: self.offline,
            attempt_timeout: self.request_timeout,
            retry_interval: self.retry_interval,
            ..RuntimeConfig::default()
        }
    }
}

/// Expands a leading `~/` against `home`.
pub fn expand_home(raw: &str, home: Option<&str>) -> Result<PathBuf, ConfigError> {
    let Some(rest) = raw.strip_prefix("~/") else {
        return Ok(PathBuf::from(raw));
    };
    match home.filter(|h| !h.is_empty()) {
        Some(home) => Ok(Path::new(home).join(rest)),
        None => Err(ConfigError::NoHome(raw.to_string())),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_with<T, E: fmt::Display>(
    var: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> Result<T, ConfigError> {
    parse(value).map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

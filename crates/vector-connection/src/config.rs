//! Connection settings, read from a TOML file such as:
//!
//! ```toml
//! name = "Vector-A1B2"
//! host = "192.168.1.40"
//! certificate = "/home/me/.anki_vector/Vector-A1B2-0060059b.cert"
//! guid = "…"
//! behavior_control_level = "default"
//!
//! [telemetry]
//! log_level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vector_types::{ClientInfo, ControlPriorityLevel, Endpoint, VectorError};

use crate::session::ConnectionOptions;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP/HTTP collector base URL. Spans are exported only when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
        }
    }
}

/// Everything needed to reach and drive one robot.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Robot display name, e.g. `Vector-A1B2`.
    pub name: String,

    /// IP address or hostname of the robot.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the robot's PEM certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,

    /// Client guid used as the authorization token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guid: String,

    /// Control level acquired on connect.
    #[serde(default)]
    pub behavior_control_level: ControlPriorityLevel,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub control_timeout_secs: u64,

    /// How long a command waits for control before proceeding.
    #[serde(default = "default_timeout_secs")]
    pub control_wait_secs: u64,

    #[serde(default = "default_close_join_timeout_secs")]
    pub close_join_timeout_secs: u64,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("certificate", &self.certificate)
            .field("guid", if self.guid.is_empty() { &"<not set>" } else { &"<redacted>" })
            .field("behavior_control_level", &self.behavior_control_level)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("control_timeout_secs", &self.control_timeout_secs)
            .field("control_wait_secs", &self.control_wait_secs)
            .field("close_join_timeout_secs", &self.close_join_timeout_secs)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

fn default_port() -> u16 {
    443
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_close_join_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// Build the robot identity, reading the certificate from disk.
    pub fn endpoint(&self) -> Result<Endpoint, VectorError> {
        let path = self.certificate.as_ref().ok_or_else(|| {
            VectorError::Configuration(
                "Must provide a cert file to authenticate to the robot".to_string(),
            )
        })?;
        let certificate = fs::read(path).map_err(|e| {
            VectorError::Configuration(format!(
                "Failed to read certificate at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Endpoint::new(
            self.name.clone(),
            self.host.clone(),
            self.port,
            Some(certificate),
            self.guid.clone(),
        ))
    }

    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            default_priority: self.behavior_control_level,
            control_wait: Duration::from_secs(self.control_wait_secs),
            close_join_timeout: Duration::from_secs(self.close_join_timeout_secs),
            client_info: ClientInfo::current(),
        }
    }
}

/// Load the config from `path` and apply environment overrides.
pub fn load_from(path: &Path) -> Result<ConnectionConfig, VectorError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        VectorError::Configuration(format!("Failed to read config at {}: {}", path.display(), e))
    })?;
    let mut cfg: ConnectionConfig = toml::from_str(&raw)
        .map_err(|e| VectorError::Configuration(format!("Failed to parse config: {}", e)))?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `VECTOR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VECTOR_HOST` | `host` |
/// | `VECTOR_PORT` | `port` |
/// | `VECTOR_NAME` | `name` |
/// | `VECTOR_GUID` | `guid` |
/// | `VECTOR_CERT` | `certificate` |
pub fn apply_env_overrides(cfg: &mut ConnectionConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Lookup-driven so tests need not mutate the process environment.
fn apply_overrides(cfg: &mut ConnectionConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("VECTOR_HOST") {
        cfg.host = v;
    }
    if let Some(v) = lookup("VECTOR_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Some(v) = lookup("VECTOR_NAME") {
        cfg.name = v;
    }
    if let Some(v) = lookup("VECTOR_GUID") {
        cfg.guid = v;
    }
    if let Some(v) = lookup("VECTOR_CERT") {
        cfg.certificate = Some(PathBuf::from(v));
    }
}

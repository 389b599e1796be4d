//! Director configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/bi-kanpe/director.toml`. Every field has a
//! default, so a missing file yields a fully usable config.
//!
//! # Required fields (when a file is present)
//! - `schema_version = 1`

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level director configuration.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    pub schema_version: u32,
    /// Listen port for the hub WebSocket endpoint.
    pub port: u16,
    pub hub: HubConfig,
}

/// Tuning knobs for the hub; tests shrink the timers.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Name announced in `server_welcome`.
    pub server_name: String,
    /// Ring capacity, per kind (kanpe / feedback).
    pub history_capacity: usize,
    /// Per-subscriber outbox bound, in envelopes.
    pub outbox_capacity: usize,
    /// Hub-initiated `ping` cadence per connection.
    pub keepalive_interval: Duration,
    /// Quiet time after which a connection is closed with `TIMEOUT`.
    pub keepalive_timeout: Duration,
    /// How long a fresh connection may sit silent before `client_hello`.
    pub hello_timeout: Duration,
    /// Outbox drain budget during graceful shutdown.
    pub shutdown_grace: Duration,
    /// Cumulative dropped-envelope count after which a subscriber is
    /// disconnected with `SLOW_CONSUMER`.
    pub slow_consumer_max_dropped: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server_name: "Bi-Kanpe Director".to_owned(),
            history_capacity: 500,
            outbox_capacity: 256,
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
            slow_consumer_max_dropped: 1024,
        }
    }
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            port: 9876,
            hub: HubConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server_name: Option<String>,
    hub: Option<RawHubConfig>,
}

#[derive(Debug, Deserialize)]
struct RawHubConfig {
    port: Option<u16>,
    history_capacity: Option<usize>,
    outbox_capacity: Option<usize>,
    keepalive_interval_ms: Option<u64>,
    keepalive_timeout_ms: Option<u64>,
    hello_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    slow_consumer_max_dropped: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load director config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<DirectorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load director config from the default path `/etc/bi-kanpe/director.toml`,
/// falling back to defaults when the file does not exist.
pub fn load_config() -> Result<DirectorConfig, ConfigError> {
    let path = Path::new("/etc/bi-kanpe/director.toml");
    if path.exists() {
        load_config_from_path(path)
    } else {
        Ok(DirectorConfig::default())
    }
}

/// Load director config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<DirectorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let defaults = HubConfig::default();
    let raw_hub = raw.hub;

    let server_name = match raw.server_name {
        Some(name) if name.trim().is_empty() => {
            return Err(ConfigError::InvalidValue(
                "server_name must not be empty".to_owned(),
            ));
        }
        Some(name) => name,
        None => defaults.server_name.clone(),
    };

    let (port, hub) = match raw_hub {
        Some(h) => (
            h.port.unwrap_or(9876),
            HubConfig {
                server_name,
                history_capacity: h.history_capacity.unwrap_or(defaults.history_capacity),
                outbox_capacity: h.outbox_capacity.unwrap_or(defaults.outbox_capacity),
                keepalive_interval: h
                    .keepalive_interval_ms
                    .map_or(defaults.keepalive_interval, Duration::from_millis),
                keepalive_timeout: h
                    .keepalive_timeout_ms
                    .map_or(defaults.keepalive_timeout, Duration::from_millis),
                hello_timeout: h
                    .hello_timeout_ms
                    .map_or(defaults.hello_timeout, Duration::from_millis),
                shutdown_grace: h
                    .shutdown_grace_ms
                    .map_or(defaults.shutdown_grace, Duration::from_millis),
                slow_consumer_max_dropped: h
                    .slow_consumer_max_dropped
                    .unwrap_or(defaults.slow_consumer_max_dropped),
            },
        ),
        None => (9876, HubConfig {
            server_name,
            ..defaults
        }),
    };

    if hub.outbox_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "hub.outbox_capacity must be at least 1".to_owned(),
        ));
    }

    Ok(DirectorConfig {
        schema_version,
        port,
        hub,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

//! Caster configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/bi-kanpe/caster.toml`. Every field has a
//! default, so a missing file yields a fully usable config.

use crate::backoff;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level caster configuration.
#[derive(Debug, Clone)]
pub struct CasterConfig {
    pub schema_version: u32,
    /// Name sent in `client_hello` and stamped on feedback.
    pub client_name: String,
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full hub URL, e.g. `ws://192.168.1.10:9876/ws`.
    pub server_address: String,
    /// Monitor IDs this caster renders; may be empty.
    pub display_monitor_ids: Vec<String>,
    pub auto_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Serve the loopback control API for Stream Deck / web-caster bridges.
    pub enabled: bool,
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: "ws://127.0.0.1:9876/ws".to_owned(),
            display_monitor_ids: Vec::new(),
            auto_reconnect: true,
            initial_backoff: backoff::DEFAULT_INITIAL,
            max_backoff: backoff::DEFAULT_MAX,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9877,
        }
    }
}

impl Default for CasterConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            client_name: "Caster".to_owned(),
            session: SessionConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    client_name: Option<String>,
    session: Option<RawSessionConfig>,
    bridge: Option<RawBridgeConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    server_address: Option<String>,
    display_monitor_ids: Option<Vec<String>>,
    auto_reconnect: Option<bool>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBridgeConfig {
    enabled: Option<bool>,
    port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load caster config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<CasterConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load caster config from the default path `/etc/bi-kanpe/caster.toml`,
/// falling back to defaults when the file does not exist.
pub fn load_config() -> Result<CasterConfig, ConfigError> {
    let path = Path::new("/etc/bi-kanpe/caster.toml");
    if path.exists() {
        load_config_from_path(path)
    } else {
        Ok(CasterConfig::default())
    }
}

/// Load caster config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<CasterConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let client_name = match raw.client_name {
        Some(name) if name.trim().is_empty() => {
            return Err(ConfigError::InvalidValue(
                "client_name must not be empty".to_owned(),
            ));
        }
        Some(name) => name,
        None => CasterConfig::default().client_name,
    };

    let session_defaults = SessionConfig::default();
    let session = match raw.session {
        Some(s) => SessionConfig {
            server_address: s
                .server_address
                .map_or(session_defaults.server_address.clone(), |a| {
                    normalize_server_address(&a)
                }),
            display_monitor_ids: s.display_monitor_ids.unwrap_or_default(),
            auto_reconnect: s.auto_reconnect.unwrap_or(true),
            initial_backoff: s
                .initial_backoff_ms
                .map_or(session_defaults.initial_backoff, Duration::from_millis),
            max_backoff: s
                .max_backoff_ms
                .map_or(session_defaults.max_backoff, Duration::from_millis),
        },
        None => session_defaults,
    };

    let bridge = match raw.bridge {
        Some(b) => BridgeConfig {
            enabled: b.enabled.unwrap_or(true),
            port: b.port.unwrap_or(9877),
        },
        None => BridgeConfig::default(),
    };

    Ok(CasterConfig {
        schema_version,
        client_name,
        session,
        bridge,
    })
}

/// Normalize a hub address: prepend `ws://` when no scheme is present and
/// append the `/ws` path when none is given.
pub fn normalize_server_address(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let with_scheme = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_owned()
    } else {
        format!("ws://{trimmed}")
    };
    let after_scheme = with_scheme
        .split_once("://")
        .map_or("", |(_, rest)| rest);
    if after_scheme.contains('/') {
        with_scheme
    } else {
        format!("{with_scheme}/ws")
    }
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

//! Configuration loading, placeholder interpolation, and validation.
//!
//! The config file is JSON; default path `/etc/polaris/config.json`.
//! `${VAR}` and `${VAR:-default}` placeholders anywhere in string values
//! are resolved against, in order:
//! CLI overrides → environment variables → encrypted secrets → default.
//! A bare `${VAR}` that resolves nowhere is a config error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub instance_id: String,
    pub polaris: PolarisConfig,
    pub filter: FilterConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Polaris API connection settings.
#[derive(Debug, Clone, Serialize)]
pub struct PolarisConfig {
    pub api_url: String,
    pub api_key: String,
    pub subscription: String,
    pub reconnect: ReconnectConfig,
}

/// Reconnection backoff parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_pct: f64,
}

/// Event filtering rules.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterConfig {
    pub drop_states: Vec<String>,
    pub drop_device_ids: Vec<String>,
    pub keep_device_ids: Vec<String>,
}

/// Output section wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct OutputConfig {
    pub file: FileOutputConfig,
}

/// File-mode output settings.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutputConfig {
    pub output_dir: String,
    pub file_prefix: String,
    pub rotation: RotationConfig,
    pub flush: FlushConfig,
}

/// File rotation thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct RotationConfig {
    pub interval_seconds: u64,
    pub max_size_bytes: u64,
}

/// File flush settings.
#[derive(Debug, Clone, Serialize)]
pub struct FlushConfig {
    pub interval_ms: u64,
    pub every_n_events: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub redact_patterns: Vec<String>,
    pub file: LogFileConfig,
}

/// Optional log-file output settings.
#[derive(Debug, Clone, Serialize)]
pub struct LogFileConfig {
    pub enabled: bool,
    pub path: String,
    pub max_size_bytes: u64,
    pub backup_count: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_pct: 20.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw JSON deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    instance_id: Option<String>,
    polaris: Option<RawPolarisConfig>,
    filter: Option<RawFilterConfig>,
    output: Option<RawOutputConfig>,
    logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolarisConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    subscription: Option<String>,
    reconnect: Option<RawReconnectConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReconnectConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    jitter_pct: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFilterConfig {
    drop_states: Option<Vec<String>>,
    drop_device_ids: Option<Vec<String>>,
    keep_device_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOutputConfig {
    file: Option<RawFileOutputConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFileOutputConfig {
    output_dir: Option<String>,
    file_prefix: Option<String>,
    rotation: Option<RawRotationConfig>,
    flush: Option<RawFlushConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRotationConfig {
    interval_seconds: Option<u64>,
    max_size_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFlushConfig {
    interval_ms: Option<u64>,
    every_n_events: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLoggingConfig {
    level: Option<String>,
    redact_patterns: Option<Vec<String>>,
    file: Option<RawLogFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogFileConfig {
    enabled: Option<bool>,
    path: Option<String>,
    max_size_bytes: Option<u64>,
    backup_count: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(
        "required variable ${{{0}}} is not set in CLI overrides, environment, or encrypted secrets"
    )]
    UnresolvedVar(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load, interpolate, validate, and return the application config.
pub fn load_config(
    path: &Path,
    overrides: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Result<AppConfig, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&json, overrides, secrets)
}

/// Load config from a JSON string (see [`load_config`]).
pub fn load_config_from_str(
    json: &str,
    overrides: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Result<AppConfig, ConfigError> {
    let raw_value: Value = serde_json::from_str(json)?;
    let interpolated = walk_and_interpolate(raw_value, overrides, secrets)?;
    let raw: RawConfig = serde_json::from_value(interpolated)?;
    validate(raw_to_config(raw))
}

// ---------------------------------------------------------------------------
// Placeholder interpolation
// ---------------------------------------------------------------------------

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("placeholder pattern is valid")
    })
}

fn resolve_var(
    name: &str,
    default: Option<&str>,
    overrides: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Result<String, ConfigError> {
    if let Some(v) = overrides.get(name) {
        return Ok(v.clone());
    }
    if let Ok(v) = std::env::var(name) {
        return Ok(v);
    }
    if let Some(v) = secrets.get(name) {
        return Ok(v.clone());
    }
    if let Some(d) = default {
        return Ok(d.to_owned());
    }
    Err(ConfigError::UnresolvedVar(name.to_owned()))
}

fn interpolate_str(
    value: &str,
    overrides: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Result<String, ConfigError> {
    let pattern = var_pattern();
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let whole = caps.get(0).expect("capture group 0 always present");
        let name = caps.get(1).expect("group 1 is the variable name").as_str();
        let default = caps.get(2).map(|m| m.as_str());
        out.push_str(&value[last..whole.start()]);
        out.push_str(&resolve_var(name, default, overrides, secrets)?);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Recursively interpolate all string values in a JSON tree.
fn walk_and_interpolate(
    value: Value,
    overrides: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Result<Value, ConfigError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate_str(&s, overrides, secrets)?),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, walk_and_interpolate(v, overrides, secrets)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| walk_and_interpolate(v, overrides, secrets))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}

// ---------------------------------------------------------------------------
// Raw → typed conversion with defaults
// ---------------------------------------------------------------------------

fn raw_to_config(raw: RawConfig) -> AppConfig {
    let polaris = raw.polaris.unwrap_or_default();
    let reconnect = polaris.reconnect.unwrap_or_default();
    let filter = raw.filter.unwrap_or_default();
    let output = raw.output.unwrap_or_default();
    let file = output.file.unwrap_or_default();
    let rotation = file.rotation.unwrap_or_default();
    let flush = file.flush.unwrap_or_default();
    let logging = raw.logging.unwrap_or_default();
    let log_file = logging.file.unwrap_or_default();

    AppConfig {
        instance_id: raw.instance_id.unwrap_or_else(|| "writer-01".to_owned()),
        polaris: PolarisConfig {
            api_url: polaris
                .api_url
                .unwrap_or_else(|| "wss://graphql.pointonenav.com/subscriptions".to_owned()),
            api_key: polaris.api_key.unwrap_or_default(),
            subscription: polaris.subscription.unwrap_or_else(|| "devices".to_owned()),
            reconnect: ReconnectConfig {
                initial_delay_ms: reconnect.initial_delay_ms.unwrap_or(1000),
                max_delay_ms: reconnect.max_delay_ms.unwrap_or(60_000),
                backoff_multiplier: reconnect.backoff_multiplier.unwrap_or(2.0),
                jitter_pct: reconnect.jitter_pct.unwrap_or(20.0),
            },
        },
        filter: FilterConfig {
            drop_states: filter
                .drop_states
                .unwrap_or_else(|| vec!["undefined".to_owned(), "error".to_owned()]),
            drop_device_ids: filter.drop_device_ids.unwrap_or_default(),
            keep_device_ids: filter.keep_device_ids.unwrap_or_default(),
        },
        output: OutputConfig {
            file: FileOutputConfig {
                output_dir: file
                    .output_dir
                    .unwrap_or_else(|| "/var/lib/polaris/data".to_owned()),
                file_prefix: file.file_prefix.unwrap_or_else(|| "events".to_owned()),
                rotation: RotationConfig {
                    interval_seconds: rotation.interval_seconds.unwrap_or(600),
                    max_size_bytes: rotation.max_size_bytes.unwrap_or(52_428_800),
                },
                flush: FlushConfig {
                    interval_ms: flush.interval_ms.unwrap_or(1000),
                    every_n_events: flush.every_n_events.unwrap_or(50),
                },
            },
        },
        logging: LoggingConfig {
            level: logging.level.unwrap_or_else(|| "info".to_owned()),
            redact_patterns: logging.redact_patterns.unwrap_or_else(|| {
                vec![
                    "*key*".to_owned(),
                    "*token*".to_owned(),
                    "*secret*".to_owned(),
                    "*password*".to_owned(),
                ]
            }),
            file: LogFileConfig {
                enabled: log_file.enabled.unwrap_or(false),
                path: log_file
                    .path
                    .unwrap_or_else(|| "/var/log/polaris-subclient/app.log".to_owned()),
                max_size_bytes: log_file.max_size_bytes.unwrap_or(10_485_760),
                backup_count: log_file.backup_count.unwrap_or(5),
            },
        },
    }
}

fn validate(config: AppConfig) -> Result<AppConfig, ConfigError> {
    if !matches!(
        config.logging.level.as_str(),
        "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::InvalidValue(format!(
            "logging.level must be one of debug/info/warn/error, got '{}'",
            config.logging.level
        )));
    }
    if config.polaris.reconnect.backoff_multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(format!(
            "polaris.reconnect.backoff_multiplier must be >= 1, got {}",
            config.polaris.reconnect.backoff_multiplier
        )));
    }
    if !(0.0..=100.0).contains(&config.polaris.reconnect.jitter_pct) {
        return Err(ConfigError::InvalidValue(format!(
            "polaris.reconnect.jitter_pct must be between 0 and 100, got {}",
            config.polaris.reconnect.jitter_pct
        )));
    }
    if config.output.file.rotation.max_size_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "output.file.rotation.max_size_bytes must be positive".to_owned(),
        ));
    }
    Ok(config)
}

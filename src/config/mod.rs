use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "mediaqueue.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub queues: QueuesConfig,
    pub udp: UdpConfig,
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.mediaqueue/data".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueuesConfig {
    pub pause_poll_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub slow_command_warn_ms: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval_ms: 200,
            idle_interval_ms: 1_000,
            slow_command_warn_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct UdpConfig {
    pub enabled: bool,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub ban_cooldown_minutes: u64,
    pub short_delay_ms: u64,
    pub long_delay_ms: u64,
    pub short_term_period_minutes: u64,
    pub throttle_reset_minutes: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_host: "api.anidb.net".to_owned(),
            remote_port: 9000,
            local_port: 4556,
            ban_cooldown_minutes: 90,
            short_delay_ms: 2_500,
            long_delay_ms: 4_000,
            short_term_period_minutes: 60,
            throttle_reset_minutes: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub base_url: String,
    pub ban_cooldown_hours: u64,
    pub min_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://api.anidb.net:9001/httpapi".to_owned(),
            ban_cooldown_hours: 12,
            min_interval_ms: 2_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, the working directory or
    /// `$HOME/.mediaqueue/config.toml`, then applies the remaining `--section.key value`
    /// arguments as overrides. Falls back to built-in defaults when no file exists.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, remaining) = extract_config_path(args)?;

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, remaining);
        }

        match discover_config_path() {
            Some(path) => Self::load_from_toml_with_args(path, remaining),
            None => Self::load_defaults_with_args(remaining),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let parsed: Self = toml::from_str(&toml_content).map_err(|source| ConfigError::TomlParse {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        parsed.with_overrides(args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::default().with_overrides(args)
    }

    /// Overrides are type-checked against the value already present, so the file
    /// is first merged with defaults and re-serialized.
    fn with_overrides(self, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        if overrides.is_empty() {
            return Ok(self);
        }

        let mut root_value = Value::try_from(&self).map_err(ConfigError::Serialize)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

fn extract_config_path(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut explicit = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            explicit = Some(PathBuf::from(path));
        } else {
            remaining.push(arg);
        }
    }

    Ok((explicit, remaining))
}

fn discover_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }

    let home = std::env::var("HOME").ok()?;
    let in_home = PathBuf::from(home).join(".mediaqueue").join("config.toml");
    in_home.is_file().then_some(in_home)
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to serialize config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let Some((final_key, sections)) = parts.split_last() else {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    };

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(*final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mediaqueue-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    const SAMPLE: &str = r#"
[logging]
level = "debug"
human_friendly = false

[storage]
engine = "memory"
path = "/tmp/mediaqueue"

[udp]
enabled = true
remote_host = "127.0.0.1"
remote_port = 9000
local_port = 4556
"#;

    #[test]
    fn loads_partial_toml_and_fills_defaults() {
        let path = write_temp_config(SAMPLE, "defaults");

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.engine, "memory");
        assert!(config.udp.enabled);
        assert_eq!(config.udp.ban_cooldown_minutes, 90);
        assert_eq!(config.queues.pause_poll_interval_ms, 200);
        assert_eq!(config.http.ban_cooldown_hours, 12);
        assert!(!config.http.enabled);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(SAMPLE, "override");

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "warn".to_owned(),
                "--udp.local_port".to_owned(),
                "4600".to_owned(),
                "--http.enabled".to_owned(),
                "true".to_owned(),
            ],
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.udp.local_port, 4600);
        assert!(config.http.enabled);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--logging.nonexistent".to_owned(),
            "x".to_owned(),
        ])
        .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_mistyped_override_value() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--queues.idle_interval_ms".to_owned(),
            "soon".to_owned(),
        ])
        .expect_err("non-integer override should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn explicit_config_flag_is_consumed_before_overrides() {
        let path = write_temp_config(SAMPLE, "discovery");

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--storage.path".to_owned(),
            "/var/lib/mediaqueue".to_owned(),
        ])
        .expect("explicit config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.storage.engine, "memory");
        assert_eq!(config.storage.path, "/var/lib/mediaqueue");
    }

    #[test]
    fn missing_config_flag_value_is_reported() {
        let err = AppConfig::load_with_discovery(vec!["--config".to_owned()])
            .expect_err("dangling --config should fail");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }
}

//! Bridge configuration, loaded from TOML.
//!
//! ```toml
//! [limits]
//! max_handles = 1048576
//! max_callbacks = 65536
//!
//! [protocol]
//! import_module = "env"
//! legacy_inline_calls = true
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Resource ceilings enforced against guest requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Live entries in the object reference table.
    #[serde(default = "LimitsConfig::default_max_handles")]
    pub max_handles: usize,

    /// Registered callbacks over the lifetime of a bridge.
    #[serde(default = "LimitsConfig::default_max_callbacks")]
    pub max_callbacks: usize,

    /// Size of a single callback source text, in bytes.
    #[serde(default = "LimitsConfig::default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Size of an encoded argument buffer, in bytes.
    #[serde(default = "LimitsConfig::default_max_args_bytes")]
    pub max_args_bytes: usize,

    /// Size of a text or byte result copied into guest memory.
    #[serde(default = "LimitsConfig::default_max_result_bytes")]
    pub max_result_bytes: usize,
}

impl LimitsConfig {
    fn default_max_handles() -> usize {
        1 << 20
    }

    fn default_max_callbacks() -> usize {
        1 << 16
    }

    fn default_max_source_bytes() -> usize {
        64 * 1024
    }

    fn default_max_args_bytes() -> usize {
        16 * 1024 * 1024
    }

    fn default_max_result_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_handles: Self::default_max_handles(),
            max_callbacks: Self::default_max_callbacks(),
            max_source_bytes: Self::default_max_source_bytes(),
            max_args_bytes: Self::default_max_args_bytes(),
            max_result_bytes: Self::default_max_result_bytes(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Wasm import module the bridge functions are registered under.
    #[serde(default = "ProtocolConfig::default_import_module")]
    pub import_module: String,

    /// Also register the `__invoke_and_return*` imports that compile source on every call.
    #[serde(default = "ProtocolConfig::default_legacy_inline_calls")]
    pub legacy_inline_calls: bool,
}

impl ProtocolConfig {
    fn default_import_module() -> String {
        nova_bridge_abi::IMPORT_MODULE.to_owned()
    }

    fn default_legacy_inline_calls() -> bool {
        true
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            import_module: Self::default_import_module(),
            legacy_inline_calls: Self::default_legacy_inline_calls(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective filter: `level` merged with `RUST_LOG` when that is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending source line; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

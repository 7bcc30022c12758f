use std::collections::BTreeMap;

use config::Config;
use error_stack::{Report, ResultExt};
use serde::Deserialize;
use serde_path_to_error::{Deserializer as PathDeserializer, Segment, Track};

use super::blockchain_config::{ChainConfig, ProviderConfig};
use super::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "Config";

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_initial_lag() -> u64 {
    5
}

fn default_max_blocks_per_scan() -> u64 {
    100
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    pub chains: BTreeMap<String, ChainConfig>,
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            jitter: true,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "BackoffConfig::default_multiplier")]
        multiplier: f64,
    },
}

impl BackoffConfig {
    fn default_multiplier() -> f64 {
        2.0
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: Self::default_multiplier(),
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ScannerConfig {
    /// How far behind the head the first scan of a chain starts when no cursor exists yet.
    #[serde(default = "default_initial_lag")]
    pub initial_lag: u64,
    #[serde(default = "default_max_blocks_per_scan")]
    pub max_blocks_per_scan: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            initial_lag: default_initial_lag(),
            max_blocks_per_scan: default_max_blocks_per_scan(),
        }
    }
}

impl AppConfig {
    /// Loads the file named by `CONFIG_PATH` (default `Config.*`), overlaid with `EXPLORER__*`
    /// environment variables.
    pub fn load() -> error_stack::Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> error_stack::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix("EXPLORER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .change_context_lazy(|| ConfigError::LoadError(config_path.to_string()))?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> error_stack::Result<Self, ConfigError> {
        let value = config
            .try_deserialize::<serde_json::Value>()
            .change_context(ConfigError::DeserializeError {
                path: String::new(),
            })
            .attach_printable("Config to JSON failed")?;
        Self::from_value(value)
    }

    /// Deserializes while tracking the field path, so a bad entry is reported as e.g.
    /// `providers.solana.kind` instead of a bare serde message.
    pub fn from_value(value: serde_json::Value) -> error_stack::Result<Self, ConfigError> {
        use serde::de::IntoDeserializer;
        let mut track = Track::new();
        let path_de = PathDeserializer::new(value.into_deserializer(), &mut track);
        AppConfig::deserialize(path_de).map_err(|e| {
            let path = track
                .path()
                .iter()
                .map(|seg| match seg {
                    Segment::Seq { index } => format!("[{}]", index),
                    Segment::Map { key } => format!(".{}", key),
                    Segment::Enum { variant } => format!("::{}", variant),
                    Segment::Unknown => String::from("<?>"),
                })
                .collect::<String>();
            Report::new(e).change_context(ConfigError::DeserializeError {
                path: path.trim_start_matches('.').to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::ProviderKind;
    use crate::domain::AddressFormat;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "chains": {
                "sol": {
                    "symbol": "SOL",
                    "precision": 9,
                    "address_format": "base58",
                    "operations": {
                        "block_head": ["solana_main"],
                        "tx_details": ["solana_main", "solana_backup"]
                    }
                }
            },
            "providers": {
                "solana_main": {"kind": "solana_rpc", "endpoint": "https://api.mainnet-beta.solana.com"},
                "solana_backup": {"kind": "solana_rpc", "endpoint": "https://backup.example", "timeout_secs": 5}
            }
        })
    }

    #[test]
    fn test_from_value_applies_defaults() {
        let config = AppConfig::from_value(sample()).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.scanner.initial_lag, 5);
        let sol = &config.chains["sol"];
        assert_eq!(sol.address_format, AddressFormat::Base58);
        assert_eq!(sol.operations.tx_details, vec!["solana_main", "solana_backup"]);
        assert!(sol.operations.balance.is_empty());
        assert_eq!(config.providers["solana_main"].kind, ProviderKind::SolanaRpc);
        assert_eq!(config.providers["solana_main"].timeout_secs, 30);
        assert_eq!(config.providers["solana_backup"].timeout_secs, 5);
    }

    #[test]
    fn test_from_value_reports_field_path() {
        let mut value = sample();
        value["providers"]["solana_main"]["kind"] = json!("not_a_provider");
        let report = AppConfig::from_value(value).unwrap_err();
        match report.current_context() {
            ConfigError::DeserializeError { path } => {
                assert_eq!(path, "providers.solana_main.kind")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_variants() {
        let mut value = sample();
        value["retry"] = json!({"max_attempts": 5, "backoff": {"kind": "fixed", "delay_ms": 100}});
        let config = AppConfig::from_value(value).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, BackoffConfig::Fixed { delay_ms: 100 });
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(
            &path,
            r#"
[scanner]
max_blocks_per_scan = 20

[chains.fil]
symbol = "FIL"
precision = 18
address_format = "filecoin"
min_valid_amount = "0.001"

[chains.fil.operations]
block_head = ["filscan"]
block_txs = ["filscan"]

[providers.filscan]
kind = "filscan"
endpoint = "https://api-v2.filscan.io/api/v1"
"#,
        )
        .unwrap();
        let name = dir.path().join("Config");
        let config = AppConfig::load_from(name.to_str().unwrap()).unwrap();
        assert_eq!(config.scanner.max_blocks_per_scan, 20);
        assert_eq!(config.chains["fil"].precision, 18);
        assert_eq!(config.providers["filscan"].kind, ProviderKind::Filscan);
    }
}

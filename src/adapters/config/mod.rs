pub mod app_config;
pub mod blockchain_config;

use thiserror::Error;

use crate::ports::OperationKind;

pub use app_config::{AppConfig, BackoffConfig, RetryConfig, ScannerConfig};
pub use blockchain_config::{ChainConfig, OperationProviders, ProviderConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration from '{0}'")]
    LoadError(String),
    #[error("Invalid configuration at '{path}'")]
    DeserializeError { path: String },
    #[error("Chain '{chain}' references unknown provider '{provider}'")]
    UnknownProvider { chain: String, provider: String },
    #[error("Provider '{provider}' cannot serve {operation}")]
    UnsupportedOperation {
        provider: String,
        operation: OperationKind,
    },
    #[error("Invalid settings for chain '{0}'")]
    InvalidChain(String),
    #[error("Failed to set up provider '{0}'")]
    ProviderSetup(String),
}

//! Multi-chain block explorer aggregation: per-chain provider failover, normalized transfers and
//! cursor-driven block range scans.

pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapters::config::{AppConfig, ConfigError};
pub use application::{
    build_explorer, ExplorerError, MultiChainExplorer, ScanError, ScanOutcome, TxDirection,
};
pub use domain::{BalanceRecord, ChainSpec, TransferMaps, TransferTx, TxDetails};

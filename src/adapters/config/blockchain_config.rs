use std::str::FromStr;

use bigdecimal::BigDecimal;
use error_stack::{Report, ResultExt};

use super::ConfigError;
use crate::adapters::providers::ProviderKind;
use crate::domain::{AddressFormat, ChainSpec};
use crate::ports::OperationKind;

fn default_timeout_secs() -> u64 {
    30
}

fn default_penalty_secs() -> u64 {
    30
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ChainConfig {
    pub symbol: String,
    pub precision: u32,
    pub address_format: AddressFormat,
    #[serde(default)]
    pub bech32_hrp: Option<String>,
    #[serde(default)]
    pub denom: Option<String>,
    /// Decimal string in display units, e.g. `"0.025"`.
    #[serde(default)]
    pub min_valid_amount: Option<String>,
    #[serde(default)]
    pub block_height_offset: u64,
    /// Overrides the scanner-wide range cap for this chain.
    #[serde(default)]
    pub max_blocks_per_scan: Option<u64>,
    pub operations: OperationProviders,
}

impl ChainConfig {
    pub fn to_spec(&self, id: &str) -> error_stack::Result<ChainSpec, ConfigError> {
        if self.address_format == AddressFormat::Bech32 && self.bech32_hrp.is_none() {
            return Err(Report::new(ConfigError::InvalidChain(id.to_string()))
                .attach_printable("bech32 chains need a bech32_hrp"));
        }
        let mut spec = ChainSpec::new(id, &self.symbol, self.precision, self.address_format)
            .with_block_height_offset(self.block_height_offset);
        if let Some(hrp) = &self.bech32_hrp {
            spec = spec.with_bech32_hrp(hrp);
        }
        if let Some(denom) = &self.denom {
            spec = spec.with_denom(denom);
        }
        if let Some(amount) = &self.min_valid_amount {
            let amount = BigDecimal::from_str(amount)
                .change_context_lazy(|| ConfigError::InvalidChain(id.to_string()))
                .attach_printable_lazy(|| format!("min_valid_amount is not a decimal: {amount}"))?;
            spec = spec.with_min_valid_amount(amount);
        }
        Ok(spec)
    }
}

/// Provider ids per operation, in priority order.
#[derive(serde::Deserialize, Debug, Clone, Default)]
pub struct OperationProviders {
    #[serde(default)]
    pub block_head: Vec<String>,
    #[serde(default)]
    pub balance: Vec<String>,
    #[serde(default)]
    pub tx_details: Vec<String>,
    #[serde(default)]
    pub address_txs: Vec<String>,
    #[serde(default)]
    pub block_txs: Vec<String>,
}

impl OperationProviders {
    pub fn for_operation(&self, operation: OperationKind) -> &[String] {
        match operation {
            OperationKind::BlockHead => &self.block_head,
            OperationKind::Balance => &self.balance,
            OperationKind::TxDetails => &self.tx_details,
            OperationKind::AddressTxs => &self.address_txs,
            OperationKind::BlockTxs => &self.block_txs,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Items per batched request. Capped at the provider's documented maximum.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default = "default_penalty_secs")]
    pub rate_limit_penalty_secs: u64,
    /// Transactions requested per page on address-indexed endpoints.
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, endpoint: &str) -> Self {
        Self {
            kind,
            endpoint: endpoint.to_string(),
            timeout_secs: default_timeout_secs(),
            batch_size: None,
            api_key: None,
            requests_per_second: None,
            rate_limit_penalty_secs: default_penalty_secs(),
            page_size: None,
        }
    }

    /// Configured batch size, bounded by `max`.
    pub fn batch_size_or(&self, default: usize, max: usize) -> usize {
        self.batch_size.unwrap_or(default).clamp(1, max)
    }

    pub fn page_size_or(&self, default: usize) -> usize {
        self.page_size.unwrap_or(default).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_is_capped() {
        let mut config = ProviderConfig::new(ProviderKind::SolanaRpc, "http://localhost");
        assert_eq!(config.batch_size_or(50, 100), 50);
        config.batch_size = Some(1000);
        assert_eq!(config.batch_size_or(50, 100), 100);
        config.batch_size = Some(0);
        assert_eq!(config.batch_size_or(50, 100), 1);
    }

    #[test]
    fn test_bech32_chain_needs_hrp() {
        let chain = ChainConfig {
            symbol: "ATOM".to_string(),
            precision: 6,
            address_format: AddressFormat::Bech32,
            bech32_hrp: None,
            denom: None,
            min_valid_amount: None,
            block_height_offset: 0,
            max_blocks_per_scan: None,
            operations: OperationProviders::default(),
        };
        let report = chain.to_spec("atom").unwrap_err();
        assert!(matches!(report.current_context(), ConfigError::InvalidChain(id) if id == "atom"));
    }
}

pub mod aptos_node;
pub mod blockbook;
pub mod cosmos_lcd;
pub mod etherscan;
pub mod filscan;
pub mod solana_rpc;

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};

use super::config::ProviderConfig;
use super::http::HttpTransport;
use crate::domain::{ChainSpec, TransferTx};
use crate::ports::{ProviderEntry, ProviderError, ProviderResult};

/// Provider implementations selectable from configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    /// Etherscan-compatible explorer APIs (account-based EVM chains).
    Etherscan,
    /// Blockbook indexers (UTXO chains).
    Blockbook,
    /// Solana JSON-RPC nodes.
    SolanaRpc,
    /// Aptos fullnode REST API.
    AptosNode,
    /// Filscan explorer API (Filecoin).
    Filscan,
    /// Cosmos SDK LCD/REST endpoints.
    CosmosLcd,
}

impl ProviderKind {
    /// Builds the client/parser pair for `chain`. The client owns its own HTTP pool and rate
    /// limiter, so one entry should be shared by every operation the provider serves.
    pub fn build(
        self,
        name: &str,
        config: &ProviderConfig,
        chain: Arc<ChainSpec>,
    ) -> ProviderResult<ProviderEntry> {
        let transport = HttpTransport::from_config(name, config)?;
        let entry = match self {
            ProviderKind::Etherscan => ProviderEntry::new(
                Arc::new(etherscan::EtherscanClient::new(transport, config)),
                Arc::new(etherscan::EtherscanParser::new(chain)),
            ),
            ProviderKind::Blockbook => ProviderEntry::new(
                Arc::new(blockbook::BlockbookClient::new(transport, config)),
                Arc::new(blockbook::BlockbookParser::new(chain)),
            ),
            ProviderKind::SolanaRpc => ProviderEntry::new(
                Arc::new(solana_rpc::SolanaRpcClient::new(transport, config)),
                Arc::new(solana_rpc::SolanaRpcParser::new(chain)),
            ),
            ProviderKind::AptosNode => ProviderEntry::new(
                Arc::new(aptos_node::AptosNodeClient::new(transport, config)),
                Arc::new(aptos_node::AptosNodeParser::new(chain)),
            ),
            ProviderKind::Filscan => ProviderEntry::new(
                Arc::new(filscan::FilscanClient::new(transport, config)),
                Arc::new(filscan::FilscanParser::new(chain)),
            ),
            ProviderKind::CosmosLcd => ProviderEntry::new(
                Arc::new(cosmos_lcd::CosmosLcdClient::new(transport, config)),
                Arc::new(cosmos_lcd::CosmosLcdParser::new(chain)),
            ),
        };
        Ok(entry)
    }
}

/// Successful native transfer with normalized addresses and no optional details. Parsers fill in
/// the rest with struct update syntax.
pub(crate) fn native_transfer(
    chain: &ChainSpec,
    hash: &str,
    block_height: u64,
    timestamp: DateTime<Utc>,
    from: &str,
    to: &str,
    value: BigDecimal,
) -> TransferTx {
    TransferTx {
        hash: hash.to_string(),
        block_height,
        block_hash: None,
        timestamp,
        from_address: chain.normalize_address(from),
        to_address: chain.normalize_address(to),
        value,
        symbol: chain.symbol.clone(),
        token: None,
        fee: None,
        success: true,
        confirmations: None,
        memo: None,
        raw: None,
    }
}

pub(crate) fn parse_amount(chain: &ChainSpec, raw: &str) -> ProviderResult<BigDecimal> {
    chain
        .parse_amount(raw)
        .change_context(ProviderError::Malformed)
        .attach_printable_lazy(|| format!("Amount: {raw:?}"))
}

/// Block heights arrive as decimal strings, hex quantities, or plain numbers depending on the
/// provider.
pub(crate) fn parse_height(raw: &str) -> ProviderResult<u64> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => trimmed.parse::<u64>().ok(),
    };
    parsed.ok_or_else(|| {
        Report::new(ProviderError::Malformed).attach_printable(format!("Not a height: {raw:?}"))
    })
}

pub(crate) fn timestamp_from_secs(secs: i64) -> ProviderResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        Report::new(ProviderError::Malformed).attach_printable(format!("Bad timestamp: {secs}"))
    })
}

pub(crate) fn timestamp_from_micros(micros: i64) -> ProviderResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        Report::new(ProviderError::Malformed).attach_printable(format!("Bad timestamp: {micros}"))
    })
}

pub(crate) fn timestamp_from_rfc3339(raw: &str) -> ProviderResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .change_context(ProviderError::Malformed)
        .attach_printable_lazy(|| format!("Bad timestamp: {raw:?}"))
}

pub(crate) fn malformed(message: impl Into<String>) -> Report<ProviderError> {
    Report::new(ProviderError::Malformed).attach_printable(message.into())
}

/// Splits `[from, to]` into consecutive inclusive ranges of at most `size` heights.
pub(crate) fn height_chunks(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(size - 1).min(to);
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

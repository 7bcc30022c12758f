use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use error_stack::Report;
use futures::{stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::{BalanceRecord, TransferTx, TxDetails};

/// Untouched provider response. Parsers decode it with strict schemas.
pub type RawPayload = serde_json::Value;

pub type ProviderResult<T> = error_stack::Result<T, ProviderError>;

/// Number of single-address requests issued concurrently when a provider has no batch endpoint.
pub const DEFAULT_FANOUT: usize = 8;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    BlockHead,
    Balance,
    TxDetails,
    AddressTxs,
    BlockTxs,
}

/// Classified failure of a single provider call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider call timed out")]
    Timeout,
    #[error("Provider is rate limiting us")]
    RateLimited,
    #[error("Transport error while talking to provider")]
    TransportError,
    #[error("Provider payload does not match the expected schema")]
    Malformed,
    #[error("Provider has no data for the request")]
    NotFound,
    #[error("Provider rejected our credentials")]
    Unauthorized,
    #[error("Operation {0} is not supported by this provider")]
    Unsupported(OperationKind),
}

impl ProviderError {
    /// Transient failures are worth retrying against the same provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::TransportError
        )
    }
}

fn unsupported<T>(provider: &str, operation: OperationKind) -> ProviderResult<T> {
    Err(Report::new(ProviderError::Unsupported(operation))
        .attach_printable(format!("Provider: {provider}")))
}

/// Raw network access to one provider. Implementations only do I/O: each call is bounded by the
/// client timeout and either yields the provider payload or a classified [`ProviderError`].
#[async_trait]
pub trait ProviderClient: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn supports(&self, operation: OperationKind) -> bool;

    /// Classifies an error carried inside an otherwise successful HTTP response.
    fn classify_error(&self, _payload: &RawPayload) -> Option<ProviderError> {
        None
    }

    fn checked(&self, payload: RawPayload) -> ProviderResult<RawPayload> {
        match self.classify_error(&payload) {
            Some(class) => Err(Report::new(class)
                .attach_printable(format!("Provider: {}", self.name()))
                .attach_printable(format!("Payload: {payload}"))),
            None => Ok(payload),
        }
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        unsupported(self.name(), OperationKind::BlockHead)
    }

    async fn get_balance(&self, _address: &str) -> ProviderResult<RawPayload> {
        unsupported(self.name(), OperationKind::Balance)
    }

    /// One payload per request issued, in input order. Providers without a batch endpoint fan out
    /// single-address requests.
    async fn get_balances(&self, addresses: &[String]) -> ProviderResult<Vec<RawPayload>> {
        let requests: Vec<_> = addresses
            .iter()
            .map(|address| self.get_balance(address))
            .collect();
        stream::iter(requests)
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }

    async fn get_tx_details(&self, _hash: &str) -> ProviderResult<RawPayload> {
        unsupported(self.name(), OperationKind::TxDetails)
    }

    /// One payload per hash, in input order, `null` for a hash the provider does not know.
    /// Providers without a batch endpoint fan out single lookups.
    async fn get_tx_details_batch(&self, hashes: &[String]) -> ProviderResult<Vec<RawPayload>> {
        let lookups: Vec<_> = hashes
            .iter()
            .map(|hash| async move {
                match self.get_tx_details(hash).await {
                    Err(report) if *report.current_context() == ProviderError::NotFound => {
                        Ok(RawPayload::Null)
                    }
                    other => other,
                }
            })
            .collect();
        stream::iter(lookups)
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }

    async fn get_address_txs(
        &self,
        _address: &str,
        _cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        unsupported(self.name(), OperationKind::AddressTxs)
    }

    /// One payload per request issued (block, page or chunk), in height order.
    async fn get_block_txs(
        &self,
        _from_height: u64,
        _to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        unsupported(self.name(), OperationKind::BlockTxs)
    }
}

/// Pure mapping from a provider's payloads to the canonical model.
pub trait ResponseParser: Send + Sync + Debug {
    fn parse_block_head(&self, _raw: &RawPayload) -> ProviderResult<u64> {
        unsupported("parser", OperationKind::BlockHead)
    }

    fn parse_balance(&self, _address: &str, _raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        unsupported("parser", OperationKind::Balance)
    }

    /// Default pairing for fan-out clients: exactly one payload per address.
    fn parse_balances(
        &self,
        addresses: &[String],
        raw: &[RawPayload],
    ) -> ProviderResult<Vec<BalanceRecord>> {
        if addresses.len() != raw.len() {
            return Err(Report::new(ProviderError::Malformed).attach_printable(format!(
                "Expected {} balance payloads, got {}",
                addresses.len(),
                raw.len()
            )));
        }
        addresses
            .iter()
            .zip(raw)
            .map(|(address, payload)| self.parse_balance(address, payload))
            .collect()
    }

    fn parse_tx_details(&self, _raw: &RawPayload, _head: Option<u64>) -> ProviderResult<TxDetails> {
        unsupported("parser", OperationKind::TxDetails)
    }

    /// Default pairing for batch lookups: one payload per hash, where `null` marks a hash the
    /// provider does not know and maps to [`TxDetails::Unsuccessful`].
    fn parse_tx_details_batch(
        &self,
        hashes: &[String],
        raw: &[RawPayload],
        head: Option<u64>,
    ) -> ProviderResult<Vec<TxDetails>> {
        if hashes.len() != raw.len() {
            return Err(Report::new(ProviderError::Malformed).attach_printable(format!(
                "Expected {} transaction payloads, got {}",
                hashes.len(),
                raw.len()
            )));
        }
        raw.iter()
            .map(|payload| match payload {
                RawPayload::Null => Ok(TxDetails::Unsuccessful),
                payload => self.parse_tx_details(payload, head),
            })
            .collect()
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        _raw: &RawPayload,
        _head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        unsupported("parser", OperationKind::AddressTxs)
    }

    fn parse_block_txs(
        &self,
        _raw: &[RawPayload],
        _head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        unsupported("parser", OperationKind::BlockTxs)
    }
}

/// A configured provider: its client and the parser that understands its payloads.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub client: Arc<dyn ProviderClient>,
    pub parser: Arc<dyn ResponseParser>,
}

impl ProviderEntry {
    pub fn new(client: Arc<dyn ProviderClient>, parser: Arc<dyn ResponseParser>) -> Self {
        Self { client, parser }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }
}

/// Strict decoding of a payload. Any missing or mistyped field is reported as
/// [`ProviderError::Malformed`] together with the offending field path.
pub fn decode<T: DeserializeOwned>(raw: &RawPayload) -> ProviderResult<T> {
    serde_path_to_error::deserialize(raw).map_err(|e| {
        let path = e.path().to_string();
        Report::new(e.into_inner())
            .change_context(ProviderError::Malformed)
            .attach_printable(format!("Field path: {path}"))
            .attach_printable(format!("Expected: {}", std::any::type_name::<T>()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(serde::Deserialize, Debug)]
    struct Sample {
        #[allow(dead_code)]
        result: Inner,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Inner {
        #[allow(dead_code)]
        height: u64,
    }

    #[test]
    fn test_transient_classes() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::TransportError.is_transient());
        assert!(!ProviderError::Malformed.is_transient());
        assert!(!ProviderError::NotFound.is_transient());
        assert!(!ProviderError::Unauthorized.is_transient());
        assert!(!ProviderError::Unsupported(OperationKind::BlockTxs).is_transient());
    }

    #[test]
    fn test_decode_missing_field_is_malformed() {
        let report = decode::<Sample>(&json!({"result": {}})).unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);
        assert!(format!("{report:?}").contains("result"));
    }

    #[test]
    fn test_decode_wrong_type_is_malformed() {
        let report = decode::<Sample>(&json!({"result": {"height": "12"}})).unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);
    }

    #[test]
    fn test_operation_kind_parses_from_config_names() {
        use std::str::FromStr;
        assert_eq!(OperationKind::from_str("tx_details").unwrap(), OperationKind::TxDetails);
        assert_eq!(OperationKind::BlockTxs.to_string(), "block_txs");
    }
}

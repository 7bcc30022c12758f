use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use tracing::instrument;

use super::{malformed, native_transfer, parse_amount, parse_height, timestamp_from_secs};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::{classify_rpc_payload, HttpTransport};
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderError, ProviderResult, RawPayload,
    ResponseParser, DEFAULT_FANOUT,
};

/// `balancemulti` accepts at most 20 addresses per call.
const MAX_BALANCES_PER_CALL: usize = 20;
const DEFAULT_PAGE_SIZE: usize = 50;

mod etherscan_responses {
    #[derive(serde::Deserialize, Debug)]
    pub struct AccountResponse<T> {
        pub status: String,
        pub message: String,
        pub result: T,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct MultiBalance {
        pub account: String,
        pub balance: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct ProxyResponse<T> {
        pub result: T,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct AccountTx {
        pub block_number: String,
        pub time_stamp: String,
        pub hash: String,
        pub block_hash: String,
        pub from: String,
        pub to: String,
        pub value: String,
        pub gas_used: String,
        pub gas_price: String,
        pub is_error: String,
        #[serde(rename = "txreceipt_status")]
        pub txreceipt_status: String,
        pub input: String,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct ProxyTransaction {
        pub hash: String,
        pub block_hash: Option<String>,
        pub block_number: Option<String>,
        pub from: String,
        pub to: Option<String>,
        pub value: String,
        pub gas_price: String,
        pub input: String,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct ProxyReceipt {
        pub status: String,
        pub gas_used: String,
        #[serde(default)]
        pub effective_gas_price: Option<String>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct ProxyBlock {
        pub timestamp: String,
    }

    /// What [`super::EtherscanClient::get_tx_details`] assembles from three proxy calls.
    #[derive(serde::Deserialize, Debug)]
    pub struct TxDetailsPayload {
        pub transaction: ProxyResponse<Option<ProxyTransaction>>,
        pub receipt: Option<ProxyResponse<Option<ProxyReceipt>>>,
        pub block: Option<ProxyResponse<Option<ProxyBlock>>>,
    }
}

use etherscan_responses::*;

#[derive(Debug)]
pub struct EtherscanClient {
    transport: HttpTransport,
    api_key: Option<String>,
    batch_size: usize,
    page_size: usize,
}

impl EtherscanClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            api_key: config.api_key.clone(),
            batch_size: config.batch_size_or(MAX_BALANCES_PER_CALL, MAX_BALANCES_PER_CALL),
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    async fn call(&self, params: &[(&str, String)]) -> ProviderResult<RawPayload> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        if let Some(api_key) = &self.api_key {
            query.push(("apikey", api_key.clone()));
        }
        let raw = self.transport.get_json_with("", &query).await?;
        self.checked(raw)
    }

    async fn proxy(&self, action: &str, extra: &[(&str, String)]) -> ProviderResult<RawPayload> {
        let mut params = vec![("module", "proxy".to_string()), ("action", action.to_string())];
        params.extend_from_slice(extra);
        self.call(&params).await
    }
}

#[async_trait]
impl ProviderClient for EtherscanClient {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn supports(&self, operation: OperationKind) -> bool {
        !matches!(operation, OperationKind::BlockTxs)
    }

    /// Etherscan answers HTTP 200 for everything; failures live in `status`/`result`.
    fn classify_error(&self, payload: &RawPayload) -> Option<ProviderError> {
        if let Some(class) = classify_rpc_payload(payload) {
            return Some(class);
        }
        let status = payload.get("status").and_then(|s| s.as_str())?;
        if status == "1" {
            return None;
        }
        let message = payload
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        if message.starts_with("No transactions found") {
            return None;
        }
        let result = payload
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_lowercase();
        if result.contains("rate limit") {
            Some(ProviderError::RateLimited)
        } else if result.contains("api key") || result.contains("apikey") {
            Some(ProviderError::Unauthorized)
        } else {
            Some(ProviderError::Malformed)
        }
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        self.proxy("eth_blockNumber", &[]).await
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.call(&[
            ("module", "account".to_string()),
            ("action", "balance".to_string()),
            ("address", address.to_string()),
            ("tag", "latest".to_string()),
        ])
        .await
    }

    #[instrument(skip(self, addresses), fields(provider = %self.name(), count = addresses.len()))]
    async fn get_balances(&self, addresses: &[String]) -> ProviderResult<Vec<RawPayload>> {
        let requests: Vec<_> = addresses
            .chunks(self.batch_size)
            .map(|chunk| {
                self.call_owned(vec![
                    ("module", "account".to_string()),
                    ("action", "balancemulti".to_string()),
                    ("address", chunk.join(",")),
                    ("tag", "latest".to_string()),
                ])
            })
            .collect();
        stream::iter(requests)
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        let txhash = [("txhash", hash.to_string())];
        let transaction = self.proxy("eth_getTransactionByHash", &txhash).await?;
        if transaction.get("result").map_or(true, |r| r.is_null()) {
            return Err(error_stack::Report::new(ProviderError::NotFound)
                .attach_printable(format!("Transaction {hash} not found")));
        }
        let block_number = transaction["result"]
            .get("blockNumber")
            .and_then(|b| b.as_str())
            .map(str::to_string);
        let Some(block_number) = block_number else {
            // pending: no receipt or block yet
            return Ok(serde_json::json!({
                "transaction": transaction,
                "receipt": null,
                "block": null,
            }));
        };
        let block_query = [("tag", block_number), ("boolean", "false".to_string())];
        let (receipt, block) = futures::try_join!(
            self.proxy("eth_getTransactionReceipt", &txhash),
            self.proxy("eth_getBlockByNumber", &block_query),
        )?;
        Ok(serde_json::json!({
            "transaction": transaction,
            "receipt": receipt,
            "block": block,
        }))
    }

    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        self.call(&[
            ("module", "account".to_string()),
            ("action", "txlist".to_string()),
            ("address", address.to_string()),
            ("startblock", "0".to_string()),
            ("endblock", "99999999".to_string()),
            ("page", cursor.unwrap_or("1").to_string()),
            ("offset", self.page_size.to_string()),
            ("sort", "desc".to_string()),
        ])
        .await
    }
}

impl EtherscanClient {
    async fn call_owned(&self, params: Vec<(&str, String)>) -> ProviderResult<RawPayload> {
        self.call(&params).await
    }
}

#[derive(Debug)]
pub struct EtherscanParser {
    chain: Arc<ChainSpec>,
}

impl EtherscanParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Plain value transfers carry no calldata.
    fn is_plain_transfer(input: &str) -> bool {
        input.is_empty() || input == "0x"
    }

    fn parse_account_tx(
        &self,
        tx: &AccountTx,
        head: Option<u64>,
    ) -> ProviderResult<Option<TransferTx>> {
        if !Self::is_plain_transfer(&tx.input) || tx.to.is_empty() {
            return Ok(None);
        }
        let value = parse_amount(&self.chain, &tx.value)?;
        if !self.chain.accepts_amount(&value) {
            return Ok(None);
        }
        let timestamp_secs = tx
            .time_stamp
            .parse::<i64>()
            .map_err(|_| malformed(format!("Bad timeStamp: {:?}", tx.time_stamp)))?;
        let gas_used = crate::domain::amount::parse_atomic(&tx.gas_used)
            .map_err(|e| malformed(e.to_string()))?;
        let gas_price = crate::domain::amount::parse_atomic(&tx.gas_price)
            .map_err(|e| malformed(e.to_string()))?;
        // receipt status is empty for pre-Byzantium blocks
        let success = tx.is_error == "0" && tx.txreceipt_status != "0";
        let transfer = TransferTx {
            block_hash: Some(tx.block_hash.clone()),
            fee: Some(self.chain.from_unit(&(gas_used * gas_price))),
            success,
            ..native_transfer(
                &self.chain,
                &tx.hash,
                parse_height(&tx.block_number)?,
                timestamp_from_secs(timestamp_secs)?,
                &tx.from,
                &tx.to,
                value,
            )
        };
        Ok(Some(transfer.with_head(head)))
    }
}

impl ResponseParser for EtherscanParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        let response: ProxyResponse<String> = decode(raw)?;
        parse_height(&response.result)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let response: AccountResponse<String> = decode(raw)?;
        let balance = parse_amount(&self.chain, &response.result)?;
        Ok(BalanceRecord::from_balance(
            &self.chain.normalize_address(address),
            balance,
        ))
    }

    fn parse_balances(
        &self,
        addresses: &[String],
        raw: &[RawPayload],
    ) -> ProviderResult<Vec<BalanceRecord>> {
        let mut balances = HashMap::new();
        for payload in raw {
            let response: AccountResponse<Vec<MultiBalance>> = decode(payload)?;
            for entry in response.result {
                let balance = parse_amount(&self.chain, &entry.balance)?;
                balances.insert(self.chain.normalize_address(&entry.account), balance);
            }
        }
        addresses
            .iter()
            .map(|address| {
                let address = self.chain.normalize_address(address);
                let balance = balances
                    .remove(&address)
                    .ok_or_else(|| malformed(format!("No balance returned for {address}")))?;
                Ok(BalanceRecord::from_balance(&address, balance))
            })
            .collect()
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let payload: TxDetailsPayload = decode(raw)?;
        let transaction = payload
            .transaction
            .result
            .ok_or_else(|| malformed("Transaction result is null"))?;
        let (Some(receipt), Some(block)) = (
            payload.receipt.and_then(|r| r.result),
            payload.block.and_then(|b| b.result),
        ) else {
            return Ok(TxDetails::Unsuccessful);
        };
        let Some(to) = transaction.to.as_deref() else {
            return Ok(TxDetails::Unsuccessful);
        };
        if !Self::is_plain_transfer(&transaction.input) || receipt.status != "0x1" {
            return Ok(TxDetails::Unsuccessful);
        }
        let value = parse_amount(&self.chain, &transaction.value)?;
        if !self.chain.accepts_amount(&value) {
            return Ok(TxDetails::Unsuccessful);
        }
        let block_number = transaction
            .block_number
            .as_deref()
            .ok_or_else(|| malformed("Mined transaction without blockNumber"))?;
        let gas_used = crate::domain::amount::parse_atomic(&receipt.gas_used)
            .map_err(|e| malformed(e.to_string()))?;
        let gas_price = crate::domain::amount::parse_atomic(
            receipt
                .effective_gas_price
                .as_deref()
                .unwrap_or(&transaction.gas_price),
        )
        .map_err(|e| malformed(e.to_string()))?;
        let timestamp = i64::try_from(parse_height(&block.timestamp)?)
            .map_err(|_| malformed("Block timestamp out of range"))?;
        let transfer = TransferTx {
            block_hash: transaction.block_hash.clone(),
            fee: Some(self.chain.from_unit(&(gas_used * gas_price))),
            ..native_transfer(
                &self.chain,
                &transaction.hash,
                parse_height(block_number)?,
                timestamp_from_secs(timestamp)?,
                &transaction.from,
                to,
                value,
            )
        };
        Ok(TxDetails::Transfer(transfer.with_head(head)))
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let response: AccountResponse<Vec<AccountTx>> = decode(raw)?;
        let mut transfers = Vec::new();
        for tx in &response.result {
            if let Some(transfer) = self.parse_account_tx(tx, head)? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

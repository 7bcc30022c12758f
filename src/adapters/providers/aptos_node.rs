use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::num_bigint::BigInt;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    height_chunks, malformed, native_transfer, parse_amount, parse_height, timestamp_from_micros,
};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::HttpTransport;
use crate::domain::amount::parse_atomic;
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderError, ProviderResult, RawPayload,
    ResponseParser, DEFAULT_FANOUT,
};

/// The node serves at most 100 transactions per page.
const MAX_TRANSACTIONS_PER_CALL: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 25;

const APTOS_COIN: &str = "0x1::aptos_coin::AptosCoin";
const COIN_STORE: &str = "0x1::coin::CoinStore<0x1::aptos_coin::AptosCoin>";
const TRANSFER_FUNCTIONS: [&str; 3] = [
    "0x1::aptos_account::transfer",
    "0x1::coin::transfer",
    "0x1::aptos_account::transfer_coins",
];

mod aptos_responses {
    #[derive(serde::Deserialize, Debug)]
    pub struct LedgerInfo {
        pub ledger_version: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Resource {
        #[serde(rename = "type")]
        pub kind: String,
        pub data: serde_json::Value,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct CoinStore {
        pub coin: Coin,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Coin {
        pub value: String,
    }

    /// Only the version is needed to fetch the transaction that emitted the event.
    #[derive(serde::Deserialize, Debug)]
    pub struct Event {
        pub version: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AddressTxsPayload {
        pub sent: Vec<Transaction>,
        pub received: Vec<Transaction>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Transaction {
        UserTransaction(UserTransaction),
        #[serde(other)]
        Other,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct UserTransaction {
        pub version: String,
        pub hash: String,
        pub sender: String,
        pub success: bool,
        pub gas_used: String,
        pub gas_unit_price: String,
        /// Microseconds since the epoch.
        pub timestamp: String,
        pub payload: Payload,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Payload {
        #[serde(rename = "type")]
        pub kind: String,
        #[serde(default)]
        pub function: Option<String>,
        #[serde(default)]
        pub type_arguments: Vec<String>,
        #[serde(default)]
        pub arguments: Vec<serde_json::Value>,
    }
}

use aptos_responses::*;

#[derive(Debug)]
pub struct AptosNodeClient {
    transport: HttpTransport,
    batch_size: usize,
    page_size: usize,
}

impl AptosNodeClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            batch_size: config.batch_size_or(MAX_TRANSACTIONS_PER_CALL, MAX_TRANSACTIONS_PER_CALL),
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Versions of the transactions that deposited APT into `address`. An account without a
    /// coin store has no deposit events.
    async fn deposit_versions(&self, address: &str) -> ProviderResult<Vec<String>> {
        let query = [("limit", self.page_size.to_string())];
        let raw = self
            .transport
            .get_json_with(
                &format!("accounts/{address}/events/{COIN_STORE}/deposit_events"),
                &query,
            )
            .await;
        match raw {
            Ok(raw) => Ok(decode::<Vec<Event>>(&raw)?
                .into_iter()
                .map(|event| event.version)
                .collect()),
            Err(report) if *report.current_context() == ProviderError::NotFound => {
                debug!(address, "No coin store, no deposits");
                Ok(Vec::new())
            }
            Err(report) => Err(report),
        }
    }
}

#[async_trait]
impl ProviderClient for AptosNodeClient {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn supports(&self, _operation: OperationKind) -> bool {
        true
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        self.transport.get_json("").await
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.transport
            .get_json(&format!("accounts/{address}/resources"))
            .await
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        self.transport
            .get_json(&format!("transactions/by_hash/{hash}"))
            .await
    }

    /// The account's own transactions only cover what it sent. What it received is found
    /// through the deposit events of its coin store. The cursor is the sequence number of the
    /// first sent transaction and does not apply to deposits.
    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(start) = cursor {
            query.push(("start", start.to_string()));
        }
        let sent_path = format!("accounts/{address}/transactions");
        let (sent, versions) = futures::try_join!(
            self.transport.get_json_with(&sent_path, &query),
            self.deposit_versions(address),
        )?;
        let received: Vec<RawPayload> = stream::iter(versions)
            .map(|version| async move {
                self.transport
                    .get_json(&format!("transactions/by_version/{version}"))
                    .await
            })
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await?;
        Ok(json!({"sent": sent, "received": received}))
    }

    /// Heights are ledger versions here, so a range maps directly onto `/transactions` pages.
    #[instrument(skip(self), fields(provider = %self.name()))]
    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        stream::iter(height_chunks(from_height, to_height, self.batch_size as u64))
            .map(|(start, end)| {
                let query = [
                    ("start", start.to_string()),
                    ("limit", (end - start + 1).to_string()),
                ];
                async move { self.transport.get_json_with("transactions", &query).await }
            })
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }
}

#[derive(Debug)]
pub struct AptosNodeParser {
    chain: Arc<ChainSpec>,
}

impl AptosNodeParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Receiver and atomic amount of a native APT transfer call.
    fn transfer_call(payload: &Payload) -> Option<(String, String)> {
        if payload.kind != "entry_function_payload" {
            return None;
        }
        let function = payload.function.as_deref()?;
        if !TRANSFER_FUNCTIONS.contains(&function) {
            return None;
        }
        if !payload.type_arguments.iter().all(|t| t == APTOS_COIN) {
            return None;
        }
        match payload.arguments.as_slice() {
            [to, amount] => Some((to.as_str()?.to_string(), amount.as_str()?.to_string())),
            _ => None,
        }
    }

    fn transfer_of(
        &self,
        tx: &UserTransaction,
        head: Option<u64>,
    ) -> ProviderResult<Option<TransferTx>> {
        let Some((to, amount)) = Self::transfer_call(&tx.payload) else {
            return Ok(None);
        };
        let value = parse_amount(&self.chain, &amount)?;
        if !self.chain.accepts_amount(&value) {
            return Ok(None);
        }
        let gas_used = parse_atomic(&tx.gas_used).map_err(|e| malformed(e.to_string()))?;
        let gas_price = parse_atomic(&tx.gas_unit_price).map_err(|e| malformed(e.to_string()))?;
        let micros: i64 = tx
            .timestamp
            .parse()
            .map_err(|_| malformed(format!("Bad timestamp: {:?}", tx.timestamp)))?;
        let fee: BigInt = gas_used * gas_price;
        let transfer = TransferTx {
            fee: Some(self.chain.from_unit(&fee)),
            success: tx.success,
            ..native_transfer(
                &self.chain,
                &tx.hash,
                parse_height(&tx.version)?,
                timestamp_from_micros(micros)?,
                &tx.sender,
                &to,
                value,
            )
        };
        Ok(Some(transfer.with_head(head)))
    }

    fn transfers_of<'a>(
        &self,
        transactions: impl IntoIterator<Item = &'a Transaction>,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let mut transfers = Vec::new();
        for tx in transactions {
            if let Transaction::UserTransaction(tx) = tx {
                transfers.extend(self.transfer_of(tx, head)?);
            }
        }
        Ok(transfers)
    }
}

impl ResponseParser for AptosNodeParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        let info: LedgerInfo = decode(raw)?;
        parse_height(&info.ledger_version)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let resources: Vec<Resource> = decode(raw)?;
        let balance = match resources.iter().find(|r| r.kind == COIN_STORE) {
            Some(resource) => {
                let store: CoinStore = decode(&resource.data)?;
                parse_amount(&self.chain, &store.coin.value)?
            }
            // the account never held APT
            None => self.chain.from_unit(&BigInt::from(0)),
        };
        Ok(BalanceRecord::from_balance(
            &self.chain.normalize_address(address),
            balance,
        ))
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let Transaction::UserTransaction(tx) = decode::<Transaction>(raw)? else {
            return Ok(TxDetails::Unsuccessful);
        };
        if !tx.success {
            return Ok(TxDetails::Unsuccessful);
        }
        Ok(match self.transfer_of(&tx, head)? {
            Some(transfer) => TxDetails::Transfer(transfer),
            None => TxDetails::Unsuccessful,
        })
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let payload: AddressTxsPayload = decode(raw)?;
        let mut seen = HashSet::new();
        // a transfer to self is both sent and deposited
        let unique = payload
            .sent
            .iter()
            .chain(&payload.received)
            .filter(|tx| match tx {
                Transaction::UserTransaction(tx) => seen.insert(tx.hash.clone()),
                Transaction::Other => false,
            });
        self.transfers_of(unique, head)
    }

    fn parse_block_txs(
        &self,
        raw: &[RawPayload],
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let mut transfers = Vec::new();
        for page in raw {
            let transactions: Vec<Transaction> = decode(page)?;
            transfers.extend(self.transfers_of(&transactions, head)?);
        }
        Ok(transfers)
    }
}

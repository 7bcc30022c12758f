use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::{malformed, native_transfer, timestamp_from_secs};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::{classify_rpc_payload, HttpTransport};
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderError, ProviderResult, RawPayload,
    ResponseParser, DEFAULT_FANOUT,
};

/// `getMultipleAccounts` accepts at most 100 keys.
const MAX_ACCOUNTS_PER_CALL: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_PAGE_SIZE: usize = 25;

pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
const MEMO_PROGRAM: &str = "spl-memo";

mod solana_responses {
    #[derive(serde::Deserialize, Debug)]
    pub struct Envelope<T> {
        pub result: T,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct WithContext<T> {
        pub value: T,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct SignatureInfo {
        pub signature: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Account {
        pub lamports: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct TransactionResult {
        pub slot: u64,
        pub block_time: Option<i64>,
        pub meta: Option<Meta>,
        pub transaction: TransactionBody,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Meta {
        pub err: Option<serde_json::Value>,
        pub fee: u64,
        #[serde(default)]
        pub status: Option<serde_json::Value>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct TransactionBody {
        pub signatures: Vec<String>,
        pub message: Message,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Message {
        pub instructions: Vec<Instruction>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Instruction {
        #[serde(default)]
        pub program: Option<String>,
        pub program_id: String,
        #[serde(default)]
        pub parsed: Option<serde_json::Value>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct ParsedInstruction {
        #[serde(rename = "type")]
        pub kind: String,
        pub info: serde_json::Value,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct TransferInfo {
        pub source: String,
        pub destination: String,
        pub lamports: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AddressTxsPayload {
        pub transactions: Vec<Envelope<Option<TransactionResult>>>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct BlockPayload {
        pub slot: u64,
        pub block: Envelope<Option<Block>>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Block {
        pub blockhash: String,
        pub block_time: Option<i64>,
        #[serde(default)]
        pub transactions: Vec<BlockTransaction>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct BlockTransaction {
        pub meta: Option<Meta>,
        pub transaction: TransactionBody,
    }
}

use solana_responses::*;

#[derive(Debug)]
pub struct SolanaRpcClient {
    transport: HttpTransport,
    batch_size: usize,
    page_size: usize,
}

impl SolanaRpcClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            batch_size: config.batch_size_or(DEFAULT_BATCH_SIZE, MAX_ACCOUNTS_PER_CALL),
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    async fn rpc(&self, method: &str, params: RawPayload) -> ProviderResult<RawPayload> {
        let raw = self.transport.json_rpc(method, params).await?;
        self.checked(raw)
    }

    fn transaction_params(signature: &str) -> RawPayload {
        json!([
            signature,
            {"encoding": "jsonParsed", "commitment": "finalized", "maxSupportedTransactionVersion": 0}
        ])
    }

    async fn get_block(&self, slot: u64) -> ProviderResult<RawPayload> {
        let block = self
            .rpc(
                "getBlock",
                json!([
                    slot,
                    {
                        "encoding": "jsonParsed",
                        "transactionDetails": "full",
                        "rewards": false,
                        "commitment": "finalized",
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;
        Ok(json!({"slot": slot, "block": block}))
    }
}

#[async_trait]
impl ProviderClient for SolanaRpcClient {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn supports(&self, _operation: OperationKind) -> bool {
        true
    }

    fn classify_error(&self, payload: &RawPayload) -> Option<ProviderError> {
        classify_rpc_payload(payload)
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        self.rpc("getSlot", json!([{"commitment": "finalized"}])).await
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.rpc("getBalance", json!([address, {"commitment": "finalized"}]))
            .await
    }

    #[instrument(skip(self, addresses), fields(provider = %self.name(), count = addresses.len()))]
    async fn get_balances(&self, addresses: &[String]) -> ProviderResult<Vec<RawPayload>> {
        let requests: Vec<_> = addresses
            .chunks(self.batch_size)
            .map(|chunk| {
                self.rpc(
                    "getMultipleAccounts",
                    json!([
                        chunk,
                        {"commitment": "finalized", "encoding": "base64", "dataSlice": {"offset": 0, "length": 0}}
                    ]),
                )
            })
            .collect();
        stream::iter(requests)
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        let raw = self
            .rpc("getTransaction", Self::transaction_params(hash))
            .await?;
        if raw.get("result").map_or(true, |r| r.is_null()) {
            return Err(error_stack::Report::new(ProviderError::NotFound)
                .attach_printable(format!("Transaction {hash} not found")));
        }
        Ok(raw)
    }

    /// Batched `getTransaction` calls, `batch_size` signatures per request. An unknown signature
    /// comes back with a `null` result and is passed on as `null`.
    #[instrument(skip(self, hashes), fields(provider = %self.name(), count = hashes.len()))]
    async fn get_tx_details_batch(&self, hashes: &[String]) -> ProviderResult<Vec<RawPayload>> {
        let mut payloads = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.batch_size) {
            let calls: Vec<(&str, RawPayload)> = chunk
                .iter()
                .map(|signature| ("getTransaction", Self::transaction_params(signature)))
                .collect();
            for envelope in self.transport.json_rpc_batch(&calls).await? {
                let envelope = self.checked(envelope)?;
                if envelope.get("result").map_or(true, |r| r.is_null()) {
                    payloads.push(RawPayload::Null);
                } else {
                    payloads.push(envelope);
                }
            }
        }
        Ok(payloads)
    }

    /// Signatures come first, then the transactions themselves through batched `getTransaction`
    /// calls. The cursor is the last signature of the previous page.
    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        let mut options = json!({"limit": self.page_size, "commitment": "finalized"});
        if let Some(before) = cursor {
            options["before"] = json!(before);
        }
        let signatures = self
            .rpc("getSignaturesForAddress", json!([address, options]))
            .await?;
        let list = decode::<Envelope<Vec<SignatureInfo>>>(&signatures)?.result;

        let mut transactions = Vec::with_capacity(list.len());
        for chunk in list.chunks(self.batch_size) {
            let calls: Vec<(&str, RawPayload)> = chunk
                .iter()
                .map(|info| ("getTransaction", Self::transaction_params(&info.signature)))
                .collect();
            for envelope in self.transport.json_rpc_batch(&calls).await? {
                transactions.push(self.checked(envelope)?);
            }
        }
        debug!(count = transactions.len(), "Fetched address transactions");
        Ok(json!({"signatures": signatures, "transactions": transactions}))
    }

    #[instrument(skip(self), fields(provider = %self.name()))]
    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        let confirmed = self
            .rpc("getBlocks", json!([from_height, to_height, {"commitment": "finalized"}]))
            .await?;
        let slots: Vec<u64> = decode::<Envelope<Vec<u64>>>(&confirmed)?.result;
        stream::iter(slots)
            .map(|slot| self.get_block(slot))
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await
    }
}

#[derive(Debug)]
pub struct SolanaRpcParser {
    chain: Arc<ChainSpec>,
}

impl SolanaRpcParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Source, destination and amount of a System Program transfer. Any other instruction yields
    /// `None`.
    pub fn parse_transfer_instruction(
        &self,
        instruction: &RawPayload,
    ) -> ProviderResult<Option<(String, String, BigDecimal)>> {
        let instruction: Instruction = decode(instruction)?;
        self.system_transfer(&instruction)
    }

    fn system_transfer(
        &self,
        instruction: &Instruction,
    ) -> ProviderResult<Option<(String, String, BigDecimal)>> {
        let is_system = instruction.program_id == SYSTEM_PROGRAM_ID
            || instruction.program.as_deref() == Some("system");
        let Some(parsed) = instruction.parsed.as_ref().filter(|_| is_system) else {
            return Ok(None);
        };
        let parsed: ParsedInstruction = decode(parsed)?;
        if !matches!(parsed.kind.as_str(), "transfer" | "transferWithSeed") {
            return Ok(None);
        }
        let info: TransferInfo = decode(&parsed.info)?;
        let value = self.chain.from_unit(&BigInt::from(info.lamports));
        Ok(Some((info.source, info.destination, value)))
    }

    fn memo_of(instructions: &[Instruction]) -> Option<String> {
        instructions
            .iter()
            .filter(|i| i.program.as_deref() == Some(MEMO_PROGRAM))
            .find_map(|i| i.parsed.as_ref()?.as_str().map(str::to_string))
    }

    fn is_success(meta: Option<&Meta>) -> bool {
        meta.is_some_and(|meta| {
            meta.err.is_none()
                && meta
                    .status
                    .as_ref()
                    .map_or(true, |status| status.get("Ok").is_some())
        })
    }

    fn transfers_of(
        &self,
        slot: u64,
        block_hash: Option<&str>,
        block_time: Option<i64>,
        meta: Option<&Meta>,
        body: &TransactionBody,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let hash = body
            .signatures
            .first()
            .ok_or_else(|| malformed("Transaction without signatures"))?;
        let success = Self::is_success(meta);
        let fee = meta.map(|m| self.chain.from_unit(&BigInt::from(m.fee)));
        let memo = Self::memo_of(&body.message.instructions);
        // not recorded for some very old slots
        let timestamp = block_time.map(timestamp_from_secs).transpose()?;

        let mut transfers = Vec::new();
        for instruction in &body.message.instructions {
            let Some((source, destination, value)) = self.system_transfer(instruction)? else {
                continue;
            };
            if !self.chain.accepts_amount(&value) {
                continue;
            }
            let timestamp =
                timestamp.ok_or_else(|| malformed(format!("No block time for {hash}")))?;
            let transfer = TransferTx {
                block_hash: block_hash.map(str::to_string),
                fee: fee.clone(),
                success,
                memo: memo.clone(),
                ..native_transfer(&self.chain, hash, slot, timestamp, &source, &destination, value)
            };
            transfers.push(transfer.with_head(head));
        }
        Ok(transfers)
    }
}

impl ResponseParser for SolanaRpcParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        Ok(decode::<Envelope<u64>>(raw)?.result)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let response: Envelope<WithContext<u64>> = decode(raw)?;
        Ok(BalanceRecord::from_balance(
            &self.chain.normalize_address(address),
            self.chain.from_unit(&BigInt::from(response.result.value)),
        ))
    }

    fn parse_balances(
        &self,
        addresses: &[String],
        raw: &[RawPayload],
    ) -> ProviderResult<Vec<BalanceRecord>> {
        let mut accounts = Vec::with_capacity(addresses.len());
        for payload in raw {
            let response: Envelope<WithContext<Vec<Option<Account>>>> = decode(payload)?;
            accounts.extend(response.result.value);
        }
        if accounts.len() != addresses.len() {
            return Err(malformed(format!(
                "Expected {} accounts, got {}",
                addresses.len(),
                accounts.len()
            )));
        }
        Ok(addresses
            .iter()
            .zip(accounts)
            .map(|(address, account)| {
                // unfunded accounts come back as null
                let lamports = account.map_or(0, |a| a.lamports);
                BalanceRecord::from_balance(
                    &self.chain.normalize_address(address),
                    self.chain.from_unit(&BigInt::from(lamports)),
                )
            })
            .collect())
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let response: Envelope<Option<TransactionResult>> = decode(raw)?;
        let tx = response
            .result
            .ok_or_else(|| malformed("Transaction result is null"))?;
        if !Self::is_success(tx.meta.as_ref()) {
            return Ok(TxDetails::Unsuccessful);
        }
        let hash = tx
            .transaction
            .signatures
            .first()
            .cloned()
            .ok_or_else(|| malformed("Transaction without signatures"))?;
        let transfers = self.transfers_of(
            tx.slot,
            None,
            tx.block_time,
            tx.meta.as_ref(),
            &tx.transaction,
            head,
        )?;
        Ok(TxDetails::from_transfers(&hash, transfers))
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let payload: AddressTxsPayload = decode(raw)?;
        let mut transfers = Vec::new();
        for tx in payload.transactions.into_iter().filter_map(|e| e.result) {
            transfers.extend(self.transfers_of(
                tx.slot,
                None,
                tx.block_time,
                tx.meta.as_ref(),
                &tx.transaction,
                head,
            )?);
        }
        Ok(transfers)
    }

    fn parse_block_txs(
        &self,
        raw: &[RawPayload],
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let mut transfers = Vec::new();
        for payload in raw {
            let payload: BlockPayload = decode(payload)?;
            let Some(block) = payload.block.result else {
                continue;
            };
            for tx in &block.transactions {
                transfers.extend(self.transfers_of(
                    payload.slot,
                    Some(&block.blockhash),
                    block.block_time,
                    tx.meta.as_ref(),
                    &tx.transaction,
                    head,
                )?);
            }
        }
        Ok(transfers)
    }
}

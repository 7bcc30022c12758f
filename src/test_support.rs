//! In-memory provider used by the explorer and scanner tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use serde_json::json;

use crate::adapters::providers::{native_transfer, parse_amount, timestamp_from_secs};
use crate::domain::{AddressFormat, BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderEntry, ProviderError, ProviderResult,
    RawPayload, ResponseParser,
};

pub(crate) fn test_chain() -> Arc<ChainSpec> {
    Arc::new(ChainSpec::new("tst", "TST", 8, AddressFormat::Plain))
}

/// A transfer as the fake ledger stores it. `value` is in atomic units.
pub(crate) fn fake_transfer(hash: &str, from: &str, to: &str, value: u64) -> RawPayload {
    json!({"hash": hash, "from": from, "to": to, "value": value.to_string(), "success": true})
}

pub(crate) fn failed_transfer(hash: &str, from: &str, to: &str, value: u64) -> RawPayload {
    let mut transfer = fake_transfer(hash, from, to, value);
    transfer["success"] = json!(false);
    transfer
}

#[derive(Debug, Default)]
struct Ledger {
    head: u64,
    blocks: BTreeMap<u64, Vec<RawPayload>>,
    balances: HashMap<String, String>,
}

impl Ledger {
    fn blocks_payload<'a>(blocks: impl Iterator<Item = (&'a u64, Vec<RawPayload>)>) -> RawPayload {
        let blocks: Vec<RawPayload> = blocks
            .filter(|(_, transfers)| !transfers.is_empty())
            .map(|(height, transfers)| json!({"height": height, "transfers": transfers}))
            .collect();
        json!({ "blocks": blocks })
    }
}

/// Scripted provider client. Queued failures are served first, then permanent failures, then
/// answers from the ledger.
#[derive(Debug)]
pub(crate) struct FakeClient {
    name: String,
    ledger: Mutex<Ledger>,
    queued_failures: Mutex<HashMap<OperationKind, VecDeque<ProviderError>>>,
    permanent_failures: Mutex<HashMap<OperationKind, ProviderError>>,
    calls: Mutex<HashMap<OperationKind, usize>>,
    delay: Option<Duration>,
}

impl FakeClient {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ledger: Mutex::new(Ledger::default()),
            queued_failures: Mutex::new(HashMap::new()),
            permanent_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub(crate) fn with_head(self, head: u64) -> Self {
        self.set_head(head);
        self
    }

    pub(crate) fn with_block(self, height: u64, transfers: Vec<RawPayload>) -> Self {
        self.ledger.lock().unwrap().blocks.insert(height, transfers);
        self
    }

    pub(crate) fn with_balance(self, address: &str, atomic: &str) -> Self {
        self.ledger
            .lock()
            .unwrap()
            .balances
            .insert(address.to_string(), atomic.to_string());
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn fail_once(self, operation: OperationKind, error: ProviderError) -> Self {
        self.queued_failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(error);
        self
    }

    pub(crate) fn fail_always(self, operation: OperationKind, error: ProviderError) -> Self {
        self.permanent_failures.lock().unwrap().insert(operation, error);
        self
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.ledger.lock().unwrap().head = head;
    }

    pub(crate) fn calls(&self, operation: OperationKind) -> usize {
        self.calls.lock().unwrap().get(&operation).copied().unwrap_or_default()
    }

    async fn enter(&self, operation: OperationKind) -> ProviderResult<()> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self
            .queued_failures
            .lock()
            .unwrap()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        let error = queued
            .or_else(|| self.permanent_failures.lock().unwrap().get(&operation).copied());
        match error {
            Some(error) => {
                Err(Report::new(error).attach_printable(format!("Provider: {}", self.name)))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderClient for FakeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _operation: OperationKind) -> bool {
        true
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        self.enter(OperationKind::BlockHead).await?;
        Ok(json!({"head": self.ledger.lock().unwrap().head}))
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.enter(OperationKind::Balance).await?;
        let ledger = self.ledger.lock().unwrap();
        let balance = ledger.balances.get(address).cloned().unwrap_or_else(|| "0".to_string());
        Ok(json!({"address": address, "balance": balance}))
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        self.enter(OperationKind::TxDetails).await?;
        let ledger = self.ledger.lock().unwrap();
        let found: Vec<(&u64, Vec<RawPayload>)> = ledger
            .blocks
            .iter()
            .map(|(height, transfers)| {
                let matching = transfers.iter().filter(|t| t["hash"] == hash).cloned().collect();
                (height, matching)
            })
            .collect();
        let payload = Ledger::blocks_payload(found.into_iter());
        if payload["blocks"].as_array().map_or(true, Vec::is_empty) {
            return Err(
                Report::new(ProviderError::NotFound).attach_printable(format!("Hash: {hash}"))
            );
        }
        Ok(payload)
    }

    async fn get_address_txs(
        &self,
        address: &str,
        _cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        self.enter(OperationKind::AddressTxs).await?;
        let ledger = self.ledger.lock().unwrap();
        let involving = ledger.blocks.iter().map(|(height, transfers)| {
            let matching = transfers
                .iter()
                .filter(|t| t["from"] == address || t["to"] == address)
                .cloned()
                .collect();
            (height, matching)
        });
        Ok(Ledger::blocks_payload(involving))
    }

    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        self.enter(OperationKind::BlockTxs).await?;
        let ledger = self.ledger.lock().unwrap();
        Ok((from_height..=to_height)
            .map(|height| {
                let transfers = ledger.blocks.get(&height).cloned().unwrap_or_default();
                json!({"blocks": [{"height": height, "transfers": transfers}]})
            })
            .collect())
    }
}

mod fake_responses {
    #[derive(serde::Deserialize, Debug)]
    pub struct Head {
        pub head: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Balance {
        pub balance: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Blocks {
        pub blocks: Vec<Block>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Block {
        pub height: u64,
        pub transfers: Vec<Transfer>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Transfer {
        pub hash: String,
        pub from: String,
        pub to: String,
        pub value: String,
        pub success: bool,
    }
}

#[derive(Debug)]
pub(crate) struct FakeParser {
    chain: Arc<ChainSpec>,
}

impl FakeParser {
    pub(crate) fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    fn transfers(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<Vec<TransferTx>> {
        let payload: fake_responses::Blocks = decode(raw)?;
        let mut transfers = Vec::new();
        for block in payload.blocks {
            for transfer in block.transfers {
                let value = parse_amount(&self.chain, &transfer.value)?;
                let timestamp = timestamp_from_secs(1_700_000_000 + block.height as i64)?;
                let tx = TransferTx {
                    success: transfer.success,
                    ..native_transfer(
                        &self.chain,
                        &transfer.hash,
                        block.height,
                        timestamp,
                        &transfer.from,
                        &transfer.to,
                        value,
                    )
                };
                transfers.push(tx.with_head(head));
            }
        }
        Ok(transfers)
    }
}

impl ResponseParser for FakeParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        Ok(decode::<fake_responses::Head>(raw)?.head)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let balance: fake_responses::Balance = decode(raw)?;
        Ok(BalanceRecord::from_balance(
            &self.chain.normalize_address(address),
            parse_amount(&self.chain, &balance.balance)?,
        ))
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let transfers = self.transfers(raw, head)?;
        let hash = transfers.first().map(|t| t.hash.clone()).unwrap_or_default();
        Ok(TxDetails::from_transfers(&hash, transfers))
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        self.transfers(raw, head)
    }

    fn parse_block_txs(
        &self,
        raw: &[RawPayload],
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let mut transfers = Vec::new();
        for payload in raw {
            transfers.extend(self.transfers(payload, head)?);
        }
        Ok(transfers)
    }
}

pub(crate) fn fake_entry(client: Arc<FakeClient>, chain: Arc<ChainSpec>) -> ProviderEntry {
    ProviderEntry::new(client, Arc::new(FakeParser::new(chain)))
}

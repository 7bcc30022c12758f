use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::{stream, StreamExt, TryStreamExt};
use num_traits::{Signed, Zero};
use tracing::{debug, instrument};

use super::{native_transfer, parse_amount, timestamp_from_secs};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::HttpTransport;
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderResult, RawPayload, ResponseParser,
    DEFAULT_FANOUT,
};

const DEFAULT_PAGE_SIZE: usize = 50;

mod blockbook_responses {
    #[derive(serde::Deserialize, Debug)]
    pub struct Status {
        pub blockbook: BlockbookStatus,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct BlockbookStatus {
        pub best_height: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Address {
        pub balance: String,
        pub total_received: String,
        pub total_sent: String,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct AddressTxs {
        #[serde(default)]
        pub transactions: Vec<Tx>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct BlockPage {
        pub page: u32,
        pub total_pages: u32,
        #[serde(default)]
        pub txs: Vec<Tx>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Tx {
        pub txid: String,
        #[serde(default)]
        pub block_hash: Option<String>,
        /// Negative or zero while the transaction sits in the mempool.
        pub block_height: i64,
        pub block_time: i64,
        pub vin: Vec<Vin>,
        pub vout: Vec<Vout>,
        pub fees: String,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Vin {
        #[serde(default)]
        pub addresses: Vec<String>,
        #[serde(default)]
        pub value: Option<String>,
        #[serde(default)]
        pub is_address: bool,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Vout {
        #[serde(default)]
        pub addresses: Vec<String>,
        pub value: String,
        #[serde(default)]
        pub is_address: bool,
    }
}

use blockbook_responses::*;

#[derive(Debug)]
pub struct BlockbookClient {
    transport: HttpTransport,
    page_size: usize,
}

impl BlockbookClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Every page of one block, in page order.
    async fn block_pages(&self, height: u64) -> ProviderResult<Vec<RawPayload>> {
        let mut pages = Vec::new();
        let mut page = 1u32;
        loop {
            let raw = self
                .transport
                .get_json(&format!("api/v2/block/{height}?page={page}"))
                .await?;
            let total_pages = raw
                .get("totalPages")
                .and_then(|t| t.as_u64())
                .unwrap_or(1);
            pages.push(raw);
            if u64::from(page) >= total_pages {
                break;
            }
            page += 1;
        }
        debug!(height, pages = pages.len(), "Fetched block");
        Ok(pages)
    }
}

#[async_trait]
impl ProviderClient for BlockbookClient {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn supports(&self, _operation: OperationKind) -> bool {
        true
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        self.transport.get_json("api/").await
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.transport
            .get_json(&format!("api/v2/address/{address}?details=basic"))
            .await
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        self.transport.get_json(&format!("api/v2/tx/{hash}")).await
    }

    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        let page = cursor.unwrap_or("1");
        self.transport
            .get_json(&format!(
                "api/v2/address/{address}?details=txs&pageSize={}&page={page}",
                self.page_size
            ))
            .await
    }

    #[instrument(skip(self), fields(provider = %self.name()))]
    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        let blocks: Vec<Vec<RawPayload>> = stream::iter(from_height..=to_height)
            .map(|height| self.block_pages(height))
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await?;
        Ok(blocks.into_iter().flatten().collect())
    }
}

#[derive(Debug)]
pub struct BlockbookParser {
    chain: Arc<ChainSpec>,
}

impl BlockbookParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Nets one UTXO transaction per address. Inputs are summed per sender, outputs paid back to
    /// a sender are change and reduce what it sent. Senders are reported with an empty receiver
    /// and receivers with an empty sender, since inputs and outputs are not paired on chain.
    /// A sender that gets back more than it put in ends up on the receiving side with the
    /// difference.
    fn transfers_of(&self, tx: &Tx, head: Option<u64>) -> ProviderResult<Vec<TransferTx>> {
        let mut inputs: BTreeMap<String, BigDecimal> = BTreeMap::new();
        for vin in &tx.vin {
            let (true, [address], Some(value)) =
                (vin.is_address, vin.addresses.as_slice(), &vin.value)
            else {
                continue;
            };
            *inputs
                .entry(self.chain.normalize_address(address))
                .or_insert_with(BigDecimal::zero) += parse_amount(&self.chain, value)?;
        }

        let mut outputs: BTreeMap<String, BigDecimal> = BTreeMap::new();
        for vout in &tx.vout {
            let (true, [address]) = (vout.is_address, vout.addresses.as_slice()) else {
                continue;
            };
            let address = self.chain.normalize_address(address);
            let value = parse_amount(&self.chain, &vout.value)?;
            match inputs.get_mut(&address) {
                Some(sent) => *sent -= value,
                None => *outputs.entry(address).or_insert_with(BigDecimal::zero) += value,
            }
        }

        let success = tx.block_height > 0;
        let block_height = u64::try_from(tx.block_height).unwrap_or_default();
        let timestamp = timestamp_from_secs(tx.block_time)?;
        let fee = parse_amount(&self.chain, &tx.fees)?;
        let transfer = |from: &str, to: &str, value: BigDecimal| TransferTx {
            block_hash: tx.block_hash.clone(),
            fee: Some(fee.clone()),
            success,
            ..native_transfer(&self.chain, &tx.txid, block_height, timestamp, from, to, value)
        }
        .with_head(head);

        let mut sent = Vec::new();
        for (address, net) in inputs {
            if net.is_negative() {
                *outputs.entry(address).or_insert_with(BigDecimal::zero) += net.abs();
            } else if self.chain.accepts_amount(&net) {
                sent.push(transfer(&address, "", net));
            }
        }
        let received = outputs
            .into_iter()
            .filter(|(_, value)| self.chain.accepts_amount(value))
            .map(|(address, value)| transfer("", &address, value));
        Ok(sent.into_iter().chain(received).collect())
    }
}

impl ResponseParser for BlockbookParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        let status: Status = decode(raw)?;
        Ok(status.blockbook.best_height)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let response: blockbook_responses::Address = decode(raw)?;
        Ok(BalanceRecord {
            address: self.chain.normalize_address(address),
            balance: parse_amount(&self.chain, &response.balance)?,
            received: parse_amount(&self.chain, &response.total_received)?,
            sent: parse_amount(&self.chain, &response.total_sent)?,
            rewarded: BigDecimal::zero(),
        })
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let tx: Tx = decode(raw)?;
        if tx.block_height <= 0 {
            return Ok(TxDetails::Unsuccessful);
        }
        let transfers = self.transfers_of(&tx, head)?;
        let senders: Vec<&TransferTx> =
            transfers.iter().filter(|t| t.to_address.is_empty()).collect();
        let receivers: Vec<&TransferTx> =
            transfers.iter().filter(|t| t.from_address.is_empty()).collect();
        match (senders.as_slice(), receivers.as_slice()) {
            ([], []) => Ok(TxDetails::Unsuccessful),
            ([sender], [receiver]) => Ok(TxDetails::Transfer(TransferTx {
                from_address: sender.from_address.clone(),
                ..(*receiver).clone()
            })),
            _ => Ok(TxDetails::Ambiguous {
                hash: tx.txid,
                transfers,
            }),
        }
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let response: AddressTxs = decode(raw)?;
        let mut transfers = Vec::new();
        for tx in &response.transactions {
            transfers.extend(self.transfers_of(tx, head)?);
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
            let page: BlockPage = decode(payload)?;
            debug!(page = page.page, total_pages = page.total_pages, "Parsing block page");
            for tx in &page.txs {
                transfers.extend(self.transfers_of(tx, head)?);
            }
        }
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::json;

    use super::*;
    use crate::domain::AddressFormat;

    fn parser() -> BlockbookParser {
        BlockbookParser::new(Arc::new(ChainSpec::new("ltc", "LTC", 8, AddressFormat::Plain)))
    }

    fn tx(vin: serde_json::Value, vout: serde_json::Value, block_height: i64) -> serde_json::Value {
        json!({
            "txid": "abc",
            "blockHash": "000000beef",
            "blockHeight": block_height,
            "blockTime": 1_700_000_000,
            "vin": vin,
            "vout": vout,
            "fees": "1000"
        })
    }

    #[test]
    fn test_parse_block_head() {
        let raw = json!({"blockbook": {"coin": "Litecoin", "bestHeight": 2_600_000}, "backend": {}});
        assert_eq!(parser().parse_block_head(&raw).unwrap(), 2_600_000);
    }

    #[test]
    fn test_parse_balance_with_totals() {
        let raw = json!({
            "address": "ltc1q",
            "balance": "150000000",
            "totalReceived": "500000000",
            "totalSent": "350000000",
            "txs": 4
        });
        let record = parser().parse_balance("ltc1q", &raw).unwrap();
        assert_eq!(record.balance, BigDecimal::from_str("1.5").unwrap());
        assert_eq!(record.received, BigDecimal::from(5));
        assert_eq!(record.sent, BigDecimal::from_str("3.5").unwrap());
    }

    #[test]
    fn test_change_output_is_netted() {
        let raw = tx(
            json!([{"addresses": ["alice"], "value": "300000000", "isAddress": true}]),
            json!([
                {"addresses": ["bob"], "value": "100000000", "isAddress": true},
                {"addresses": ["alice"], "value": "199999000", "isAddress": true}
            ]),
            10,
        );
        let details = parser().parse_tx_details(&raw, Some(15)).unwrap();
        let transfer = details.transaction().unwrap();
        assert_eq!(transfer.from_address, "alice");
        assert_eq!(transfer.to_address, "bob");
        assert_eq!(transfer.value, BigDecimal::from(1));
        assert_eq!(transfer.confirmations, Some(5));
        assert_eq!(transfer.fee, Some(BigDecimal::from_str("0.00001").unwrap()));
    }

    #[test]
    fn test_consolidation_into_a_sender_is_incoming() {
        let raw = tx(
            json!([
                {"addresses": ["alice"], "value": "100000000", "isAddress": true},
                {"addresses": ["carol"], "value": "200000000", "isAddress": true}
            ]),
            json!([{"addresses": ["alice"], "value": "290000000", "isAddress": true}]),
            10,
        );
        let transfers = parser()
            .parse_address_txs("alice", &json!({"transactions": [raw]}), None)
            .unwrap();

        assert_eq!(transfers.len(), 2);
        let outgoing = &transfers[0];
        assert_eq!((outgoing.from_address.as_str(), outgoing.to_address.as_str()), ("carol", ""));
        assert_eq!(outgoing.value, BigDecimal::from(2));
        let incoming = &transfers[1];
        assert_eq!((incoming.from_address.as_str(), incoming.to_address.as_str()), ("", "alice"));
        assert_eq!(incoming.value, BigDecimal::from_str("1.9").unwrap());
    }

    #[test]
    fn test_consolidation_details_pair_sender_and_receiver() {
        let raw = tx(
            json!([
                {"addresses": ["alice"], "value": "100000000", "isAddress": true},
                {"addresses": ["carol"], "value": "200000000", "isAddress": true}
            ]),
            json!([{"addresses": ["alice"], "value": "290000000", "isAddress": true}]),
            10,
        );
        let details = parser().parse_tx_details(&raw, None).unwrap();
        let transfer = details.transaction().unwrap();
        assert_eq!(transfer.from_address, "carol");
        assert_eq!(transfer.to_address, "alice");
        assert_eq!(transfer.value, BigDecimal::from_str("1.9").unwrap());
    }

    #[test]
    fn test_many_receivers_is_ambiguous() {
        let raw = tx(
            json!([{"addresses": ["alice"], "value": "300000000", "isAddress": true}]),
            json!([
                {"addresses": ["bob"], "value": "100000000", "isAddress": true},
                {"addresses": ["carol"], "value": "100000000", "isAddress": true}
            ]),
            10,
        );
        let details = parser().parse_tx_details(&raw, None).unwrap();
        assert!(matches!(
            details,
            TxDetails::Ambiguous { ref transfers, .. } if transfers.len() == 3
        ));
    }

    #[test]
    fn test_mempool_tx_is_unsuccessful() {
        let raw = tx(
            json!([{"addresses": ["alice"], "value": "300000000", "isAddress": true}]),
            json!([{"addresses": ["bob"], "value": "100000000", "isAddress": true}]),
            -1,
        );
        assert_eq!(parser().parse_tx_details(&raw, None).unwrap(), TxDetails::Unsuccessful);
    }

    #[test]
    fn test_block_pages_are_flattened() {
        let page = |n: u32, txid: &str| {
            json!({
                "page": n,
                "totalPages": 2,
                "txs": [{
                    "txid": txid,
                    "blockHeight": 10,
                    "blockTime": 1_700_000_000,
                    "vin": [{"addresses": ["alice"], "value": "100000000", "isAddress": true}],
                    "vout": [{"addresses": ["bob"], "value": "99990000", "isAddress": true}],
                    "fees": "10000"
                }]
            })
        };
        let transfers = parser()
            .parse_block_txs(&[page(1, "a"), page(2, "b")], Some(12))
            .unwrap();
        assert_eq!(transfers.len(), 4);
        let outgoing: Vec<_> = transfers.iter().filter(|t| t.from_address == "alice").collect();
        assert_eq!(outgoing.len(), 2);
        assert!(outgoing.iter().all(|t| t.to_address.is_empty()));
        assert_eq!(outgoing[0].value, BigDecimal::from(1));
    }

    #[test]
    fn test_coinbase_inputs_are_ignored() {
        let raw = json!({
            "transactions": [{
                "txid": "cb",
                "blockHeight": 10,
                "blockTime": 1_700_000_000,
                "vin": [{"isAddress": false}],
                "vout": [{"addresses": ["miner"], "value": "625000000", "isAddress": true}],
                "fees": "0"
            }]
        });
        let transfers = parser().parse_address_txs("miner", &raw, None).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].from_address, "");
        assert_eq!(transfers[0].to_address, "miner");
    }
}

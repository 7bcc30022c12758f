use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::{stream, StreamExt, TryStreamExt};
use num_traits::Zero;
use serde_json::json;
use tracing::{debug, instrument};

use super::{malformed, native_transfer, parse_amount, parse_height, timestamp_from_rfc3339};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::HttpTransport;
use crate::domain::amount::from_unit_decimal;
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderError, ProviderResult, RawPayload,
    ResponseParser, DEFAULT_FANOUT,
};

const BANK_PATH: &str = "cosmos/bank/v1beta1";
const STAKING_PATH: &str = "cosmos/staking/v1beta1";
const DISTRIBUTION_PATH: &str = "cosmos/distribution/v1beta1";
const TX_PATH: &str = "cosmos/tx/v1beta1";
const LATEST_BLOCK_PATH: &str = "cosmos/base/tendermint/v1beta1/blocks/latest";

const MSG_SEND: &str = "/cosmos.bank.v1beta1.MsgSend";
const DEFAULT_PAGE_SIZE: usize = 50;

mod cosmos_responses {
    #[derive(serde::Deserialize, serde::Serialize, Debug)]
    pub struct Coin {
        pub denom: String,
        pub amount: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct BalancesResponse {
        pub balances: Vec<Coin>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct DelegationResponse {
        pub balance: Coin,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct DelegationsResponse {
        pub delegation_responses: Vec<DelegationResponse>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct RewardsResponse {
        #[serde(default)]
        pub total: Vec<Coin>,
    }

    /// What [`super::CosmosLcdClient::get_balance`] assembles from the bank, staking and
    /// distribution modules.
    #[derive(serde::Deserialize, Debug)]
    pub struct BalancePayload {
        pub bank: BalancesResponse,
        pub delegations: DelegationsResponse,
        pub rewards: RewardsResponse,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct LatestBlockResponse {
        pub block: Block,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Block {
        pub header: Header,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Header {
        pub height: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct GetTxResponse {
        pub tx_response: TxResponse,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct GetTxsEventResponse {
        #[serde(default)]
        pub tx_responses: Vec<TxResponse>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Pagination {
        pub total: String,
    }

    /// Only what the client needs to follow the pages of a block.
    #[derive(serde::Deserialize, Debug)]
    pub struct TxsPage {
        pub tx_responses: Option<Vec<serde::de::IgnoredAny>>,
        pub pagination: Option<Pagination>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AddressTxsPayload {
        pub sent: GetTxsEventResponse,
        pub received: GetTxsEventResponse,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct TxResponse {
        pub height: String,
        pub txhash: String,
        pub code: u32,
        pub timestamp: String,
        pub tx: Tx,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Tx {
        pub body: TxBody,
        pub auth_info: AuthInfo,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct TxBody {
        pub messages: Vec<serde_json::Value>,
        #[serde(default)]
        pub memo: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AuthInfo {
        pub fee: Fee,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Fee {
        #[serde(default)]
        pub amount: Vec<Coin>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct MsgSend {
        pub from_address: String,
        pub to_address: String,
        pub amount: Vec<Coin>,
    }
}

use cosmos_responses::*;

#[derive(Debug)]
pub struct CosmosLcdClient {
    transport: HttpTransport,
    page_size: usize,
}

impl CosmosLcdClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    async fn txs_by_event(&self, event: String, offset: &str) -> ProviderResult<RawPayload> {
        let query = [
            ("events", event),
            ("pagination.limit", self.page_size.to_string()),
            ("pagination.offset", offset.to_string()),
            ("order_by", "ORDER_BY_DESC".to_string()),
        ];
        self.transport
            .get_json_with(&format!("{TX_PATH}/txs"), &query)
            .await
    }

    /// Every page of transactions at `height`, following `pagination.offset` until the reported
    /// total is reached.
    async fn txs_at_height(&self, height: u64) -> ProviderResult<Vec<RawPayload>> {
        let mut pages = Vec::new();
        let mut offset = 0usize;
        loop {
            let query = [
                ("events", format!("tx.height={height}")),
                ("pagination.limit", self.page_size.to_string()),
                ("pagination.offset", offset.to_string()),
                ("pagination.count_total", "true".to_string()),
            ];
            let raw = self
                .transport
                .get_json_with(&format!("{TX_PATH}/txs"), &query)
                .await?;
            let raw = self.checked(raw)?;
            let page: TxsPage = decode(&raw)?;
            let total = match page.pagination {
                Some(pagination) => pagination
                    .total
                    .parse::<usize>()
                    .map_err(|_| malformed(format!("Bad total: {:?}", pagination.total)))?,
                None => 0,
            };
            let fetched = page.tx_responses.map_or(0, |txs| txs.len());
            offset += fetched;
            pages.push(raw);
            if fetched == 0 || offset >= total {
                break;
            }
        }
        debug!(height, pages = pages.len(), "Fetched block");
        Ok(pages)
    }
}

#[async_trait]
impl ProviderClient for CosmosLcdClient {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn supports(&self, _operation: OperationKind) -> bool {
        true
    }

    /// LCD errors come back as `{"code": n, "message": ..}` with HTTP 200 on some gateways.
    fn classify_error(&self, payload: &RawPayload) -> Option<ProviderError> {
        let code = payload.get("code")?.as_u64()?;
        if payload.get("tx_response").is_some() || code == 0 {
            return None;
        }
        let message = payload
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        Some(if message.contains("not found") {
            ProviderError::NotFound
        } else {
            ProviderError::Malformed
        })
    }

    async fn get_block_head(&self) -> ProviderResult<RawPayload> {
        let raw = self.transport.get_json(LATEST_BLOCK_PATH).await?;
        self.checked(raw)
    }

    /// Spendable balance plus what is staked, with pending rewards reported on the side.
    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        let bank_path = format!("{BANK_PATH}/balances/{address}");
        let staking_path = format!("{STAKING_PATH}/delegations/{address}");
        let rewards_path = format!("{DISTRIBUTION_PATH}/delegators/{address}/rewards");
        let (bank, delegations, rewards) = futures::try_join!(
            self.transport.get_json(&bank_path),
            self.transport.get_json(&staking_path),
            self.transport.get_json(&rewards_path),
        )?;
        Ok(json!({
            "bank": self.checked(bank)?,
            "delegations": self.checked(delegations)?,
            "rewards": self.checked(rewards)?,
        }))
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        let raw = self
            .transport
            .get_json(&format!("{TX_PATH}/txs/{hash}"))
            .await?;
        self.checked(raw)
    }

    /// Sent and received transactions are separate event queries. The cursor is the pagination
    /// offset applied to both.
    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        let offset = cursor.unwrap_or("0");
        let (sent, received) = futures::try_join!(
            self.txs_by_event(format!("transfer.sender='{address}'"), offset),
            self.txs_by_event(format!("transfer.recipient='{address}'"), offset),
        )?;
        Ok(json!({
            "sent": self.checked(sent)?,
            "received": self.checked(received)?,
        }))
    }

    #[instrument(skip(self), fields(provider = %self.name()))]
    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        let blocks: Vec<Vec<RawPayload>> = stream::iter(from_height..=to_height)
            .map(|height| self.txs_at_height(height))
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await?;
        Ok(blocks.into_iter().flatten().collect())
    }
}

#[derive(Debug)]
pub struct CosmosLcdParser {
    chain: Arc<ChainSpec>,
}

impl CosmosLcdParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Sum of the native-denom coins in `coins`. IBC and factory denoms are ignored.
    fn native_amount(&self, coins: &[Coin]) -> ProviderResult<BigDecimal> {
        let denom = self.chain.native_denom();
        let mut total = BigDecimal::zero();
        for coin in coins.iter().filter(|c| c.denom == denom) {
            total += parse_amount(&self.chain, &coin.amount)?;
        }
        Ok(total)
    }

    fn transfers_of(
        &self,
        response: &TxResponse,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let denom = self.chain.native_denom();
        let block_height = parse_height(&response.height)?;
        let timestamp = timestamp_from_rfc3339(&response.timestamp)?;
        let fee = self.native_amount(&response.tx.auth_info.fee.amount)?;
        let memo = (!response.tx.body.memo.is_empty()).then(|| response.tx.body.memo.clone());

        let mut transfers = Vec::new();
        for message in &response.tx.body.messages {
            if message.get("@type").and_then(|t| t.as_str()) != Some(MSG_SEND) {
                continue;
            }
            let send: MsgSend = decode(message)?;
            // multi-denom sends are not native transfers
            let [coin] = send.amount.as_slice() else {
                continue;
            };
            if coin.denom != denom {
                continue;
            }
            let value = parse_amount(&self.chain, &coin.amount)?;
            if !self.chain.accepts_amount(&value) {
                continue;
            }
            let transfer = TransferTx {
                fee: Some(fee.clone()),
                memo: memo.clone(),
                success: response.code == 0,
                ..native_transfer(
                    &self.chain,
                    &response.txhash,
                    block_height,
                    timestamp,
                    &send.from_address,
                    &send.to_address,
                    value,
                )
            };
            transfers.push(transfer.with_head(head));
        }
        Ok(transfers)
    }
}

impl ResponseParser for CosmosLcdParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        let response: LatestBlockResponse = decode(raw)?;
        parse_height(&response.block.header.height)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let payload: BalancePayload = decode(raw)?;
        let bank = self.native_amount(&payload.bank.balances)?;
        let delegations: Vec<Coin> = payload
            .delegations
            .delegation_responses
            .into_iter()
            .map(|d| d.balance)
            .collect();
        let staked = self.native_amount(&delegations)?;

        let denom = self.chain.native_denom();
        let mut rewarded = BigDecimal::zero();
        for coin in payload.rewards.total.iter().filter(|c| c.denom == denom) {
            rewarded += from_unit_decimal(&coin.amount, self.chain.precision)
                .map_err(|e| malformed(e.to_string()))?;
        }

        Ok(
            BalanceRecord::from_balance(&self.chain.normalize_address(address), bank + staked)
                .with_rewarded(rewarded),
        )
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let response: GetTxResponse = decode(raw)?;
        if response.tx_response.code != 0 {
            return Ok(TxDetails::Unsuccessful);
        }
        let transfers = self.transfers_of(&response.tx_response, head)?;
        Ok(TxDetails::from_transfers(&response.tx_response.txhash, transfers))
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let payload: AddressTxsPayload = decode(raw)?;
        let mut seen = HashSet::new();
        let mut transfers = Vec::new();
        // a send to self matches both the sender and the recipient query
        for response in payload
            .sent
            .tx_responses
            .iter()
            .chain(&payload.received.tx_responses)
            .filter(|response| seen.insert(response.txhash.clone()))
        {
            transfers.extend(self.transfers_of(response, head)?);
        }
        Ok(transfers)
    }

    fn parse_block_txs(
        &self,
        raw: &[RawPayload],
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let mut transfers = Vec::new();
        for page in raw {
            let response: GetTxsEventResponse = decode(page)?;
            for tx in &response.tx_responses {
                transfers.extend(self.transfers_of(tx, head)?);
            }
        }
        Ok(transfers)
    }
}

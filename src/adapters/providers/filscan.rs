use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::num_bigint::BigInt;
use futures::{stream, StreamExt, TryStreamExt};
use num_traits::Zero;
use serde::de::IgnoredAny;
use serde_json::json;
use tracing::{debug, instrument};

use super::{malformed, native_transfer, parse_amount, timestamp_from_secs};
use crate::adapters::config::ProviderConfig;
use crate::adapters::http::{classify_rpc_payload, HttpTransport};
use crate::domain::amount::parse_atomic;
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{
    decode, OperationKind, ProviderClient, ProviderError, ProviderResult, RawPayload,
    ResponseParser, DEFAULT_FANOUT,
};

const DEFAULT_PAGE_SIZE: usize = 20;
const BLOCK_PAGE_SIZE: usize = 30;
const SEND_METHOD: &str = "Send";
const FEE_CONSUME_TYPES: [&str; 2] = ["MinerTip", "BaseFeeBurn"];

mod filscan_responses {
    use serde::{Deserialize, Deserializer};

    /// Filscan sends `null` for an empty list. The field itself must still be present.
    fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Response<T> {
        pub result: T,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct FinalHeight {
        pub height: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AccountInfoResult {
        pub account_info: AccountInfo,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AccountInfo {
        pub account_basic: AccountBasic,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AccountBasic {
        pub account_balance: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct MessageDetailsResult {
        #[serde(rename = "MessageDetails")]
        pub message_details: MessageDetails,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct MessageDetails {
        pub message_basic: Message,
        #[serde(deserialize_with = "null_as_empty")]
        pub blk_cids: Vec<String>,
        #[serde(deserialize_with = "null_as_empty")]
        pub consume_list: Vec<Consume>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Consume {
        pub consume_type: String,
        pub value: String,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Message {
        pub cid: String,
        pub height: u64,
        /// Seconds since the epoch.
        pub block_time: i64,
        pub from: String,
        pub to: String,
        pub value: String,
        pub exit_code: String,
        #[serde(default)]
        pub method_name: Option<String>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct AccountMessages {
        #[serde(deserialize_with = "null_as_empty")]
        pub messages_by_account_id_list: Vec<Message>,
    }

    #[derive(serde::Deserialize, Debug)]
    #[serde(bound(deserialize = "T: Deserialize<'de>"))]
    pub struct BlockMessages<T = Message> {
        #[serde(deserialize_with = "null_as_empty")]
        pub message_list: Vec<T>,
        pub total_count: u64,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct LatestBlocks {
        pub tipset_list: Vec<Tipset>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct Tipset {
        pub height: u64,
        pub block_basic: Vec<BlockBasic>,
    }

    #[derive(serde::Deserialize, Debug)]
    pub struct BlockBasic {
        pub cid: String,
    }
}

use filscan_responses::*;

/// Filscan exposes every call as `POST {base}/{Method}` with a JSON body.
#[derive(Debug)]
pub struct FilscanClient {
    transport: HttpTransport,
    page_size: usize,
}

impl FilscanClient {
    pub fn new(transport: HttpTransport, config: &ProviderConfig) -> Self {
        Self {
            transport,
            page_size: config.page_size_or(DEFAULT_PAGE_SIZE),
        }
    }

    async fn call(&self, method: &str, body: RawPayload) -> ProviderResult<RawPayload> {
        let raw = self.transport.post_json(method, &body).await?;
        self.checked(raw)
    }

    /// Block cids of the tipset at `height`. A null round has no tipset and no blocks.
    async fn tipset_blocks(&self, height: u64) -> ProviderResult<Vec<String>> {
        let raw = self
            .call(
                "LatestBlocks",
                json!({"filters": {"start": height, "input_type": "height"}}),
            )
            .await?;
        let response: Response<LatestBlocks> = decode(&raw)?;
        let Some(tipset) = response.result.tipset_list.into_iter().next() else {
            debug!(height, "Null round");
            return Ok(Vec::new());
        };
        if tipset.height != height {
            return Err(malformed(format!(
                "Asked for tipset {height}, got {}",
                tipset.height
            )));
        }
        Ok(tipset.block_basic.into_iter().map(|b| b.cid).collect())
    }

    /// Pages of `Send` messages in one block, up to the `total_count` the first page reports.
    async fn block_messages(&self, block_cid: &str) -> ProviderResult<Vec<RawPayload>> {
        let mut pages = Vec::new();
        let mut fetched = 0u64;
        let mut index = 0u64;
        loop {
            let raw = self
                .call(
                    "MessagesByBlock",
                    json!({
                        "filters": {"index": index, "limit": BLOCK_PAGE_SIZE, "method_name": SEND_METHOD},
                        "block_cid": block_cid
                    }),
                )
                .await?;
            let page: Response<BlockMessages<IgnoredAny>> = decode(&raw)?;
            let count = page.result.message_list.len() as u64;
            if count == 0 {
                break;
            }
            fetched += count;
            pages.push(raw);
            if fetched >= page.result.total_count {
                break;
            }
            index += 1;
        }
        Ok(pages)
    }

    async fn tipset_messages(&self, height: u64) -> ProviderResult<Vec<RawPayload>> {
        let mut pages = Vec::new();
        for block_cid in self.tipset_blocks(height).await? {
            pages.extend(self.block_messages(&block_cid).await?);
        }
        debug!(height, pages = pages.len(), "Fetched tipset messages");
        Ok(pages)
    }
}

#[async_trait]
impl ProviderClient for FilscanClient {
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
        self.call("FinalHeight", json!({})).await
    }

    async fn get_balance(&self, address: &str) -> ProviderResult<RawPayload> {
        self.call("AccountInfoByID", json!({"account_id": address}))
            .await
    }

    async fn get_tx_details(&self, hash: &str) -> ProviderResult<RawPayload> {
        let raw = self
            .call("MessageDetails", json!({"message_cid": hash}))
            .await?;
        if raw.get("result").map_or(true, |r| r.is_null()) {
            return Err(error_stack::Report::new(ProviderError::NotFound)
                .attach_printable(format!("Message {hash} not found")));
        }
        Ok(raw)
    }

    /// The cursor is the page index.
    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<RawPayload> {
        let page: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        self.call(
            "MessagesByAccountID",
            json!({
                "account_id": address,
                "address": "",
                "filters": {"index": page, "page": page, "limit": self.page_size, "method_name": SEND_METHOD}
            }),
        )
        .await
    }

    #[instrument(skip(self), fields(provider = %self.name()))]
    async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> ProviderResult<Vec<RawPayload>> {
        let tipsets: Vec<Vec<RawPayload>> = stream::iter(from_height..=to_height)
            .map(|height| self.tipset_messages(height))
            .buffered(DEFAULT_FANOUT)
            .try_collect()
            .await?;
        Ok(tipsets.into_iter().flatten().collect())
    }
}

#[derive(Debug)]
pub struct FilscanParser {
    chain: Arc<ChainSpec>,
}

impl FilscanParser {
    pub fn new(chain: Arc<ChainSpec>) -> Self {
        Self { chain }
    }

    /// Only executed plain sends move FIL between the two parties.
    fn is_valid_send(message: &Message) -> bool {
        message.exit_code == "Ok"
            && message
                .method_name
                .as_deref()
                .map_or(true, |method| method.eq_ignore_ascii_case(SEND_METHOD))
    }

    fn transfer_of(
        &self,
        message: &Message,
        head: Option<u64>,
    ) -> ProviderResult<Option<TransferTx>> {
        if !Self::is_valid_send(message) {
            return Ok(None);
        }
        let value = parse_amount(&self.chain, &message.value)?;
        if !self.chain.accepts_amount(&value) {
            return Ok(None);
        }
        let transfer = native_transfer(
            &self.chain,
            &message.cid,
            message.height,
            timestamp_from_secs(message.block_time)?,
            &message.from,
            &message.to,
            value,
        );
        Ok(Some(transfer.with_head(head)))
    }

    fn fee_of(&self, consume_list: &[Consume]) -> ProviderResult<bigdecimal::BigDecimal> {
        let mut fee = BigInt::zero();
        for consume in consume_list
            .iter()
            .filter(|c| FEE_CONSUME_TYPES.contains(&c.consume_type.as_str()))
        {
            fee += parse_atomic(&consume.value).map_err(|e| malformed(e.to_string()))?;
        }
        Ok(self.chain.from_unit(&fee))
    }
}

impl ResponseParser for FilscanParser {
    fn parse_block_head(&self, raw: &RawPayload) -> ProviderResult<u64> {
        Ok(decode::<Response<FinalHeight>>(raw)?.result.height)
    }

    fn parse_balance(&self, address: &str, raw: &RawPayload) -> ProviderResult<BalanceRecord> {
        let response: Response<AccountInfoResult> = decode(raw)?;
        let balance = parse_amount(
            &self.chain,
            &response.result.account_info.account_basic.account_balance,
        )?;
        Ok(BalanceRecord::from_balance(
            &self.chain.normalize_address(address),
            balance,
        ))
    }

    fn parse_tx_details(&self, raw: &RawPayload, head: Option<u64>) -> ProviderResult<TxDetails> {
        let response: Response<MessageDetailsResult> = decode(raw)?;
        let details = response.result.message_details;
        let Some(transfer) = self.transfer_of(&details.message_basic, head)? else {
            return Ok(TxDetails::Unsuccessful);
        };
        let block_hash = (!details.blk_cids.is_empty()).then(|| details.blk_cids.join(","));
        Ok(TxDetails::Transfer(TransferTx {
            block_hash,
            fee: Some(self.fee_of(&details.consume_list)?),
            ..transfer
        }))
    }

    fn parse_address_txs(
        &self,
        _address: &str,
        raw: &RawPayload,
        head: Option<u64>,
    ) -> ProviderResult<Vec<TransferTx>> {
        let response: Response<AccountMessages> = decode(raw)?;
        let mut transfers = Vec::new();
        for message in &response.result.messages_by_account_id_list {
            transfers.extend(self.transfer_of(message, head)?);
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
            let response: Response<BlockMessages> = decode(page)?;
            for message in &response.result.message_list {
                transfers.extend(self.transfer_of(message, head)?);
            }
        }
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;

    use super::*;
    use crate::domain::AddressFormat;

    fn parser() -> FilscanParser {
        FilscanParser::new(Arc::new(ChainSpec::new("fil", "FIL", 18, AddressFormat::Filecoin)))
    }

    fn message(cid: &str, exit_code: &str, method_name: &str) -> RawPayload {
        json!({
            "cid": cid,
            "height": 3_400_000u64,
            "block_time": 1_700_000_000,
            "from": "f1abjxfbp274xpdqcpuaykwkfb43omjotacm2p3za",
            "to": "F1CJZBK5IFWRXBCYVQSHKHIMRGPUIC7ORPBHCN2VA",
            "value": "1600000000000000000",
            "exit_code": exit_code,
            "method_name": method_name
        })
    }

    #[test]
    fn test_parse_tx_details_send() {
        let raw = json!({
            "result": {
                "MessageDetails": {
                    "message_basic": message("bafy1", "Ok", "Send"),
                    "blk_cids": ["bafyblk1", "bafyblk2"],
                    "consume_list": [
                        {"consume_type": "MinerTip", "value": "1000"},
                        {"consume_type": "BaseFeeBurn", "value": "2000"},
                        {"consume_type": "Transfer", "value": "1600000000000000000"}
                    ]
                }
            }
        });
        let details = parser().parse_tx_details(&raw, Some(3_400_010)).unwrap();
        let tx = details.transaction().unwrap();
        assert_eq!(tx.value, BigDecimal::from_str("1.6").unwrap());
        assert_eq!(tx.to_address, "f1cjzbk5ifwrxbcyvqshkhimrgpuic7orpbhcn2va");
        assert_eq!(tx.block_hash.as_deref(), Some("bafyblk1,bafyblk2"));
        assert_eq!(tx.fee, Some(BigDecimal::from_str("0.000000000000003").unwrap()));
        assert_eq!(tx.confirmations, Some(10));
    }

    #[test]
    fn test_failed_or_non_send_messages_are_dropped() {
        let raw = json!({
            "result": {
                "messages_by_account_id_list": [
                    message("ok", "Ok", "send"),
                    message("failed", "SysErrOutOfGas", "Send"),
                    message("publish", "Ok", "PublishStorageDeals")
                ]
            }
        });
        let transfers = parser()
            .parse_address_txs("f1abjxfbp274xpdqcpuaykwkfb43omjotacm2p3za", &raw, None)
            .unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].hash, "ok");
    }

    #[test]
    fn test_failed_message_details_is_unsuccessful() {
        let raw = json!({
            "result": {"MessageDetails": {
                "message_basic": message("bafy1", "SysErrInsufficientFunds", "Send"),
                "blk_cids": ["bafyblk1"],
                "consume_list": null
            }}
        });
        assert_eq!(parser().parse_tx_details(&raw, None).unwrap(), TxDetails::Unsuccessful);
    }

    #[test]
    fn test_parse_block_pages() {
        let raw = vec![
            json!({"result": {"message_list": [message("a", "Ok", "Send")], "total_count": 2}}),
            json!({"result": {"message_list": [message("b", "Ok", "Send")], "total_count": 2}}),
        ];
        let transfers = parser().parse_block_txs(&raw, None).unwrap();
        assert_eq!(transfers.iter().map(|t| t.hash.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_lists_are_malformed() {
        let report = parser().parse_block_txs(&[json!({"result": {}})], None).unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);

        let report = parser()
            .parse_address_txs("f1abc", &json!({"result": {}}), None)
            .unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);

        let details = json!({
            "result": {"MessageDetails": {"message_basic": message("bafy1", "Ok", "Send")}}
        });
        let report = parser().parse_tx_details(&details, None).unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);
    }

    #[test]
    fn test_null_message_list_is_empty() {
        let raw = json!({"result": {"message_list": null, "total_count": 0}});
        assert!(parser().parse_block_txs(&[raw], None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_balance_and_head() {
        let balance = json!({"result": {"account_info": {"account_basic": {"account_balance": "2500000000000000000"}}}});
        let record = parser().parse_balance("f1abc", &balance).unwrap();
        assert_eq!(record.balance, BigDecimal::from_str("2.5").unwrap());
        let head = json!({"result": {"height": 3_400_123u64}});
        assert_eq!(parser().parse_block_head(&head).unwrap(), 3_400_123);
    }
}

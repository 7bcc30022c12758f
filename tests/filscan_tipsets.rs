use std::sync::Arc;

use chain_explorer::adapters::config::ProviderConfig;
use chain_explorer::adapters::providers::ProviderKind;
use chain_explorer::domain::AddressFormat;
use chain_explorer::ports::{ProviderEntry, ProviderError};
use chain_explorer::ChainSpec;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{json, Value};

const HEIGHT: u64 = 3_400_000;

fn entry(server: &ServerGuard) -> ProviderEntry {
    let config = ProviderConfig::new(ProviderKind::Filscan, &server.url());
    let chain = Arc::new(ChainSpec::new("fil", "FIL", 18, AddressFormat::Filecoin));
    ProviderKind::Filscan.build("filscan", &config, chain).unwrap()
}

fn tipset(height: u64) -> String {
    json!({
        "result": {
            "tipset_list": [{
                "height": height,
                "block_basic": [{"cid": "bafyblk1", "height": height}]
            }]
        }
    })
    .to_string()
}

fn message(index: usize) -> Value {
    json!({
        "cid": format!("bafymsg{index}"),
        "height": HEIGHT,
        "block_time": 1_700_000_000,
        "from": "f1abjxfbp274xpdqcpuaykwkfb43omjotacm2p3za",
        "to": "f1cjzbk5ifwrxbcyvqshkhimrgpuic7orpbhcn2va",
        "value": "1000000000000000000",
        "exit_code": "Ok",
        "method_name": "Send"
    })
}

fn messages_page(indexes: std::ops::Range<usize>, total: u64) -> String {
    json!({
        "result": {
            "message_list": indexes.map(message).collect::<Vec<_>>(),
            "total_count": total
        }
    })
    .to_string()
}

fn index(value: u64) -> Matcher {
    Matcher::PartialJson(json!({"filters": {"index": value}, "block_cid": "bafyblk1"}))
}

#[tokio::test]
async fn test_block_pages_stop_at_total_count() {
    let mut server = Server::new_async().await;
    let _tipset = server
        .mock("POST", "/LatestBlocks")
        .with_body(tipset(HEIGHT))
        .create_async()
        .await;
    let first = server
        .mock("POST", "/MessagesByBlock")
        .match_body(index(0))
        .with_body(messages_page(0..30, 31))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", "/MessagesByBlock")
        .match_body(index(1))
        .with_body(messages_page(30..31, 31))
        .expect(1)
        .create_async()
        .await;
    let beyond = server
        .mock("POST", "/MessagesByBlock")
        .match_body(index(2))
        .expect(0)
        .create_async()
        .await;

    let entry = entry(&server);
    let pages = entry.client.get_block_txs(HEIGHT, HEIGHT).await.unwrap();
    let transfers = entry.parser.parse_block_txs(&pages, None).unwrap();

    assert_eq!(transfers.len(), 31);
    first.assert_async().await;
    second.assert_async().await;
    beyond.assert_async().await;
}

#[tokio::test]
async fn test_tipset_at_other_height_is_malformed() {
    let mut server = Server::new_async().await;
    let _tipset = server
        .mock("POST", "/LatestBlocks")
        .with_body(tipset(HEIGHT - 1))
        .create_async()
        .await;
    let messages = server
        .mock("POST", "/MessagesByBlock")
        .expect(0)
        .create_async()
        .await;

    let report = entry(&server).client.get_block_txs(HEIGHT, HEIGHT).await.unwrap_err();

    assert_eq!(*report.current_context(), ProviderError::Malformed);
    messages.assert_async().await;
}

#[tokio::test]
async fn test_null_round_has_no_transfers() {
    let mut server = Server::new_async().await;
    let _tipset = server
        .mock("POST", "/LatestBlocks")
        .with_body(json!({"result": {"tipset_list": []}}).to_string())
        .create_async()
        .await;
    let messages = server
        .mock("POST", "/MessagesByBlock")
        .expect(0)
        .create_async()
        .await;

    let pages = entry(&server).client.get_block_txs(HEIGHT, HEIGHT).await.unwrap();

    assert!(pages.is_empty());
    messages.assert_async().await;
}

use std::sync::Arc;

use chain_explorer::adapters::config::ProviderConfig;
use chain_explorer::adapters::providers::ProviderKind;
use chain_explorer::domain::AddressFormat;
use chain_explorer::ChainSpec;
use mockito::{Matcher, Server};
use serde_json::{json, Value};

const ALICE: &str = "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu";
const BOB: &str = "cosmos1zg69v7ys40x77y352eufp27daufrg4ncnjqz7q";
const HEIGHT: u64 = 19_000_000;

fn tx_response(index: usize) -> Value {
    json!({
        "height": HEIGHT.to_string(),
        "txhash": format!("{index:064X}"),
        "code": 0,
        "timestamp": "2024-01-15T10:00:00Z",
        "tx": {
            "body": {
                "messages": [{
                    "@type": "/cosmos.bank.v1beta1.MsgSend",
                    "from_address": ALICE,
                    "to_address": BOB,
                    "amount": [{"denom": "uatom", "amount": "1000000"}]
                }],
                "memo": ""
            },
            "auth_info": {"fee": {"amount": [{"denom": "uatom", "amount": "5000"}]}}
        }
    })
}

fn page(indexes: std::ops::Range<usize>, total: usize) -> String {
    json!({
        "txs": [],
        "tx_responses": indexes.map(tx_response).collect::<Vec<_>>(),
        "pagination": {"next_key": null, "total": total.to_string()}
    })
    .to_string()
}

fn atom() -> Arc<ChainSpec> {
    Arc::new(ChainSpec::new("atom", "ATOM", 6, AddressFormat::Bech32).with_bech32_hrp("cosmos"))
}

fn offset(value: &str) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("events".into(), format!("tx.height={HEIGHT}")),
        Matcher::UrlEncoded("pagination.offset".into(), value.into()),
    ])
}

#[tokio::test]
async fn test_block_txs_follow_pagination_to_total() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("GET", "/cosmos/tx/v1beta1/txs")
        .match_query(offset("0"))
        .with_body(page(0..100, 150))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/cosmos/tx/v1beta1/txs")
        .match_query(offset("100"))
        .with_body(page(100..150, 150))
        .expect(1)
        .create_async()
        .await;

    let mut config = ProviderConfig::new(ProviderKind::CosmosLcd, &server.url());
    config.page_size = Some(100);
    let entry = ProviderKind::CosmosLcd.build("lcd", &config, atom()).unwrap();

    let pages = entry.client.get_block_txs(HEIGHT, HEIGHT).await.unwrap();
    let transfers = entry.parser.parse_block_txs(&pages, None).unwrap();

    assert_eq!(pages.len(), 2);
    assert_eq!(transfers.len(), 150);
    assert!(transfers.iter().all(|t| t.from_address == ALICE && t.to_address == BOB));
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_empty_block_is_one_request() {
    let mut server = Server::new_async().await;
    let only = server
        .mock("GET", "/cosmos/tx/v1beta1/txs")
        .match_query(offset("0"))
        .with_body(json!({"txs": [], "tx_responses": [], "pagination": {"total": "0"}}).to_string())
        .expect(1)
        .create_async()
        .await;

    let config = ProviderConfig::new(ProviderKind::CosmosLcd, &server.url());
    let entry = ProviderKind::CosmosLcd.build("lcd", &config, atom()).unwrap();

    let pages = entry.client.get_block_txs(HEIGHT, HEIGHT).await.unwrap();

    assert!(entry.parser.parse_block_txs(&pages, None).unwrap().is_empty());
    only.assert_async().await;
}

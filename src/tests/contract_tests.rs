use crate::config::{ConfigError, DataSourceConfig};
use crate::db::{documents, meta};
use crate::indexing::error::IndexingError;
use crate::indexing::ethereum::EthereumIndexer;
use crate::indexing::registry::{DataSourceRegistry, IndexerRegistry};
use crate::indexing::updater::IndexerContext;
use crate::models::ethereum::ADDRESS_TYPE;
use crate::models::{Document, DocumentRef, Hint, Relationship};
use crate::tests::support::*;
use crate::validation::checksum_address;
use serde_json::{json, Value};

const BALANCES: &str = "sample-token-balance-ofs";
const BUYERS: &str = "sample-token-buyers";
const CONTRACTS: &str = "sample-tokens";

fn related(doc: &Document, name: &str) -> Vec<String> {
    doc.relationship(name)
        .map(|r| r.refs().into_iter().map(|r| r.id.clone()).collect())
        .unwrap_or_default()
}

fn event_id(chain: &MockChain, block: u64) -> String {
    format!("{}_0", chain.transaction_hashes(block)[0])
}

async fn contract_meta(h: &Harness) -> Value {
    meta::get_meta(&h.pool, "sample-token").await.unwrap().unwrap()["contract"].clone()
}

#[tokio::test]
async fn mint_and_transfer_update_balances_and_link_events() {
    let chain = MockChain::new();
    let minted = chain.mint(alice(), 100);
    let transferred = chain.transfer(alice(), bob(), 10);

    let pool = store().await;
    let h = Harness::start(&chain, &pool, token_source()).await;
    h.full_pass().await;

    let alice_balance = h.doc(BALANCES, &id_of(&alice())).await.expect("alice balance");
    assert_eq!(alice_balance.attribute("mapping-number-value"), Some(&json!("90")));
    assert_eq!(
        alice_balance.attribute("ethereum-address"),
        Some(&json!(checksum_address(&alice())))
    );
    assert_eq!(related(&alice_balance, "mint-events"), vec![event_id(&chain, minted)]);
    assert_eq!(related(&alice_balance, "transfer-events"), vec![event_id(&chain, transferred)]);
    assert_eq!(
        alice_balance.relationship("contract"),
        Some(&Relationship::One(Some(DocumentRef::new(CONTRACTS, id_of(&token_address())))))
    );

    let bob_balance = h.doc(BALANCES, &id_of(&bob())).await.expect("bob balance");
    assert_eq!(bob_balance.attribute("mapping-number-value"), Some(&json!("10")));
    assert!(related(&bob_balance, "mint-events").is_empty());
    assert_eq!(related(&bob_balance, "transfer-events"), vec![event_id(&chain, transferred)]);

    // Mint comes from nowhere; only the two holders get entries
    assert_eq!(h.count(BALANCES).await, 2);

    let transfer = h
        .doc("sample-token-transfer-events", &event_id(&chain, transferred))
        .await
        .expect("transfer event");
    assert_eq!(transfer.attribute("from"), Some(&json!(id_of(&alice()))));
    assert_eq!(transfer.attribute("to"), Some(&json!(id_of(&bob()))));
    assert_eq!(transfer.attribute("value"), Some(&json!("10")));
    assert_eq!(transfer.attribute("event-name"), Some(&json!("Transfer")));
    assert_eq!(h.count("sample-token-mint-events").await, 1);

    let contract = h.doc(CONTRACTS, &id_of(&token_address())).await.expect("contract document");
    assert_eq!(contract.attribute("name"), Some(&json!("Sample Token")));
    assert_eq!(contract.attribute("total-supply"), Some(&json!("100")));
    assert_eq!(contract.attribute("token-frozen"), Some(&json!(false)));
    assert_eq!(contract.attribute("balance-wei"), Some(&json!("0")));

    let content_type = h.doc("content-types", BALANCES).await.expect("content type");
    assert_eq!(content_type.attribute("data-source"), Some(&json!("sample-token")));
    assert_eq!(
        content_type.attribute("relationships"),
        Some(&json!(["contract", "mint-events", "transfer-events"]))
    );

    let stored = contract_meta(&h).await;
    assert_eq!(stored["lastIndexedBlock"], json!(transferred));
    assert_eq!(stored["skipping"], json!(false));
    assert!(stored["generationNonce"].is_string());
}

#[tokio::test]
async fn incremental_passes_scan_only_new_logs_and_accumulate_events() {
    let chain = MockChain::new();
    chain.mint(alice(), 100);
    chain.transfer(alice(), bob(), 10);

    let pool = store().await;
    let h = Harness::start(&chain, &pool, token_source()).await;
    h.full_pass().await;
    let nonce = contract_meta(&h).await["generationNonce"].clone();

    let second = chain.transfer(bob(), carol(), 3);
    let log_queries = chain.call_count("eth_getLogs");
    h.full_pass().await;
    assert_eq!(chain.call_count("eth_getLogs") - log_queries, 1);

    let bob_balance = h.doc(BALANCES, &id_of(&bob())).await.unwrap();
    assert_eq!(bob_balance.attribute("mapping-number-value"), Some(&json!("7")));
    assert_eq!(related(&bob_balance, "transfer-events").len(), 2);

    let carol_balance = h.doc(BALANCES, &id_of(&carol())).await.unwrap();
    assert_eq!(carol_balance.attribute("mapping-number-value"), Some(&json!("3")));
    assert_eq!(carol_balance.meta.block_height, Some(second));

    let alice_balance = h.doc(BALANCES, &id_of(&alice())).await.unwrap();
    assert_eq!(alice_balance.attribute("mapping-number-value"), Some(&json!("90")));

    let stored = contract_meta(&h).await;
    assert_eq!(stored["lastIndexedBlock"], json!(second));
    assert_eq!(stored["generationNonce"], nonce);
}

#[tokio::test]
async fn multi_output_mappings_merge_across_events() {
    let chain = MockChain::new();
    chain.approve_buyer(carol());

    let pool = store().await;
    let h = Harness::start(&chain, &pool, token_source()).await;
    h.full_pass().await;

    let buyer = h.doc(BUYERS, &id_of(&carol())).await.expect("buyer entry");
    assert_eq!(buyer.attribute("approved"), Some(&json!(true)));
    assert_eq!(buyer.attribute("limit"), Some(&json!("0")));
    assert_eq!(related(&buyer, "buyer-approved-events").len(), 1);

    chain.set_buyer_limit(carol(), 500);
    h.full_pass().await;

    let buyer = h.doc(BUYERS, &id_of(&carol())).await.unwrap();
    assert_eq!(buyer.attribute("approved"), Some(&json!(true)));
    assert_eq!(buyer.attribute("limit"), Some(&json!("500")));
    assert_eq!(related(&buyer, "buyer-approved-events").len(), 1);
    assert_eq!(related(&buyer, "buyer-limit-set-events").len(), 1);
}

#[tokio::test]
async fn frozen_contract_is_skipped_then_fully_reindexed() {
    let chain = MockChain::new();
    chain.mint(alice(), 100);

    let mut config = token_source();
    config.params["addressIndexing"] = json!({
        "trackedAddressContentType": WALLET_TYPE,
        "trackedAddressField": WALLET_FIELD
    });

    let pool = store().await;
    save_wallet(&pool, "w1", &[alice()]).await;
    let h = Harness::start(&chain, &pool, config).await;
    h.full_pass().await;
    let first_nonce = contract_meta(&h).await["generationNonce"].clone();

    // Left over from an earlier generation of the contract scope
    documents::upsert_documents(
        &pool,
        &[Document::new(BALANCES, "stale")],
        Some("sample-token/contract"),
        Some("earlier-generation"),
    )
    .await
    .unwrap();

    chain.set_frozen(true);
    let moved = chain.transfer(alice(), bob(), 10);
    h.full_pass().await;

    let stored = contract_meta(&h).await;
    assert_eq!(stored["skipping"], json!(true));
    assert_eq!(stored["lastIndexedBlock"], json!(1));
    assert!(h.doc(BALANCES, &id_of(&bob())).await.is_none());
    assert!(h.doc(BALANCES, "stale").await.is_some());

    chain.set_frozen(false);
    h.full_pass().await;

    let stored = contract_meta(&h).await;
    assert_eq!(stored["skipping"], json!(false));
    assert_eq!(stored["lastIndexedBlock"], json!(moved));
    assert_ne!(stored["generationNonce"], first_nonce);

    assert!(h.doc(BALANCES, "stale").await.is_none());
    let bob_balance = h.doc(BALANCES, &id_of(&bob())).await.unwrap();
    assert_eq!(bob_balance.attribute("mapping-number-value"), Some(&json!("10")));
    let alice_balance = h.doc(BALANCES, &id_of(&alice())).await.unwrap();
    assert_eq!(alice_balance.attribute("mapping-number-value"), Some(&json!("90")));
    assert_eq!(related(&alice_balance, "mint-events").len(), 1);
    assert!(h.doc("content-types", BALANCES).await.is_some());

    // Address documents of the same data source survive the replace-all
    assert!(h.doc(ADDRESS_TYPE, &id_of(&alice())).await.is_some());
}

#[tokio::test]
async fn hints_refresh_named_mapping_and_contract_documents() {
    let chain = MockChain::new();
    chain.mint(alice(), 100);

    let pool = store().await;
    let h = Harness::start(&chain, &pool, token_source()).await;
    h.full_pass().await;

    chain.set_token_balance(alice(), 55);
    h.hinted_pass(vec![Hint::Document(DocumentRef::new(BALANCES, id_of(&alice())))])
        .await
        .unwrap();
    let alice_balance = h.doc(BALANCES, &id_of(&alice())).await.unwrap();
    assert_eq!(alice_balance.attribute("mapping-number-value"), Some(&json!("55")));
    assert_eq!(related(&alice_balance, "mint-events").len(), 1);

    // A reverting getter leaves its attribute out of the refreshed document
    chain.set_total_supply_reverts(true);
    h.hinted_pass(vec![Hint::Contract(id_of(&token_address()))])
        .await
        .unwrap();
    let contract = h.doc(CONTRACTS, &id_of(&token_address())).await.unwrap();
    assert!(contract.attribute("total-supply").is_none());
    assert_eq!(contract.attribute("name"), Some(&json!("Sample Token")));
}

#[tokio::test]
async fn invalid_data_sources_are_skipped_at_activation() {
    let chain = MockChain::new();
    let context = IndexerContext {
        transport: chain.clone(),
        chain: chain_settings(),
        indexing: indexing_settings(),
    };

    let mut bad_trigger = token_source();
    bad_trigger.id = "bad-trigger".to_string();
    bad_trigger.params["contract"]["eventContentTriggers"] = json!({ "Transfer": ["bad-trigger-nopes"] });

    let mut bad_address = token_source();
    bad_address.id = "bad-address".to_string();
    bad_address.params["contract"]["address"] = json!("0x1234");

    let unknown = DataSourceConfig {
        id: "mystery".to_string(),
        source_type: "solana".to_string(),
        params: Value::Null,
    };

    let err = EthereumIndexer::connect(&bad_trigger, &context).await.err().unwrap();
    assert!(matches!(err, IndexingError::Config(ConfigError::Invalid { .. })));

    let (registry, failures) = DataSourceRegistry::activate(
        &[bad_trigger, token_source(), bad_address, unknown],
        &IndexerRegistry::with_defaults(),
        &context,
    )
    .await;

    assert_eq!(registry.len(), 1);
    assert!(registry.get("sample-token").is_some());
    let failed: Vec<&str> = failures.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(failed, vec!["bad-trigger", "bad-address", "mystery"]);
    assert!(matches!(
        failures[2].1,
        IndexingError::Config(ConfigError::UnknownSourceType(_))
    ));
}

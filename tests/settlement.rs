//! End-to-end settlement scenarios over simulated chains: the full path
//! from deal creation through escrow funding, confirmation tracking, payout
//! submission and closure — plus the failure paths (timeout, reorg
//! rollback, cancellation, lock enforcement).

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use otc_broker::adapter::mock::MockChain;
use otc_broker::adapter::registry::ChainRegistry;
use otc_broker::config::{ChainFlavor, ChainSettings, Config};
use otc_broker::engine::deal_engine::DealEngine;
use otc_broker::engine::gas_tank::GasTank;
use otc_broker::engine::payout_queue::PayoutQueue;
use otc_broker::engine::watcher::poll_escrow_once;
use otc_broker::engine::DealService;
use otc_broker::error::BrokerError;
use otc_broker::mail::DisabledMailer;
use otc_broker::model::{DealStage, PayoutPurpose, PayoutStatus, Side};
use otc_broker::routes::{otc, AppState};
use otc_broker::store::Store;

const TOKEN_ASSET: &str = "ERC20:0x00000000000000000000000000000000000000ee";

fn chain_settings(chain_id: &str, symbol: &str, min_conf: u32, operator: &str) -> ChainSettings {
    ChainSettings {
        chain_id: chain_id.into(),
        display_name: chain_id.into(),
        native_symbol: symbol.into(),
        flavor: ChainFlavor::Mock,
        min_confirmations: min_conf,
        gas_buffer: Decimal::ZERO,
        dust_threshold: dec!(0.0001),
        rpc_url: format!("mock://{}", chain_id.to_lowercase()),
        explorer_tx_url: None,
        erc20_fixed_fee: None,
        commission_address: Some(operator.into()),
        stable_fixed_usd: None,
        max_amount: None,
        broker_contract: None,
    }
}

struct TestBroker {
    state: AppState,
    service: Arc<DealService>,
    engine: DealEngine,
    queue: PayoutQueue,
    c1: Arc<MockChain>,
    c2: Arc<MockChain>,
}

async fn broker() -> TestBroker {
    broker_with(|_| {}).await
}

async fn broker_with(tune: impl FnOnce(&mut Config)) -> TestBroker {
    let mut config = Config::from_env();
    config.base_url = "http://broker.test".into();
    config.production_mode = false;
    config.allowed_assets = None;
    config.swap_grace_seconds = 0;
    config.poll_interval_seconds = 1;
    config.surveillance_hours = 24;
    config.chains = vec![
        chain_settings("C1", "ALPHA", 3, "operator-c1"),
        chain_settings("C2", "GAMMA", 2, "operator-c2"),
    ];
    tune(&mut config);
    let config = Arc::new(config);

    let store = Store::in_memory().await.unwrap();
    let c1 = Arc::new(MockChain::new("C1", "ALPHA", config.chains[0].min_confirmations));
    let c2 = Arc::new(MockChain::new("C2", "GAMMA", config.chains[1].min_confirmations).with_price(dec!(2)));
    let mut registry = ChainRegistry::empty();
    registry.insert(config.chains[0].clone(), c1.clone());
    registry.insert(config.chains[1].clone(), c2.clone());
    let registry = Arc::new(registry);

    let service = Arc::new(DealService::new(store, Arc::clone(&registry), Arc::clone(&config)));
    let gas_tank = Arc::new(GasTank::new());
    let engine = DealEngine::new(Arc::clone(&service), Arc::clone(&gas_tank));
    let queue = PayoutQueue::new(Arc::clone(&service), Arc::clone(&gas_tank));
    let state = AppState { service: Arc::clone(&service), mailer: Arc::new(DisabledMailer) };
    TestBroker { state, service, engine, queue, c1, c2 }
}

/// `otc.createDeal` with the scenario-1 shape; returns (dealId, tokenA, tokenB).
async fn create_deal(broker: &TestBroker, side_a: Value, side_b: Value, timeout: i64) -> (String, String, String) {
    let result = otc::create_deal::handle(
        &broker.state,
        json!({ "sideA": side_a, "sideB": side_b, "timeoutSeconds": timeout }),
    )
    .await
    .unwrap();
    let deal_id = result["dealId"].as_str().unwrap().to_string();
    let token = |link: &Value| link.as_str().unwrap().rsplit('/').next().unwrap().to_string();
    (deal_id, token(&result["linkA"]), token(&result["linkB"]))
}

async fn fill(broker: &TestBroker, deal_id: &str, side: Side, token: &str) -> Result<Value, BrokerError> {
    let label = side.letter();
    otc::fill_party_details::handle(
        &broker.state,
        json!({
            "dealId": deal_id,
            "party": side,
            "paybackAddress": format!("{label}-payback"),
            "recipientAddress": format!("{label}-recipient"),
            "token": token,
        }),
    )
    .await
}

async fn stage_of(broker: &TestBroker, deal_id: &str) -> DealStage {
    broker.service.store.load_deal(deal_id).await.unwrap().stage
}

async fn watch_both(broker: &TestBroker, deal_id: &str) {
    poll_escrow_once(&broker.service, deal_id, Side::A).await.unwrap();
    poll_escrow_once(&broker.service, deal_id, Side::B).await.unwrap();
}

/// Pump the queue while confirming whatever it submits, until it drains.
async fn settle_payouts(broker: &TestBroker) {
    for _ in 0..12 {
        broker.queue.pump().await.unwrap();
        broker.c1.confirm_all(6);
        broker.c2.confirm_all(6);
    }
}

/// Fund both escrows exactly and walk the deal to WAITING.
async fn fund_to_waiting(broker: &TestBroker, deal_id: &str, amount_a: Decimal, amount_b: Decimal) -> (String, String) {
    let deal = broker.service.store.load_deal(deal_id).await.unwrap();
    let esc_a = deal.escrow(Side::A).unwrap().address.clone();
    let esc_b = deal.escrow(Side::B).unwrap().address.clone();
    let tx_a = broker.c1.credit(&esc_a, "ALPHA".parse().unwrap(), amount_a, Some(10));
    let tx_b = broker.c2.credit(&esc_b, TOKEN_ASSET.parse().unwrap(), amount_b, Some(10));
    broker.c1.confirm_all(6);
    broker.c2.confirm_all(6);
    watch_both(broker, deal_id).await;
    broker.engine.drive(deal_id).await.unwrap();
    (tx_a, tx_b)
}

#[tokio::test]
async fn happy_path_settles_both_sides() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Created);

    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Collection);

    // Required amounts carry the 0.30% commission.
    let status = otc::status::handle(&broker.state, json!({ "dealId": deal_id })).await.unwrap();
    let required = |v: &Value| v.as_str().unwrap().parse::<Decimal>().unwrap();
    assert_eq!(required(&status["instructions"]["sideA"][0]["amount"]), dec!(10.03));
    assert_eq!(required(&status["instructions"]["sideB"][0]["amount"]), dec!(100.30));
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    assert!(deal.expires_at.is_some());

    fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Waiting);

    // Grace period is zero: the next tick plans the swap.
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Swap);

    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    // 10 ALPHA to B's recipient, 0.03 to the operator on C1.
    let sent_c1 = broker.c1.submitted_transfers();
    assert_eq!(sent_c1.len(), 2);
    assert_eq!(sent_c1[0].to_address, "b-recipient");
    assert_eq!(sent_c1[0].amount, dec!(10));
    assert_eq!(sent_c1[1].to_address, "operator-c1");
    assert_eq!(sent_c1[1].amount, dec!(0.03));

    // 100 token to A's recipient, 0.30 to the operator on C2.
    let sent_c2 = broker.c2.submitted_transfers();
    assert_eq!(sent_c2.len(), 2);
    assert_eq!(sent_c2[0].to_address, "a-recipient");
    assert_eq!(sent_c2[0].amount, dec!(100));
    assert_eq!(sent_c2[1].to_address, "operator-c2");
    assert_eq!(sent_c2[1].amount, dec!(0.30));

    // Conservation: every payout completed with an observed txid.
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    assert!(intents.iter().all(|i| i.status == PayoutStatus::Completed));
    assert!(intents.iter().all(|i| i.submitted_tx.is_some()));
    let out_c1: Decimal = intents.iter().filter(|i| i.chain_id == "C1").map(|i| i.amount).sum();
    assert_eq!(out_c1, dec!(10.03));
}

#[tokio::test]
async fn overpayment_returns_surplus_to_payback_address() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();

    // Side A overpays by 1.97.
    fund_to_waiting(&broker, &deal_id, dec!(12), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    let surplus: Vec<_> = broker
        .c1
        .submitted_transfers()
        .into_iter()
        .filter(|t| t.purpose == PayoutPurpose::SurplusRefund)
        .collect();
    assert_eq!(surplus.len(), 1);
    assert_eq!(surplus[0].amount, dec!(1.97));
    assert_eq!(surplus[0].to_address, "a-payback");
}

#[tokio::test]
async fn timeout_refunds_the_single_funded_side() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        1,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Collection);

    // Only side A funds, and confirms.
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let esc_a = deal.escrow(Side::A).unwrap().address.clone();
    broker.c1.credit(&esc_a, "ALPHA".parse().unwrap(), dec!(10), Some(10));
    broker.c1.confirm_all(6);
    watch_both(&broker, &deal_id).await;

    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Reverted);

    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].purpose, PayoutPurpose::TimeoutRefund);
    assert_eq!(intents[0].amount, dec!(10));
    assert_eq!(intents[0].to_address, "a-payback");

    settle_payouts(&broker).await;
    let refund = &broker.c1.submitted_transfers()[0];
    assert_eq!(refund.to_address, "a-payback");
    assert_eq!(refund.amount, dec!(10));
}

#[tokio::test]
async fn reorg_rolls_waiting_back_to_collection_and_recovers() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();

    let (tx_a, _) = fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Waiting);

    // The block holding side A's deposit is reorged away.
    broker.c1.reorg_out(&tx_a);
    poll_escrow_once(&broker.service, &deal_id, Side::A).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Collection);

    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    // Timer resumed with the original deadline, locks cleared.
    assert!(deal.expires_at.is_some());
    assert!(deal.side_a.locks.trade_locked_at.is_none());
    assert!(deal.events.iter().any(|e| e.message.contains("orphaned")));

    // Side A re-deposits; the deal completes.
    let esc_a = deal.escrow(Side::A).unwrap().address.clone();
    broker.c1.credit(&esc_a, "ALPHA".parse().unwrap(), dec!(10.03), Some(20));
    broker.c1.confirm_all(6);
    watch_both(&broker, &deal_id).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Waiting);
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Swap);
    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);
}

#[tokio::test]
async fn cancellation_is_only_possible_while_created() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();

    otc::cancel_deal::handle(&broker.state, json!({ "dealId": deal_id, "token": token_a }))
        .await
        .unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Reverted);

    // No escrows were ever created, no payouts exist.
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    assert!(deal.escrow(Side::A).is_none());
    assert!(deal.escrow(Side::B).is_none());
    assert!(broker.service.store.load_intents_for_deal(&deal_id).await.unwrap().is_empty());

    // Late fill and late cancel are both rejected.
    let err = fill(&broker, &deal_id, Side::B, &token_b).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTransition(_)));
    let err = otc::cancel_deal::handle(&broker.state, json!({ "dealId": deal_id, "token": token_b }))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTransition(_)));
}

#[tokio::test]
async fn locked_details_are_immutable() {
    let broker = broker().await;
    let (deal_id, token_a, _) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();

    // Second submission with different addresses bounces.
    let err = otc::fill_party_details::handle(
        &broker.state,
        json!({
            "dealId": deal_id,
            "party": "A",
            "paybackAddress": "evil-payback",
            "recipientAddress": "evil-recipient",
            "token": token_a,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTransition(_)));

    // First submission preserved byte for byte.
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let party = deal.party(Side::A).unwrap();
    assert_eq!(party.payback_address, "a-payback");
    assert_eq!(party.recipient_address, "a-recipient");
}

#[tokio::test]
async fn wrong_token_is_rejected_without_state_change() {
    let broker = broker().await;
    let (deal_id, _, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    // B's token cannot fill side A.
    let err = fill(&broker, &deal_id, Side::A, &token_b).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidToken));
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    assert!(deal.party(Side::A).is_none());
}

#[tokio::test]
async fn late_confirming_deposit_is_refunded_through_surveillance() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        1,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();

    // The deposit lands just before expiry but does not confirm in time.
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let esc_a = deal.escrow(Side::A).unwrap().address.clone();
    let tx_a = broker.c1.credit(&esc_a, "ALPHA".parse().unwrap(), dec!(10), Some(10));
    watch_both(&broker, &deal_id).await;

    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Reverted);
    // Nothing was confirmed at expiry, so no refunds were planned yet.
    assert!(broker.service.store.load_intents_for_deal(&deal_id).await.unwrap().is_empty());

    // The deposit confirms afterwards; the surveillance watcher refunds it.
    broker.c1.set_confirmations(&tx_a, 6);
    poll_escrow_once(&broker.service, &deal_id, Side::A).await.unwrap();
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].purpose, PayoutPurpose::SurplusRefund);
    assert_eq!(intents[0].amount, dec!(10));
    assert_eq!(intents[0].to_address, "a-payback");

    // And the refund is not planned twice.
    poll_escrow_once(&broker.service, &deal_id, Side::A).await.unwrap();
    assert_eq!(broker.service.store.load_intents_for_deal(&deal_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn queue_resumes_with_the_same_txids_after_a_restart() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Swap);

    // First submission round, then a "restart": a fresh queue over the
    // same store picks the SUBMITTED intents back up.
    broker.queue.pump().await.unwrap();
    let first_txids: Vec<String> = broker
        .service
        .store
        .load_intents_for_deal(&deal_id)
        .await
        .unwrap()
        .iter()
        .filter_map(|i| i.submitted_tx.as_ref().map(|t| t.txid.clone()))
        .collect();
    assert!(!first_txids.is_empty());

    let fresh_queue = PayoutQueue::new(Arc::clone(&broker.service), Arc::new(GasTank::new()));
    for _ in 0..12 {
        fresh_queue.pump().await.unwrap();
        broker.c1.confirm_all(6);
        broker.c2.confirm_all(6);
    }
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    // The already-submitted intents kept their original txids, and no
    // transfer was duplicated on chain.
    let final_intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    for txid in &first_txids {
        assert!(final_intents.iter().any(|i| i.submitted_tx.as_ref().is_some_and(|t| &t.txid == txid)));
    }
    let total_transfers = broker.c1.submitted_transfers().len() + broker.c2.submitted_transfers().len();
    assert_eq!(total_transfers, final_intents.len());
}

#[tokio::test]
async fn permanent_payout_failure_reverts_with_refunds() {
    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Swap);

    // The first C1 submission dies permanently (e.g. unresolvable nonce
    // conflict); C2 settles normally.
    broker
        .c1
        .fail_next_submit(otc_broker::adapter::AdapterError::permanent("signature rejected"));
    settle_payouts(&broker).await;

    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Reverted);

    // A deal never silently loses value: what has not verifiably left the
    // failed side's escrow (the commission already settled) is re-planned
    // as a refund to the payback address.
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    assert!(intents.iter().any(|i| i.status == PayoutStatus::Failed));
    let refunds: Vec<_> = intents
        .iter()
        .filter(|i| i.purpose == PayoutPurpose::TimeoutRefund && i.chain_id == "C1")
        .collect();
    assert!(!refunds.is_empty());
    let refunded: Decimal = refunds.iter().map(|i| i.amount).sum();
    assert_eq!(refunded, dec!(10));
}

#[tokio::test]
async fn production_mode_enforces_asset_allow_list_and_limits() {
    let broker = broker_with(|config| {
        config.production_mode = true;
        config.allowed_assets = Some(vec!["ALPHA".into(), TOKEN_ASSET.into()]);
        config.chains[0].max_amount = Some(dec!(50));
    })
    .await;

    // Disallowed asset.
    let err = otc::create_deal::handle(
        &broker.state,
        json!({
            "sideA": { "chainId": "C1", "assetCode": "BETA", "amount": "1" },
            "sideB": { "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "1" },
            "timeoutSeconds": 3600,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidInput(_)));

    // Over the per-chain limit.
    let err = otc::create_deal::handle(
        &broker.state,
        json!({
            "sideA": { "chainId": "C1", "assetCode": "ALPHA", "amount": "51" },
            "sideB": { "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "1" },
            "timeoutSeconds": 3600,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidInput(_)));

    // Within bounds is accepted.
    let ok = otc::create_deal::handle(
        &broker.state,
        json!({
            "sideA": { "chainId": "C1", "assetCode": "ALPHA", "amount": "50" },
            "sideB": { "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "1" },
            "timeoutSeconds": 3600,
        }),
    )
    .await
    .unwrap();
    assert!(ok["dealId"].is_string());
}

#[tokio::test]
async fn broker_token_flow_funds_gas_approves_and_sweeps() {
    let broker = {
        let mut config = Config::from_env();
        config.base_url = "http://broker.test".into();
        config.production_mode = false;
        config.swap_grace_seconds = 0;
        config.poll_interval_seconds = 1;
        config.surveillance_hours = 24;
        let mut evm = chain_settings("EVMOCK", "ETH", 2, "operator-evm");
        evm.broker_contract = Some("0x00000000000000000000000000000000000000bb".into());
        config.chains = vec![chain_settings("C1", "ALPHA", 3, "operator-c1"), evm];
        let config = Arc::new(config);

        let store = Store::in_memory().await.unwrap();
        let c1 = Arc::new(MockChain::new("C1", "ALPHA", 3));
        let c2 = Arc::new(MockChain::new_evm("EVMOCK", "ETH", 2));
        let mut registry = ChainRegistry::empty();
        registry.insert(config.chains[0].clone(), c1.clone());
        registry.insert(config.chains[1].clone(), c2.clone());
        let registry = Arc::new(registry);
        let service = Arc::new(DealService::new(store, Arc::clone(&registry), Arc::clone(&config)));
        let gas_tank = Arc::new(GasTank::new());
        let engine = DealEngine::new(Arc::clone(&service), Arc::clone(&gas_tank));
        let queue = PayoutQueue::new(Arc::clone(&service), Arc::clone(&gas_tank));
        let state = AppState { service: Arc::clone(&service), mailer: Arc::new(DisabledMailer) };
        TestBroker { state, service, engine, queue, c1, c2 }
    };

    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "EVMOCK", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Collection);

    // COLLECTION entry approved the broker for the token, with the tank
    // fronting the approval gas.
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let esc_b = deal.escrow(Side::B).unwrap().address.clone();
    let approvals = broker.c2.approvals();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].0, esc_b);
    assert!(approvals[0].1.starts_with("0x"));
    let fundings = broker.c2.tank_fundings();
    assert_eq!(fundings.len(), 1);
    assert_eq!(fundings[0].0, esc_b);

    // The tank's gas never shows up as a party deposit.
    fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    assert_eq!(deal.side_b.deposits.len(), 1);
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Waiting);

    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Swap);

    // The token leg is routed through the broker contract.
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    let token_leg = intents.iter().find(|i| i.chain_id == "EVMOCK" && i.amount == dec!(100)).unwrap();
    assert_eq!(token_leg.purpose, PayoutPurpose::BrokerSwap);

    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    // Residual escrow gas above dust was queued back to the tank.
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    let sweep = intents.iter().find(|i| i.purpose == PayoutPurpose::GasRefundToTank).unwrap();
    assert_eq!(sweep.to_address, "tank-evmock");
    assert_eq!(sweep.amount, dec!(0.002));
}

#[tokio::test]
async fn usd_fixed_commission_blocks_on_oracle_then_freezes() {
    let broker = broker_with(|config| {
        config.chains[0].stable_fixed_usd = Some(dec!(5));
    })
    .await;
    // No price known yet.
    broker.c1.set_usd_price(dec!(0));

    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();

    // The COLLECTION transition blocks while the oracle cannot quote.
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Created);

    // Price appears; the commission freezes at it, irreversibly.
    broker.c1.set_usd_price(dec!(2));
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Collection);
    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let plan = deal.commission(Side::A).unwrap();
    assert_eq!(plan.native_fixed, Some(dec!(2.5)));
    assert_eq!(plan.oracle_quote.as_ref().unwrap().pair, "ALPHA/USD");

    // Required side A amount is trade + frozen native commission.
    let status = otc::status::handle(&broker.state, json!({ "dealId": deal_id })).await.unwrap();
    let amount = status["instructions"]["sideA"][0]["amount"].as_str().unwrap();
    assert_eq!(amount.parse::<Decimal>().unwrap(), dec!(12.5));

    // A later price move does not re-quote the frozen commission.
    broker.c1.set_usd_price(dec!(100));
    fund_to_waiting(&broker, &deal_id, dec!(12.5), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    let commission: Vec<_> = broker
        .c1
        .submitted_transfers()
        .into_iter()
        .filter(|t| t.purpose == PayoutPurpose::OpCommission)
        .collect();
    assert_eq!(commission.len(), 1);
    assert_eq!(commission[0].amount, dec!(2.5));
    assert_eq!(commission[0].to_address, "operator-c1");
}

#[tokio::test]
async fn gas_reimbursement_returns_the_collected_buffer() {
    let broker = broker_with(|config| {
        config.gas_reimbursement_enabled = true;
        config.chains[0].flavor = ChainFlavor::Evm { chain_numeric_id: 1 };
        config.chains[0].gas_buffer = dec!(0.05);
    })
    .await;

    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();

    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    let gas = deal.gas_reimbursement.clone().unwrap();
    assert!(gas.enabled);
    assert_eq!(gas.escrow_side, Side::A);

    // Required includes the buffer: 10 + 0.03 + 0.05.
    let status = otc::status::handle(&broker.state, json!({ "dealId": deal_id })).await.unwrap();
    let amount = status["instructions"]["sideA"][0]["amount"].as_str().unwrap();
    assert_eq!(amount.parse::<Decimal>().unwrap(), dec!(10.08));

    fund_to_waiting(&broker, &deal_id, dec!(10.08), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    let reimbursed: Vec<_> = broker
        .c1
        .submitted_transfers()
        .into_iter()
        .filter(|t| t.purpose == PayoutPurpose::GasReimbursement)
        .collect();
    assert_eq!(reimbursed.len(), 1);
    assert_eq!(reimbursed[0].amount, dec!(0.05));
    assert_eq!(reimbursed[0].to_address, "a-payback");

    let deal = broker.service.store.load_deal(&deal_id).await.unwrap();
    assert_eq!(
        deal.gas_reimbursement.unwrap().status,
        otc_broker::model::GasReimbursementStatus::Reimbursed
    );
}

#[tokio::test]
async fn split_payout_chains_carry_additional_txids() {
    let broker = {
        let mut b = broker().await;
        // Rebuild C1 as a chain that splits logical payouts.
        let split = Arc::new(MockChain::new("C1", "ALPHA", 3).with_split_payouts());
        let mut registry = ChainRegistry::empty();
        registry.insert(b.service.config.chains[0].clone(), split.clone());
        registry.insert(b.service.config.chains[1].clone(), b.c2.clone());
        let registry = Arc::new(registry);
        let service = Arc::new(DealService::new(
            b.service.store.clone(),
            Arc::clone(&registry),
            Arc::clone(&b.service.config),
        ));
        let gas_tank = Arc::new(GasTank::new());
        b.engine = DealEngine::new(Arc::clone(&service), Arc::clone(&gas_tank));
        b.queue = PayoutQueue::new(Arc::clone(&service), Arc::clone(&gas_tank));
        b.state = AppState { service: Arc::clone(&service), mailer: Arc::new(DisabledMailer) };
        b.c1 = split;
        b.service = service;
        b
    };

    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();
    fund_to_waiting(&broker, &deal_id, dec!(10.03), dec!(100.30)).await;
    broker.engine.drive(&deal_id).await.unwrap();
    settle_payouts(&broker).await;
    broker.engine.drive(&deal_id).await.unwrap();
    assert_eq!(stage_of(&broker, &deal_id).await, DealStage::Closed);

    // One logical payout, several chain transactions; completion tracked
    // on the primary txid, the rest surfaced alongside it.
    let intents = broker.service.store.load_intents_for_deal(&deal_id).await.unwrap();
    let swap = intents
        .iter()
        .find(|i| i.chain_id == "C1" && i.purpose == PayoutPurpose::SwapPayout)
        .unwrap();
    assert_eq!(swap.status, PayoutStatus::Completed);
    let tx = swap.submitted_tx.as_ref().unwrap();
    assert_eq!(tx.additional_txids.len(), 1);
    assert_ne!(tx.additional_txids[0], tx.txid);
}

#[tokio::test]
async fn supervisors_spawn_workers_for_live_escrows() {
    use otc_broker::engine::watcher::WatcherSupervisor;
    use tokio::sync::watch;

    let broker = broker().await;
    let (deal_id, token_a, token_b) = create_deal(
        &broker,
        json!({ "chainId": "C1", "assetCode": "ALPHA", "amount": "10" }),
        json!({ "chainId": "C2", "assetCode": TOKEN_ASSET, "amount": "100" }),
        3600,
    )
    .await;
    fill(&broker, &deal_id, Side::A, &token_a).await.unwrap();
    fill(&broker, &deal_id, Side::B, &token_b).await.unwrap();
    broker.engine.drive(&deal_id).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Arc::new(WatcherSupervisor::new(Arc::clone(&broker.service)));
    supervisor.sync(&shutdown_rx).await.unwrap();
    // A second sync is idempotent while the watchers are alive.
    supervisor.sync(&shutdown_rx).await.unwrap();

    // The queue supervisor also tolerates an empty queue.
    broker.queue.sync(&shutdown_rx).await.unwrap();

    shutdown_tx.send(true).unwrap();
}

//! Concurrent submissions of one authorization must settle at most once.

use std::sync::Arc;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;

use agentpay::client::{build_bundle, BundleRequest};
use agentpay::sqlite_ledger::SqliteLedger;
use agentpay::{ChainConfig, IdentityRegistry, InMemoryLedger, Ledger, SettlementEngine, SettlementError};

const NOW: u64 = 1_700_000_000;
const RACERS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_replay_in_memory() {
    let ledger = Arc::new(InMemoryLedger::new());
    let owner = PrivateKeySigner::random();
    let worker = PrivateKeySigner::random();
    let payer = PrivateKeySigner::random();
    let agent_id = ledger.register_agent(owner.address(), "");
    ledger
        .set_worker(agent_id, owner.address(), worker.address())
        .unwrap();
    ledger.mint(payer.address(), U256::from(1_000u64));

    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        ledger.clone(),
        ChainConfig::default(),
    ));
    let bundle = Arc::new(
        build_bundle(
            &payer,
            &worker,
            engine.config(),
            &BundleRequest::new(agent_id, U256::from(100u64), 95, "weather")
                .valid_between(0, NOW + 3600),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..RACERS {
        let engine = engine.clone();
        let bundle = bundle.clone();
        handles.push(tokio::spawn(async move {
            engine.settle_at(&bundle, NOW).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, SettlementError::NonceReplay),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(
        ledger.balance_of(payer.address()).await.unwrap(),
        U256::from(900u64)
    );
    assert_eq!(ledger.get_tx_count(agent_id).await.unwrap(), 1);
    assert_eq!(ledger.feedback(agent_id).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_replay_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let ledger = Arc::new(SqliteLedger::open(path.to_str().unwrap()).unwrap());

    let owner = PrivateKeySigner::random();
    let worker = PrivateKeySigner::random();
    let payer = PrivateKeySigner::random();
    let agent_id = ledger.register_agent(owner.address(), "").unwrap();
    ledger
        .set_worker(agent_id, owner.address(), worker.address())
        .unwrap();
    ledger.mint(payer.address(), U256::from(1_000u64)).unwrap();

    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        ledger.clone(),
        ChainConfig::default(),
    ));
    let bundle = Arc::new(
        build_bundle(
            &payer,
            &worker,
            engine.config(),
            &BundleRequest::new(agent_id, U256::from(100u64), 95, "weather")
                .valid_between(0, NOW + 3600),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..RACERS {
        let engine = engine.clone();
        let bundle = bundle.clone();
        handles.push(tokio::spawn(async move {
            engine.settle_at(&bundle, NOW).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, SettlementError::NonceReplay),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(
        ledger.balance_of(payer.address()).await.unwrap(),
        U256::from(900u64)
    );
    assert_eq!(ledger.get_tx_count(agent_id).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_distinct_nonces_all_settle() {
    let ledger = Arc::new(InMemoryLedger::new());
    let owner = PrivateKeySigner::random();
    let worker = PrivateKeySigner::random();
    let payer = PrivateKeySigner::random();
    let agent_id = ledger.register_agent(owner.address(), "");
    ledger
        .set_worker(agent_id, owner.address(), worker.address())
        .unwrap();
    ledger.mint(payer.address(), U256::from(1_000u64));

    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        ledger.clone(),
        ChainConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let bundle = build_bundle(
            &payer,
            &worker,
            engine.config(),
            &BundleRequest::new(agent_id, U256::from(10u64), 90, "weather")
                .valid_between(0, NOW + 3600),
        )
        .unwrap();
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.settle_at(&bundle, NOW).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        ledger.balance_of(worker.address()).await.unwrap(),
        U256::from(100u64)
    );
    assert_eq!(ledger.get_tx_count(agent_id).await.unwrap(), 10);
}

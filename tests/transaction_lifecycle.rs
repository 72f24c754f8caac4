//! 交易生命周期：build → sign → broadcast → watch → replace / cancel / drop

mod common;

use std::sync::Arc;

use ethers::types::U256;

use keyring_engine::domain::transaction::{ether, MIN_TRANSFER_GAS};
use keyring_engine::domain::{Address, GasPricing, TransactionStatus};
use keyring_engine::infrastructure::event_bus::EngineEvent;
use keyring_engine::infrastructure::persistence::InMemoryPersistence;
use keyring_engine::infrastructure::rpc_client::ChainProviders;
use keyring_engine::service::{SecurityDecisionAggregator, TransactionIntent};
use keyring_engine::{EngineError, SendOptions, SigningEngine};

use common::{error_string_revert, gwei, test_config, unlocked_engine, MockRpcClient, TEST_MNEMONIC};

fn recipient() -> Address {
    "0x000000000000000000000000000000000000dEaD".parse().unwrap()
}

#[tokio::test]
async fn test_transfer_confirms_with_eip1559_fees() {
    let rpc = MockRpcClient::mainnet_like();
    let (engine, from) = unlocked_engine(rpc.clone()).await;
    let mut events = engine.events().subscribe();

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let submitted = engine.send(intent, &SendOptions::default()).await.unwrap();

    // maxFee = 2 × baseFee + priority
    assert_eq!(
        submitted.transaction.unsigned.fees,
        GasPricing::Eip1559 {
            max_fee_per_gas: gwei(42),
            max_priority_fee_per_gas: gwei(2),
        }
    );
    assert_eq!(submitted.transaction.status, TransactionStatus::Broadcast);
    assert_eq!(rpc.sent_count(), 1);

    rpc.mine(submitted.tx_hash, true);
    let tx_id = submitted.tx_id();
    let (tx, status) = submitted.watch.await.unwrap();
    assert_eq!(status.unwrap(), TransactionStatus::Confirmed);
    assert_eq!(tx.block_number, Some(18_000_000));
    assert_eq!(tx.gas_used, Some(21_000));

    let mut transitions = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if let EngineEvent::TransactionStatusChanged {
            tx_id: id,
            from_status,
            to_status,
            ..
        } = envelope.event
        {
            assert_eq!(id, tx_id);
            transitions.push((from_status, to_status));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (TransactionStatus::Signed, TransactionStatus::Broadcast),
            (TransactionStatus::Broadcast, TransactionStatus::Confirmed),
        ]
    );
}

#[tokio::test]
async fn test_reverted_receipt_is_failed() {
    let rpc = MockRpcClient::mainnet_like();
    let (engine, from) = unlocked_engine(rpc.clone()).await;

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let submitted = engine.send(intent, &SendOptions::default()).await.unwrap();
    rpc.mine(submitted.tx_hash, false);

    let (_, status) = submitted.watch.await.unwrap();
    assert_eq!(status.unwrap(), TransactionStatus::Failed);
}

#[tokio::test]
async fn test_erc20_revert_surfaces_reason() {
    let rpc = MockRpcClient::mainnet_like();
    *rpc.revert_data.lock().unwrap() =
        Some(error_string_revert("ERC20: transfer amount exceeds balance"));
    let (engine, from) = unlocked_engine(rpc.clone()).await;

    // transfer(0xdead, 1000e18)
    let mut data = hex::decode("a9059cbb").unwrap();
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(recipient().as_bytes());
    let mut amount = [0u8; 32];
    ether(1_000).to_big_endian(&mut amount);
    data.extend_from_slice(&amount);

    let usdt: Address = "0xdAC17F958D2ee523a2206206994597C13D831ec7".parse().unwrap();
    let intent = TransactionIntent {
        data,
        gas_limit: None,
        ..TransactionIntent::transfer(from, 1, usdt, U256::zero())
    };

    let err = engine.send(intent, &SendOptions::default()).await.err().unwrap();
    match err {
        EngineError::SimulationReverted(reason) => {
            assert_eq!(reason, "ERC20: transfer amount exceeds balance")
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(rpc.sent_count(), 0);
    // 估算失败不消耗 nonce
    assert!(engine.nonce_manager().pending(from, 1).await.is_empty());
}

#[tokio::test]
async fn test_cancel_replaces_original() {
    let rpc = MockRpcClient::mainnet_like();
    let (engine, from) = unlocked_engine(rpc.clone()).await;

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let original = engine.send(intent, &SendOptions::default()).await.unwrap();

    let cancel = engine
        .cancel(&original.transaction, None, &SendOptions::default())
        .await
        .unwrap();
    let replacement = &cancel.transaction.unsigned;
    assert_eq!(cancel.transaction.nonce, original.transaction.nonce);
    assert_eq!(replacement.to, Some(from));
    assert!(replacement.value.is_zero());
    assert!(replacement.data.is_empty());
    assert_eq!(replacement.gas_limit, MIN_TRANSFER_GAS);
    // 默认提价 10%
    assert_eq!(replacement.fees.fee_cap(), U256::from(46_200_000_000u64));
    assert_eq!(replacement.fees.tip_cap(), U256::from(2_200_000_000u64));

    rpc.mine(cancel.tx_hash, true);
    let (original_tx, status) = original.watch.await.unwrap();
    assert_eq!(status.unwrap(), TransactionStatus::Replaced);
    assert_eq!(original_tx.replaced_by, Some(cancel.tx_hash));

    let (_, status) = cancel.watch.await.unwrap();
    assert_eq!(status.unwrap(), TransactionStatus::Confirmed);
}

#[tokio::test]
async fn test_replacement_must_not_lower_fees() {
    let rpc = MockRpcClient::mainnet_like();
    let (engine, from) = unlocked_engine(rpc.clone()).await;

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let original = engine.send(intent, &SendOptions::default()).await.unwrap();

    // 节点要求更高的提价幅度
    rpc.send_errors
        .lock()
        .unwrap()
        .push_back("replacement transaction underpriced".into());
    assert!(matches!(
        engine
            .speed_up(&original.transaction, Some(5), &SendOptions::default())
            .await,
        Err(EngineError::ReplacementUnderpriced(_))
    ));

    let faster = engine
        .speed_up(&original.transaction, Some(25), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(faster.transaction.nonce, original.transaction.nonce);
    assert!(faster.transaction.unsigned.fees.fee_cap() > original.transaction.unsigned.fees.fee_cap());

    original.cancel.cancel();
    faster.cancel.cancel();
}

#[tokio::test]
async fn test_cancelled_watch_keeps_broadcast_status() {
    let rpc = MockRpcClient::mainnet_like();
    let (engine, from) = unlocked_engine(rpc.clone()).await;

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let submitted = engine.send(intent, &SendOptions::default()).await.unwrap();
    submitted.cancel.cancel();

    let (tx, result) = submitted.watch.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(tx.status, TransactionStatus::Broadcast);
}

#[tokio::test]
async fn test_unmined_transaction_is_dropped_once_nonce_moves_on() {
    let rpc = MockRpcClient::mainnet_like();
    let mut config = test_config();
    config.watcher.drop_timeout_secs = 0;
    let engine = SigningEngine::new(
        &config,
        ChainProviders::new().with(1, rpc.clone()),
        Arc::new(InMemoryPersistence::new()),
        SecurityDecisionAggregator::new(),
    );
    engine.keyring_store().unlock("pw").await.unwrap();
    engine.keyring_store().import_mnemonic(TEST_MNEMONIC, "").await.unwrap();
    let from = engine.keyring_store().list_accounts().await.unwrap()[0].address;

    let intent = TransactionIntent::transfer(from, 1, recipient(), ether(1));
    let submitted = engine.send(intent, &SendOptions::default()).await.unwrap();

    // 另一笔同 nonce 交易在别处上链，本交易永远不会有回执
    rpc.set_nonce(from, 1);

    let (tx, status) = submitted.watch.await.unwrap();
    assert_eq!(status.unwrap(), TransactionStatus::Dropped);
    assert!(tx.last_error.unwrap().contains("advanced"));
}

//! 集成测试辅助模块
//! 提供脚本化的内存节点和测试用引擎

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::types::U256;
use keyring_engine::config::{Config, KeystoreConfig, NonceConfig, WatcherConfig};
use keyring_engine::domain::account::keccak256;
use keyring_engine::domain::revert::{RevertReason, ERROR_SELECTOR};
use keyring_engine::domain::Address;
use keyring_engine::infrastructure::persistence::InMemoryPersistence;
use keyring_engine::infrastructure::rpc_client::{
    BlockHeader, BlockTag, CallRequest, ChainProviders, FeeHistory, RpcClient, TransactionReceipt,
};
use keyring_engine::service::SecurityDecisionAggregator;
use keyring_engine::{EngineError, EngineResult, SigningEngine};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// 脚本化节点：状态全部可在测试中直接修改
#[derive(Default)]
pub struct MockRpcClient {
    pub nonces: Mutex<HashMap<Address, u64>>,
    pub base_fee: Mutex<U256>,
    pub gas_price: Mutex<U256>,
    pub priority_rewards: Mutex<Vec<U256>>,
    pub gas_estimate: Mutex<Option<u64>>,
    /// 设置后 estimateGas 只返回笼统的 "execution reverted"，eth_call 带原始 revert 数据
    pub revert_data: Mutex<Option<Vec<u8>>>,
    /// 依次弹出的广播错误
    pub send_errors: Mutex<VecDeque<String>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub receipts: Mutex<HashMap<[u8; 32], TransactionReceipt>>,
    pub nonce_calls: AtomicU64,
    pub block_calls: AtomicU64,
}

impl MockRpcClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 典型主网行情：base fee 20 gwei，priority 2 gwei
    pub fn mainnet_like() -> Arc<Self> {
        let rpc = Self::default();
        *rpc.base_fee.lock().unwrap() = gwei(20);
        *rpc.gas_price.lock().unwrap() = gwei(22);
        *rpc.priority_rewards.lock().unwrap() = vec![gwei(2); 5];
        Arc::new(rpc)
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.nonces.lock().unwrap().insert(address, nonce);
    }

    pub fn mine(&self, hash: [u8; 32], success: bool) {
        self.receipts.lock().unwrap().insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                block_number: 18_000_000,
                gas_used: 21_000,
                effective_gas_price: None,
                status: u8::from(success),
            },
        );
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn get_transaction_count(&self, address: Address, _tag: BlockTag) -> EngineResult<u64> {
        self.nonce_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nonces.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> EngineResult<u64> {
        if self.revert_data.lock().unwrap().is_some() {
            return Err(EngineError::SimulationReverted("execution reverted".into()));
        }
        Ok(self.gas_estimate.lock().unwrap().unwrap_or(21_000))
    }

    async fn call(&self, _request: &CallRequest, _tag: BlockTag) -> EngineResult<Vec<u8>> {
        match self.revert_data.lock().unwrap().as_ref() {
            Some(data) => Err(EngineError::SimulationReverted(
                RevertReason::decode(data).to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }

    async fn fee_history(
        &self,
        block_count: u64,
        _newest: BlockTag,
        _reward_percentiles: &[f64],
    ) -> EngineResult<FeeHistory> {
        let base = *self.base_fee.lock().unwrap();
        let rewards = self.priority_rewards.lock().unwrap().clone();
        Ok(FeeHistory {
            oldest_block: 18_000_000 - block_count,
            base_fee_per_gas: vec![base; rewards.len() + 1],
            gas_used_ratio: vec![0.5; rewards.len()],
            reward: rewards.into_iter().map(|r| vec![r]).collect(),
        })
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn get_block(&self, _tag: BlockTag) -> EngineResult<BlockHeader> {
        let n = self.block_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BlockHeader {
            number: 18_000_000 + n,
            base_fee_per_gas: Some(*self.base_fee.lock().unwrap()),
            timestamp: 1_700_000_000 + n * 12,
        })
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> EngineResult<[u8; 32]> {
        if let Some(message) = self.send_errors.lock().unwrap().pop_front() {
            return Err(EngineError::from_node_message(&message));
        }
        self.sent.lock().unwrap().push(raw.to_vec());
        Ok(keccak256(raw))
    }

    async fn get_transaction_receipt(
        &self,
        hash: &[u8; 32],
    ) -> EngineResult<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().unwrap().get(hash).cloned())
    }
}

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

/// ABI 编码的 `Error(string)` revert 数据
pub fn error_string_revert(message: &str) -> Vec<u8> {
    let mut data = ERROR_SELECTOR.to_vec();
    let mut word = [0u8; 32];
    word[31] = 0x20;
    data.extend_from_slice(&word);

    let mut len = [0u8; 32];
    len[24..].copy_from_slice(&(message.len() as u64).to_be_bytes());
    data.extend_from_slice(&len);

    let mut body = message.as_bytes().to_vec();
    body.resize(message.len().div_ceil(32) * 32, 0);
    data.extend_from_slice(&body);
    data
}

/// 轮询快、KDF 轻量的测试配置
pub fn test_config() -> Config {
    Config {
        keystore: KeystoreConfig {
            session_pbkdf2_rounds: 1_024,
            scrypt_log_n: 10,
            blob_path: None,
        },
        watcher: WatcherConfig {
            poll_interval_ms: 10,
            max_poll_interval_ms: 50,
            backoff_multiplier: 2.0,
            drop_timeout_secs: 600,
        },
        nonce: NonceConfig { cache_ttl_secs: 300 },
        ..Config::default()
    }
}

/// 已解锁、导入了测试助记词的引擎（账户 m/44'/60'/0'/0/0）
pub async fn unlocked_engine(rpc: Arc<MockRpcClient>) -> (SigningEngine, Address) {
    unlocked_engine_with(rpc, SecurityDecisionAggregator::new()).await
}

pub async fn unlocked_engine_with(
    rpc: Arc<MockRpcClient>,
    security: SecurityDecisionAggregator,
) -> (SigningEngine, Address) {
    let engine = SigningEngine::new(
        &test_config(),
        ChainProviders::new().with(1, rpc.clone()).with(56, rpc),
        Arc::new(InMemoryPersistence::new()),
        security,
    );
    engine
        .keyring_store()
        .unlock("integration-password")
        .await
        .expect("unlock");
    engine
        .keyring_store()
        .import_mnemonic(TEST_MNEMONIC, "")
        .await
        .expect("import mnemonic");
    let accounts = engine.keyring_store().list_accounts().await.expect("accounts");
    (engine, accounts[0].address)
}

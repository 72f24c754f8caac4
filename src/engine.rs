//! 签名引擎组合根
//!
//! 持有各服务的 `Arc`，编排 发送 / 加速 / 取消 流程：
//! build → 安全闸门 → sign → broadcast → watch

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::account::{Address, KeyringId};
use crate::domain::chain_config::ChainRegistry;
use crate::domain::signature::RecoverableSignature;
use crate::domain::transaction_status::{TrackedTransaction, TransactionStatus};
use crate::domain::typed_data::TypedDataPayload;
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::cancel::CancelToken;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::{FilePersistence, InMemoryPersistence, KeyringPersistence};
use crate::infrastructure::rpc_client::ChainProviders;
use crate::service::{
    Broadcaster, FeeEstimator, KeyringStore, NonceManager, SecurityDecisionAggregator, Signer,
    SigningRequest, TransactionBuilder, TransactionIntent, TransactionWatcher,
};

/// 发送选项
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// 用户已确认 warning / danger 提示
    pub acknowledged: bool,
    /// 发起方（DApp origin），交给规则源参考
    pub origin: Option<String>,
}

impl SendOptions {
    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            origin: None,
        }
    }
}

/// 已广播的交易及其监听任务
pub struct SubmittedTransaction {
    /// 广播时刻的快照，用于发起加速 / 取消
    pub transaction: TrackedTransaction,
    pub tx_hash: [u8; 32],
    pub cancel: CancelToken,
    pub watch: JoinHandle<(TrackedTransaction, EngineResult<TransactionStatus>)>,
}

impl SubmittedTransaction {
    pub fn tx_id(&self) -> Uuid {
        self.transaction.id
    }

    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.tx_hash))
    }
}

pub struct SigningEngine {
    chains: Arc<ChainRegistry>,
    events: EventBus,
    keyring_store: Arc<KeyringStore>,
    signer: Arc<Signer>,
    fee_estimator: Arc<FeeEstimator>,
    nonce_manager: Arc<NonceManager>,
    builder: Arc<TransactionBuilder>,
    broadcaster: Arc<Broadcaster>,
    watcher: Arc<TransactionWatcher>,
    security: Arc<SecurityDecisionAggregator>,
}

impl SigningEngine {
    /// 按配置构建：节点客户端来自链注册表，blob 路径为空时使用内存存储
    pub fn from_config(config: &Config) -> EngineResult<Self> {
        let chains = ChainRegistry::with_overrides(&config.chains);
        let providers = ChainProviders::from_registry(&chains, &config.rpc)?;
        let persistence: Arc<dyn KeyringPersistence> = match &config.keystore.blob_path {
            Some(path) => Arc::new(FilePersistence::new(path)),
            None => Arc::new(InMemoryPersistence::new()),
        };
        Ok(Self::new(
            config,
            providers,
            persistence,
            SecurityDecisionAggregator::new(),
        ))
    }

    pub fn new(
        config: &Config,
        providers: ChainProviders,
        persistence: Arc<dyn KeyringPersistence>,
        security: SecurityDecisionAggregator,
    ) -> Self {
        let chains = Arc::new(ChainRegistry::with_overrides(&config.chains));
        let providers = Arc::new(providers);
        let events = EventBus::new();

        let keyring_store = Arc::new(KeyringStore::new(
            persistence,
            events.clone(),
            config.keystore.clone(),
        ));
        let signer = Arc::new(Signer::new(keyring_store.clone()));
        let fee_estimator = Arc::new(FeeEstimator::new(
            providers.clone(),
            chains.clone(),
            config.fees.clone(),
        ));
        let nonce_manager = Arc::new(NonceManager::new(providers.clone(), &config.nonce));
        let builder = Arc::new(TransactionBuilder::new(
            chains.clone(),
            fee_estimator.clone(),
            nonce_manager.clone(),
            config.fees.replacement_bump_percent,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            providers.clone(),
            nonce_manager.clone(),
            events.clone(),
        ));
        let watcher = Arc::new(TransactionWatcher::new(
            providers,
            nonce_manager.clone(),
            events.clone(),
            config.watcher.clone(),
        ));

        Self {
            chains,
            events,
            keyring_store,
            signer,
            fee_estimator,
            nonce_manager,
            builder,
            broadcaster,
            watcher,
            security: Arc::new(security),
        }
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn keyring_store(&self) -> &Arc<KeyringStore> {
        &self.keyring_store
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub fn fee_estimator(&self) -> &Arc<FeeEstimator> {
        &self.fee_estimator
    }

    pub fn nonce_manager(&self) -> &Arc<NonceManager> {
        &self.nonce_manager
    }

    async fn owner_of(&self, address: &Address) -> EngineResult<KeyringId> {
        self.keyring_store
            .find_keyring(address)
            .await?
            .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 交易
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// 新交易
    ///
    /// 签名前失败或节点明确拒绝时归还 nonce；广播结果不明（超时 / 网络 / 未归类错误）时
    /// 节点可能已收到交易，nonce 保持占用，等下次链上同步再决定
    pub async fn send(
        &self,
        intent: TransactionIntent,
        options: &SendOptions,
    ) -> EngineResult<SubmittedTransaction> {
        let keyring_id = self.owner_of(&intent.from).await?;
        let mut tx = self.builder.build(intent).await?;

        match self.sign_and_broadcast(keyring_id, &mut tx, options).await {
            Ok(hash) => Ok(self.watch(tx, hash)),
            Err(e) => {
                if tx.status != TransactionStatus::Signed || e.is_node_rejection() {
                    self.nonce_manager.release(tx.from, tx.chain_id, tx.nonce).await;
                } else {
                    tracing::warn!(
                        tx_id = %tx.id,
                        chain_id = tx.chain_id,
                        nonce = tx.nonce,
                        error = %e,
                        "broadcast outcome unknown, nonce kept pending"
                    );
                }
                Err(e)
            }
        }
    }

    /// 加速：同 nonce 提价重发；原交易的监听会在替换交易上链后进入 Replaced
    pub async fn speed_up(
        &self,
        original: &TrackedTransaction,
        bump_percent: Option<u64>,
        options: &SendOptions,
    ) -> EngineResult<SubmittedTransaction> {
        let replacement = self.builder.build_speed_up(original, bump_percent)?;
        self.submit_replacement(original, replacement, options).await
    }

    /// 取消：同 nonce 给自己转 0
    pub async fn cancel(
        &self,
        original: &TrackedTransaction,
        bump_percent: Option<u64>,
        options: &SendOptions,
    ) -> EngineResult<SubmittedTransaction> {
        let replacement = self.builder.build_cancel(original, bump_percent)?;
        self.submit_replacement(original, replacement, options).await
    }

    async fn submit_replacement(
        &self,
        original: &TrackedTransaction,
        mut replacement: TrackedTransaction,
        options: &SendOptions,
    ) -> EngineResult<SubmittedTransaction> {
        let keyring_id = self.owner_of(&original.from).await?;
        // nonce 仍被原交易占用，失败时不归还
        let hash = self
            .sign_and_broadcast(keyring_id, &mut replacement, options)
            .await?;
        self.watcher.register_replacement(original.id, hash).await;
        tracing::info!(
            original_tx = %original.id,
            replacement_tx = %replacement.id,
            nonce = replacement.nonce,
            "replacement transaction submitted"
        );
        Ok(self.watch(replacement, hash))
    }

    async fn sign_and_broadcast(
        &self,
        keyring_id: KeyringId,
        tx: &mut TrackedTransaction,
        options: &SendOptions,
    ) -> EngineResult<[u8; 32]> {
        let request = SigningRequest::Transaction {
            from: &tx.from,
            tx: &tx.unsigned,
            origin: options.origin.as_deref(),
        };
        let decision = self.security.evaluate(&request).await;
        SecurityDecisionAggregator::gate(&decision, options.acknowledged)?;

        let signed = self
            .signer
            .sign_transaction(keyring_id, &tx.from, tx.unsigned.clone())
            .await?;
        tx.attach_signature(signed)?;
        self.broadcaster.broadcast(tx).await
    }

    fn watch(&self, tx: TrackedTransaction, tx_hash: [u8; 32]) -> SubmittedTransaction {
        let cancel = CancelToken::new();
        let snapshot = tx.clone();
        let watch = self.watcher.spawn_watch(tx, cancel.clone());
        SubmittedTransaction {
            transaction: snapshot,
            tx_hash,
            cancel,
            watch,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 消息签名
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn sign_typed_data(
        &self,
        address: &Address,
        payload: &TypedDataPayload,
        options: &SendOptions,
    ) -> EngineResult<RecoverableSignature> {
        let keyring_id = self.owner_of(address).await?;
        let request = SigningRequest::TypedData {
            address,
            payload,
            origin: options.origin.as_deref(),
        };
        let decision = self.security.evaluate(&request).await;
        SecurityDecisionAggregator::gate(&decision, options.acknowledged)?;
        self.signer.sign_typed_data(keyring_id, address, payload).await
    }

    pub async fn sign_personal_message(
        &self,
        address: &Address,
        message: &[u8],
        options: &SendOptions,
    ) -> EngineResult<RecoverableSignature> {
        let keyring_id = self.owner_of(address).await?;
        let request = SigningRequest::PersonalMessage {
            address,
            message,
            origin: options.origin.as_deref(),
        };
        let decision = self.security.evaluate(&request).await;
        SecurityDecisionAggregator::gate(&decision, options.acknowledged)?;
        self.signer
            .sign_personal_message(keyring_id, address, message)
            .await
    }
}

//! 交易监听
//!
//! 每笔已广播交易一个轮询任务：
//! - 回执 status=1 → Confirmed，status=0 → Failed
//! - 登记过的替换交易出现回执 → Replaced
//! - 超过丢弃窗口仍无回执，且账户 nonce 已越过本交易 → Dropped
//!
//! 轮询间隔在空结果时指数退避；取消只停止监听，不改写已广播的状态

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{sync::RwLock, task::JoinHandle, time::sleep};
use uuid::Uuid;

use crate::config::WatcherConfig;
use crate::domain::transaction_status::{TrackedTransaction, TransactionStatus};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::cancel::CancelToken;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::retry::Backoff;
use crate::infrastructure::rpc_client::{BlockTag, ChainProviders, RpcClient, TransactionReceipt};
use crate::service::broadcaster::status_changed;
use crate::service::nonce_manager::NonceManager;

pub struct TransactionWatcher {
    providers: Arc<ChainProviders>,
    nonce_manager: Arc<NonceManager>,
    events: EventBus,
    config: WatcherConfig,
    /// 原交易 id → 同 nonce 的替换交易哈希
    replacements: RwLock<HashMap<Uuid, Vec<[u8; 32]>>>,
}

impl TransactionWatcher {
    pub fn new(
        providers: Arc<ChainProviders>,
        nonce_manager: Arc<NonceManager>,
        events: EventBus,
        config: WatcherConfig,
    ) -> Self {
        Self {
            providers,
            nonce_manager,
            events,
            config,
            replacements: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一笔已广播的替换交易（加速 / 取消）
    pub async fn register_replacement(&self, original_id: Uuid, replacement_hash: [u8; 32]) {
        self.replacements
            .write()
            .await
            .entry(original_id)
            .or_default()
            .push(replacement_hash);
    }

    async fn replacements_of(&self, id: &Uuid) -> Vec<[u8; 32]> {
        self.replacements
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// 在后台任务中监听，任务结束时交还交易记录
    pub fn spawn_watch(
        self: &Arc<Self>,
        mut tx: TrackedTransaction,
        cancel: CancelToken,
    ) -> JoinHandle<(TrackedTransaction, EngineResult<TransactionStatus>)> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = watcher.watch(&mut tx, &cancel).await;
            (tx, result)
        })
    }

    /// 轮询直到交易进入最终状态或被取消
    pub async fn watch(
        &self,
        tx: &mut TrackedTransaction,
        cancel: &CancelToken,
    ) -> EngineResult<TransactionStatus> {
        if tx.status != TransactionStatus::Broadcast {
            return Err(EngineError::InvalidTransaction(format!(
                "only broadcast transactions can be watched (status: {})",
                tx.status
            )));
        }
        let hash = tx
            .hash()
            .ok_or_else(|| EngineError::InvalidTransaction("transaction has no hash".into()))?;
        let rpc = self.providers.get(tx.chain_id)?;

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.poll_interval_ms),
            Duration::from_millis(self.config.max_poll_interval_ms),
            self.config.backoff_multiplier,
        );
        let drop_after = Duration::from_secs(self.config.drop_timeout_secs);
        let started = Instant::now();

        tracing::debug!(tx_id = %tx.id, tx_hash = %hex::encode(hash), "watching transaction");

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self.poll_once(rpc.as_ref(), tx, &hash, started.elapsed() >= drop_after).await {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(tx_id = %tx.id, error = %e, "receipt poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(tx_id = %tx.id, status = %tx.status, "watch cancelled");
                    return Err(EngineError::Cancelled);
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn poll_once(
        &self,
        rpc: &dyn RpcClient,
        tx: &mut TrackedTransaction,
        hash: &[u8; 32],
        drop_window_elapsed: bool,
    ) -> EngineResult<Option<TransactionStatus>> {
        if let Some(status) = self.check_receipts(rpc, tx, hash).await? {
            return Ok(Some(status));
        }

        if drop_window_elapsed {
            let mined_nonce = rpc.get_transaction_count(tx.from, BlockTag::Latest).await?;
            if mined_nonce > tx.nonce {
                // 两次查询之间本交易或替换交易可能刚好上链，先再查一遍回执
                if let Some(status) = self.check_receipts(rpc, tx, hash).await? {
                    return Ok(Some(status));
                }
                tx.last_error = Some(format!(
                    "no receipt and account nonce advanced to {}",
                    mined_nonce
                ));
                self.finish(tx, TransactionStatus::Dropped, None, None).await?;
                return Ok(Some(TransactionStatus::Dropped));
            }
        }

        Ok(None)
    }

    /// 查本交易及其已登记替换交易的回执，有结果即进入终态
    async fn check_receipts(
        &self,
        rpc: &dyn RpcClient,
        tx: &mut TrackedTransaction,
        hash: &[u8; 32],
    ) -> EngineResult<Option<TransactionStatus>> {
        if let Some(receipt) = rpc.get_transaction_receipt(hash).await? {
            let status = if receipt.status == 1 {
                TransactionStatus::Confirmed
            } else {
                TransactionStatus::Failed
            };
            if status == TransactionStatus::Failed {
                tx.last_error = Some("transaction reverted on-chain".into());
            }
            self.finish(tx, status, Some(&receipt), None).await?;
            return Ok(Some(status));
        }

        for replacement in self.replacements_of(&tx.id).await {
            if let Some(receipt) = rpc.get_transaction_receipt(&replacement).await? {
                self.finish(tx, TransactionStatus::Replaced, Some(&receipt), Some(replacement))
                    .await?;
                return Ok(Some(TransactionStatus::Replaced));
            }
        }

        Ok(None)
    }

    async fn finish(
        &self,
        tx: &mut TrackedTransaction,
        status: TransactionStatus,
        receipt: Option<&TransactionReceipt>,
        replaced_by: Option<[u8; 32]>,
    ) -> EngineResult<()> {
        let from_status = tx.status;
        tx.transition(status)?;
        if let Some(receipt) = receipt {
            // 被替换时记录的是替换交易所在区块
            tx.block_number = Some(receipt.block_number);
            if status != TransactionStatus::Replaced {
                tx.gas_used = Some(receipt.gas_used);
            }
        }
        tx.replaced_by = replaced_by;

        self.nonce_manager
            .mark_confirmed(tx.from, tx.chain_id, tx.nonce)
            .await;
        self.replacements.write().await.remove(&tx.id);

        match status {
            TransactionStatus::Confirmed => tracing::info!(
                tx_id = %tx.id,
                chain_id = tx.chain_id,
                nonce = tx.nonce,
                block_number = ?tx.block_number,
                "transaction confirmed"
            ),
            _ => tracing::warn!(
                tx_id = %tx.id,
                chain_id = tx.chain_id,
                nonce = tx.nonce,
                status = %status,
                reason = ?tx.last_error,
                "transaction finished without confirmation"
            ),
        }

        self.events.publish(status_changed(tx, from_status)).await;
        Ok(())
    }
}

//! 交易广播
//!
//! Signed → Broadcast 只在节点接受后发生；节点立即拒绝（nonce too low / underpriced /
//! insufficient funds）时交易保持 Signed，错误原样返回，不做任何自动重试
//!
//! 超时 / 网络错误等结果不明的失败同样保持 Signed，并要求下次分配 nonce 前重新同步链上状态

use std::sync::Arc;

use crate::domain::transaction_status::{TrackedTransaction, TransactionStatus};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::event_bus::{EngineEvent, EventBus};
use crate::infrastructure::rpc_client::ChainProviders;
use crate::service::nonce_manager::NonceManager;

pub struct Broadcaster {
    providers: Arc<ChainProviders>,
    nonce_manager: Arc<NonceManager>,
    events: EventBus,
}

impl Broadcaster {
    pub fn new(providers: Arc<ChainProviders>, nonce_manager: Arc<NonceManager>, events: EventBus) -> Self {
        Self {
            providers,
            nonce_manager,
            events,
        }
    }

    /// eth_sendRawTransaction，只发送一次
    pub async fn broadcast(&self, tx: &mut TrackedTransaction) -> EngineResult<[u8; 32]> {
        if tx.status != TransactionStatus::Signed {
            return Err(EngineError::InvalidStateTransition {
                from: tx.status.to_string(),
                to: TransactionStatus::Broadcast.to_string(),
            });
        }
        let signed = tx
            .signed
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransaction("transaction has no signature".into()))?;
        let local_hash = signed.hash;
        let rpc = self.providers.get(tx.chain_id)?;

        match rpc.send_raw_transaction(&signed.raw).await {
            Ok(node_hash) => {
                if node_hash != local_hash {
                    tracing::warn!(
                        tx_id = %tx.id,
                        local_hash = %hex::encode(local_hash),
                        node_hash = %hex::encode(node_hash),
                        "node returned a different transaction hash"
                    );
                }
            }
            // 重复提交同一笔已签名交易，节点已在交易池中持有它
            Err(EngineError::Rpc(message)) if message.to_lowercase().contains("already known") => {
                tracing::debug!(tx_id = %tx.id, "transaction already known to node");
            }
            Err(e) if e.is_node_rejection() => {
                tracing::warn!(
                    tx_id = %tx.id,
                    chain_id = tx.chain_id,
                    nonce = tx.nonce,
                    error = %e,
                    code = e.code(),
                    "broadcast rejected by node"
                );
                tx.last_error = Some(e.to_string());
                if matches!(e, EngineError::NonceTooLow(_)) {
                    self.nonce_manager.resync(tx.from, tx.chain_id).await;
                }
                return Err(e);
            }
            // 节点可能已收到交易，下次分配前以链上 pending nonce 为准
            Err(e) => {
                tracing::warn!(
                    tx_id = %tx.id,
                    chain_id = tx.chain_id,
                    nonce = tx.nonce,
                    error = %e,
                    code = e.code(),
                    "broadcast outcome unknown"
                );
                tx.last_error = Some(e.to_string());
                self.nonce_manager.resync(tx.from, tx.chain_id).await;
                return Err(e);
            }
        }

        tx.transition(TransactionStatus::Broadcast)?;
        tx.last_error = None;
        tracing::info!(
            tx_id = %tx.id,
            chain_id = tx.chain_id,
            nonce = tx.nonce,
            tx_hash = %format!("0x{}", hex::encode(local_hash)),
            "transaction broadcast"
        );
        self.events
            .publish(status_changed(tx, TransactionStatus::Signed))
            .await;
        Ok(local_hash)
    }
}

/// 构造状态变更事件
pub(crate) fn status_changed(tx: &TrackedTransaction, from_status: TransactionStatus) -> EngineEvent {
    EngineEvent::TransactionStatusChanged {
        tx_id: tx.id,
        tx_hash: tx.hash().map(|h| format!("0x{}", hex::encode(h))),
        chain_id: tx.chain_id,
        nonce: tx.nonce,
        from_status,
        to_status: tx.status,
    }
}

// Event Bus 框架
// 引擎内事件发布/订阅，UI 层通过 subscribe 获取锁定状态与交易状态变化

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::domain::account::{Address, KeyringId};
use crate::domain::transaction_status::TransactionStatus;

const CHANNEL_CAPACITY: usize = 256;
const HISTORY_LIMIT: usize = 512;

// ============ 事件类型定义 ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    AccountAdded {
        keyring_id: KeyringId,
        address: Address,
    },
    KeyringRemoved {
        keyring_id: KeyringId,
    },
    WalletLocked,
    WalletUnlocked,
    TransactionStatusChanged {
        tx_id: Uuid,
        tx_hash: Option<String>,
        chain_id: u64,
        nonce: u64,
        from_status: TransactionStatus,
        to_status: TransactionStatus,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccountAdded { .. } => "AccountAdded",
            Self::KeyringRemoved { .. } => "KeyringRemoved",
            Self::WalletLocked => "WalletLocked",
            Self::WalletUnlocked => "WalletUnlocked",
            Self::TransactionStatusChanged { .. } => "TransactionStatusChanged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event: EngineEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

// ============ Event Bus 实现 ============

/// 进程内事件总线
///
/// 没有订阅者时发布不报错；慢订阅者会收到 `Lagged` 并跳过旧事件
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    history: Arc<RwLock<VecDeque<EventEnvelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT))),
        }
    }

    /// 发布事件
    pub async fn publish(&self, event: EngineEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event,
            published_at: chrono::Utc::now(),
        };

        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = envelope.event.event_type(),
            "event published"
        );

        {
            let mut history = self.history.write().await;
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(envelope.clone());
        }

        // 无订阅者时 send 返回 Err，忽略即可
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// 获取事件历史（新事件在前）
    pub async fn get_event_history(&self, limit: usize, offset: usize) -> Vec<EventEnvelope> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let keyring_id = KeyringId::new();
        bus.publish(EngineEvent::KeyringRemoved { keyring_id }).await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, EngineEvent::KeyringRemoved { keyring_id });
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_and_history() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::WalletUnlocked).await;
        bus.publish(EngineEvent::WalletLocked).await;

        let history = bus.get_event_history(10, 0).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, EngineEvent::WalletLocked);

        let page = bus.get_event_history(10, 1).await;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].event, EngineEvent::WalletUnlocked);
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::TransactionStatusChanged {
            tx_id: Uuid::new_v4(),
            tx_hash: Some("0x1234".into()),
            chain_id: 1,
            nonce: 7,
            from_status: TransactionStatus::Broadcast,
            to_status: TransactionStatus::Confirmed,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("TransactionStatusChanged"));
        assert!(json.contains("\"confirmed\""));

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}

//! 交易生命周期状态
//!
//! `Built → Signed → Broadcast → {Confirmed | Replaced | Dropped | Failed}`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::account::Address;
use crate::domain::transaction::{SignedTransaction, UnsignedTransaction};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// 已构建，等待签名
    Built,

    /// 已签名，等待广播（节点拒绝后也停留在此状态）
    Signed,

    /// 已被节点接受，等待上链
    Broadcast,

    /// 回执 status = 1
    Confirmed,

    /// 同 nonce 的替换交易已确认
    Replaced,

    /// 超时无回执且账户 nonce 已越过本交易
    Dropped,

    /// 回执 status = 0
    Failed,
}

impl TransactionStatus {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Built => "交易已构建",
            Self::Signed => "交易已签名",
            Self::Broadcast => "交易已广播",
            Self::Confirmed => "交易已确认",
            Self::Replaced => "交易已被替换",
            Self::Dropped => "交易已丢弃",
            Self::Failed => "交易执行失败",
        }
    }

    /// 是否为最终状态（不可再转换）
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Replaced | Self::Dropped | Self::Failed
        )
    }

    /// 验证状态转换合法性
    pub fn can_transition_to(&self, target: &Self) -> bool {
        use TransactionStatus::*;

        matches!(
            (self, target),
            (Built, Signed)
                | (Signed, Broadcast)
                | (Broadcast, Confirmed)
                | (Broadcast, Replaced)
                | (Broadcast, Dropped)
                | (Broadcast, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Built => "built",
            Self::Signed => "signed",
            Self::Broadcast => "broadcast",
            Self::Confirmed => "confirmed",
            Self::Replaced => "replaced",
            Self::Dropped => "dropped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for TransactionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransactionStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use TransactionStatus::*;

        let order = |s: &TransactionStatus| -> u8 {
            match s {
                Built => 0,
                Signed => 1,
                Broadcast => 2,
                Confirmed | Replaced | Dropped | Failed => 3,
            }
        };

        order(self).cmp(&order(other))
    }
}

/// 一笔受跟踪交易的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub id: Uuid,
    pub from: Address,
    pub chain_id: u64,
    pub nonce: u64,
    pub status: TransactionStatus,
    pub unsigned: UnsignedTransaction,
    pub signed: Option<SignedTransaction>,
    /// 被替换时记录替换交易的哈希
    #[serde(default, with = "crate::domain::hex_serde::opt_bytes32")]
    pub replaced_by: Option<[u8; 32]>,
    /// 回执中的区块号
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    /// 最后一次节点拒绝或 revert 原因
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedTransaction {
    pub fn new(from: Address, unsigned: UnsignedTransaction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            from,
            chain_id: unsigned.chain_id,
            nonce: unsigned.nonce,
            status: TransactionStatus::Built,
            unsigned,
            signed: None,
            replaced_by: None,
            block_number: None,
            gas_used: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn hash(&self) -> Option<[u8; 32]> {
        self.signed.as_ref().map(|s| s.hash)
    }

    /// 强制状态机约束的转换
    pub fn transition(&mut self, to: TransactionStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(&to) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(
            tx_id = %self.id,
            nonce = self.nonce,
            from_status = %self.status,
            to_status = %to,
            "transaction status transition"
        );
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Built → Signed
    pub fn attach_signature(&mut self, signed: SignedTransaction) -> EngineResult<()> {
        if signed.transaction != self.unsigned {
            return Err(EngineError::InvalidTransaction(
                "signed payload does not match the built transaction".into(),
            ));
        }
        self.transition(TransactionStatus::Signed)?;
        self.signed = Some(signed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TransactionStatus::*;

        assert!(Built.can_transition_to(&Signed));
        assert!(Signed.can_transition_to(&Broadcast));
        assert!(Broadcast.can_transition_to(&Confirmed));
        assert!(Broadcast.can_transition_to(&Replaced));
        assert!(Broadcast.can_transition_to(&Dropped));
        assert!(Broadcast.can_transition_to(&Failed));

        assert!(!Built.can_transition_to(&Broadcast));
        assert!(!Signed.can_transition_to(&Confirmed));
        assert!(!Broadcast.can_transition_to(&Signed));

        for terminal in [Confirmed, Replaced, Dropped, Failed] {
            assert!(terminal.is_final());
            for target in [Built, Signed, Broadcast, Confirmed, Replaced, Dropped, Failed] {
                assert!(!terminal.can_transition_to(&target));
            }
        }
    }

    #[test]
    fn test_ordering_and_display() {
        use TransactionStatus::*;
        assert!(Built < Signed);
        assert!(Signed < Broadcast);
        assert!(Broadcast < Dropped);
        assert_eq!(Broadcast.to_string(), "broadcast");
        assert_eq!(serde_json::to_string(&Dropped).unwrap(), "\"dropped\"");
    }
}

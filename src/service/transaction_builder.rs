//! 交易构建器
//!
//! 把用户意图补全为 `UnsignedTransaction`：费用、gas limit、nonce。
//! 替换交易（加速 / 取消）复用原 nonce，且费用不得低于原交易。

use std::sync::Arc;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::domain::account::Address;
use crate::domain::chain_config::ChainRegistry;
use crate::domain::transaction::{AccessListItem, GasPricing, UnsignedTransaction, MIN_TRANSFER_GAS};
use crate::domain::transaction_status::{TrackedTransaction, TransactionStatus};
use crate::error::{EngineError, EngineResult};
use crate::service::fee_estimator::{FeeEstimator, GasSpeed};
use crate::service::nonce_manager::NonceManager;

/// 交易构建请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionIntent {
    pub from: Address,
    pub chain_id: u64,
    /// None 表示合约创建
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default, with = "crate::domain::hex_serde::bytes")]
    pub data: Vec<u8>,
    /// 不填时由节点模拟估算
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// 不填时由 FeeEstimator 给出
    #[serde(default)]
    pub fees: Option<GasPricing>,
    #[serde(default)]
    pub speed: GasSpeed,
    #[serde(default)]
    pub access_list: Vec<AccessListItem>,
}

impl TransactionIntent {
    /// 原生币转账
    pub fn transfer(from: Address, chain_id: u64, to: Address, value: U256) -> Self {
        Self {
            from,
            chain_id,
            to: Some(to),
            value,
            data: Vec::new(),
            gas_limit: Some(MIN_TRANSFER_GAS),
            fees: None,
            speed: GasSpeed::Normal,
            access_list: Vec::new(),
        }
    }
}

pub struct TransactionBuilder {
    chains: Arc<ChainRegistry>,
    fee_estimator: Arc<FeeEstimator>,
    nonce_manager: Arc<NonceManager>,
    /// 加速 / 取消默认提价百分比
    default_bump_percent: u64,
}

impl TransactionBuilder {
    pub fn new(
        chains: Arc<ChainRegistry>,
        fee_estimator: Arc<FeeEstimator>,
        nonce_manager: Arc<NonceManager>,
        default_bump_percent: u64,
    ) -> Self {
        Self {
            chains,
            fee_estimator,
            nonce_manager,
            default_bump_percent,
        }
    }

    pub fn default_bump_percent(&self) -> u64 {
        self.default_bump_percent
    }

    /// 构建新交易
    ///
    /// 费用与 gas 估算在分配 nonce 之前完成；nonce 分配后任何失败都会归还 nonce
    pub async fn build(&self, intent: TransactionIntent) -> EngineResult<TrackedTransaction> {
        let chain = self.chains.require(intent.chain_id)?;

        let fees = match intent.fees {
            Some(fees) => fees,
            None => {
                self.fee_estimator
                    .suggest_pricing(intent.chain_id, intent.speed)
                    .await?
            }
        };
        if matches!(fees, GasPricing::Eip1559 { .. }) && !chain.supports_eip1559 {
            return Err(EngineError::InvalidTransaction(format!(
                "{} does not accept EIP-1559 transactions",
                chain.name
            )));
        }

        let mut unsigned = UnsignedTransaction {
            chain_id: intent.chain_id,
            nonce: 0,
            to: intent.to,
            value: intent.value,
            data: intent.data,
            gas_limit: intent.gas_limit.unwrap_or(0),
            fees,
            access_list: intent.access_list,
        };

        if intent.gas_limit.is_none() {
            unsigned.gas_limit = self
                .fee_estimator
                .estimate_gas_limit(intent.chain_id, intent.from, &unsigned)
                .await?;
        }

        unsigned.nonce = self
            .nonce_manager
            .allocate(intent.from, intent.chain_id)
            .await?;

        if let Err(e) = unsigned.validate() {
            self.nonce_manager
                .release(intent.from, intent.chain_id, unsigned.nonce)
                .await;
            return Err(e);
        }

        tracing::info!(
            chain_id = unsigned.chain_id,
            from = %intent.from,
            nonce = unsigned.nonce,
            gas_limit = unsigned.gas_limit,
            tx_type = ?unsigned.tx_type(),
            "transaction built"
        );
        Ok(TrackedTransaction::new(intent.from, unsigned))
    }

    /// 加速：同 nonce、同内容，费用按百分比提高
    pub fn build_speed_up(
        &self,
        original: &TrackedTransaction,
        bump_percent: Option<u64>,
    ) -> EngineResult<TrackedTransaction> {
        let fees = original
            .unsigned
            .fees
            .bumped(bump_percent.unwrap_or(self.default_bump_percent));
        self.build_speed_up_with_fees(original, fees)
    }

    /// 以指定费用加速
    pub fn build_speed_up_with_fees(
        &self,
        original: &TrackedTransaction,
        fees: GasPricing,
    ) -> EngineResult<TrackedTransaction> {
        ensure_replaceable(original)?;
        check_replacement_fees(&original.unsigned.fees, &fees)?;

        let unsigned = UnsignedTransaction {
            fees,
            ..original.unsigned.clone()
        };
        unsigned.validate()?;

        tracing::info!(
            tx_id = %original.id,
            chain_id = unsigned.chain_id,
            nonce = unsigned.nonce,
            "speed-up transaction built"
        );
        Ok(TrackedTransaction::new(original.from, unsigned))
    }

    /// 取消：同 nonce 给自己转 0，费用按百分比提高
    pub fn build_cancel(
        &self,
        original: &TrackedTransaction,
        bump_percent: Option<u64>,
    ) -> EngineResult<TrackedTransaction> {
        ensure_replaceable(original)?;
        let fees = original
            .unsigned
            .fees
            .bumped(bump_percent.unwrap_or(self.default_bump_percent));
        check_replacement_fees(&original.unsigned.fees, &fees)?;

        let unsigned = UnsignedTransaction {
            chain_id: original.chain_id,
            nonce: original.nonce,
            to: Some(original.from),
            value: U256::zero(),
            data: Vec::new(),
            gas_limit: MIN_TRANSFER_GAS,
            fees,
            access_list: Vec::new(),
        };
        unsigned.validate()?;

        tracing::info!(
            tx_id = %original.id,
            chain_id = unsigned.chain_id,
            nonce = unsigned.nonce,
            "cancel transaction built"
        );
        Ok(TrackedTransaction::new(original.from, unsigned))
    }
}

fn ensure_replaceable(original: &TrackedTransaction) -> EngineResult<()> {
    if original.status != TransactionStatus::Broadcast {
        return Err(EngineError::InvalidTransaction(format!(
            "only broadcast transactions can be replaced (status: {})",
            original.status
        )));
    }
    Ok(())
}

/// 替换交易的 fee cap 与 tip cap 都不得低于原交易
pub fn check_replacement_fees(original: &GasPricing, replacement: &GasPricing) -> EngineResult<()> {
    if replacement.fee_cap() < original.fee_cap() {
        return Err(EngineError::ReplacementUnderpriced(format!(
            "fee cap {} is below original {}",
            replacement.fee_cap(),
            original.fee_cap()
        )));
    }
    if replacement.tip_cap() < original.tip_cap() {
        return Err(EngineError::ReplacementUnderpriced(format!(
            "priority fee {} is below original {}",
            replacement.tip_cap(),
            original.tip_cap()
        )));
    }
    Ok(())
}

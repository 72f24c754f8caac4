//! 费用估算服务
//!
//! - legacy：最近区块有效 gas price 的中位数，历史数据不可用时退回 eth_gasPrice
//! - EIP-1559：priority fee 取最近区块奖励的 EMA；baseFee 每次都从 latest 区块头读取，不缓存
//! - maxFeePerGas = baseFee * 2 + maxPriorityFeePerGas

use std::sync::Arc;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::config::FeeConfig;
use crate::domain::account::Address;
use crate::domain::chain_config::ChainRegistry;
use crate::domain::transaction::{GasPricing, UnsignedTransaction, MIN_TRANSFER_GAS};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::rpc_client::{BlockTag, CallRequest, ChainProviders, FeeHistory};

/// 费用档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl GasSpeed {
    /// priority fee 百分比倍数
    fn priority_percent(self) -> u64 {
        match self {
            Self::Slow => 80,
            Self::Normal => 100,
            Self::Fast => 125,
        }
    }
}

/// EIP-1559 费用估算结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip1559Fees {
    /// 估算时 latest 区块的 baseFee
    pub base_fee: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl Eip1559Fees {
    pub fn into_pricing(self) -> GasPricing {
        GasPricing::Eip1559 {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }
}

pub struct FeeEstimator {
    providers: Arc<ChainProviders>,
    chains: Arc<ChainRegistry>,
    config: FeeConfig,
}

impl FeeEstimator {
    pub fn new(providers: Arc<ChainProviders>, chains: Arc<ChainRegistry>, config: FeeConfig) -> Self {
        Self {
            providers,
            chains,
            config,
        }
    }

    /// legacy gasPrice 估算
    pub async fn estimate_legacy_gas_price(&self, chain_id: u64) -> EngineResult<U256> {
        let rpc = self.providers.get(chain_id)?;

        let history = rpc
            .fee_history(
                self.config.history_blocks,
                BlockTag::Latest,
                &[self.config.reward_percentile],
            )
            .await;

        let samples = match history {
            Ok(history) => effective_gas_prices(&history),
            Err(e) => {
                tracing::debug!(chain_id, error = %e, "eth_feeHistory unavailable, using gas oracle");
                Vec::new()
            }
        };

        match median(samples) {
            Some(price) => {
                tracing::debug!(chain_id, gas_price = %price, "legacy gas price from fee history");
                Ok(price)
            }
            None => {
                let price = rpc.gas_price().await?;
                tracing::debug!(chain_id, gas_price = %price, "legacy gas price from eth_gasPrice");
                Ok(price)
            }
        }
    }

    /// EIP-1559 费用估算（Normal 档）
    pub async fn estimate_eip1559_fees(&self, chain_id: u64) -> EngineResult<Eip1559Fees> {
        self.estimate_eip1559_fees_for(chain_id, GasSpeed::Normal).await
    }

    pub async fn estimate_eip1559_fees_for(
        &self,
        chain_id: u64,
        speed: GasSpeed,
    ) -> EngineResult<Eip1559Fees> {
        let chain = self.chains.require(chain_id)?;
        if !chain.supports_eip1559 {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} does not support EIP-1559 transactions",
                chain.name
            )));
        }
        let rpc = self.providers.get(chain_id)?;

        // baseFee 必须来自本次读取的 latest 区块头
        let block = rpc.get_block(BlockTag::Latest).await?;
        let base_fee = block.base_fee_per_gas.ok_or_else(|| {
            EngineError::UnsupportedOperation(format!(
                "block {} on chain {} has no baseFeePerGas",
                block.number, chain_id
            ))
        })?;

        let priority = match rpc
            .fee_history(
                self.config.history_blocks,
                BlockTag::Latest,
                &[self.config.reward_percentile],
            )
            .await
        {
            Ok(history) => priority_fee_ema(&history, self.config.priority_fee_ema_alpha),
            Err(e) => {
                tracing::warn!(chain_id, error = %e, "eth_feeHistory failed, using fallback priority fee");
                None
            }
        }
        .unwrap_or_else(|| U256::from(self.config.fallback_priority_fee_wei));

        let max_priority_fee_per_gas = priority * U256::from(speed.priority_percent()) / U256::from(100u64);
        let max_fee_per_gas =
            base_fee * U256::from(self.config.base_fee_multiplier) + max_priority_fee_per_gas;

        tracing::debug!(
            chain_id,
            block = block.number,
            base_fee = %base_fee,
            max_priority_fee_per_gas = %max_priority_fee_per_gas,
            max_fee_per_gas = %max_fee_per_gas,
            speed = ?speed,
            "EIP-1559 fees estimated"
        );

        Ok(Eip1559Fees {
            base_fee,
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    /// 按链能力给出费用字段：支持 EIP-1559 的链用 type-2，否则 legacy
    pub async fn suggest_pricing(&self, chain_id: u64, speed: GasSpeed) -> EngineResult<GasPricing> {
        let chain = self.chains.require(chain_id)?;
        if chain.supports_eip1559 {
            Ok(self.estimate_eip1559_fees_for(chain_id, speed).await?.into_pricing())
        } else {
            let price = self.estimate_legacy_gas_price(chain_id).await?;
            Ok(GasPricing::Legacy {
                gas_price: price * U256::from(speed.priority_percent()) / U256::from(100u64),
            })
        }
    }

    /// eth_estimateGas；revert 时返回解码后的原因
    pub async fn estimate_gas_limit(
        &self,
        chain_id: u64,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> EngineResult<u64> {
        let rpc = self.providers.get(chain_id)?;
        let request = CallRequest::from_transaction(from, tx);

        match rpc.estimate_gas(&request).await {
            Ok(gas) => Ok(gas.max(MIN_TRANSFER_GAS)),
            // 部分节点的 estimateGas 不带 revert 数据，用 eth_call 重放取原因
            Err(EngineError::SimulationReverted(reason)) if reason == "execution reverted" => {
                match rpc.call(&request, BlockTag::Latest).await {
                    Err(e @ EngineError::SimulationReverted(_)) => Err(e),
                    _ => Err(EngineError::SimulationReverted(reason)),
                }
            }
            Err(e) => {
                if let EngineError::SimulationReverted(reason) = &e {
                    tracing::info!(chain_id, from = %from, reason = %reason, "gas estimation reverted");
                }
                Err(e)
            }
        }
    }
}

/// 每个区块的有效价格 baseFee + reward，跳过没有交易的区块
fn effective_gas_prices(history: &FeeHistory) -> Vec<U256> {
    history
        .reward
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let reward = *row.first()?;
            if reward.is_zero() {
                return None;
            }
            let base = history.base_fee_per_gas.get(i).copied().unwrap_or_default();
            Some(base.saturating_add(reward))
        })
        .collect()
}

fn median(mut values: Vec<U256>) -> Option<U256> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / U256::from(2u64))
    }
}

/// 从最旧到最新区块的奖励做指数移动平均
fn priority_fee_ema(history: &FeeHistory, alpha: f64) -> Option<U256> {
    let mut ema: Option<f64> = None;
    for row in &history.reward {
        let Some(reward) = row.first() else {
            continue;
        };
        if reward.is_zero() {
            continue;
        }
        let sample = u256_to_f64(reward);
        ema = Some(match ema {
            None => sample,
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        });
    }
    ema.map(|v| U256::from(v.round() as u128))
}

fn u256_to_f64(value: &U256) -> f64 {
    if value.bits() <= 128 {
        value.as_u128() as f64
    } else {
        u128::MAX as f64
    }
}

//! Nonce 管理器
//! 每个 (address, chain) 一把异步互斥锁，串行化 nonce 分配

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

use crate::config::NonceConfig;
use crate::domain::account::Address;
use crate::error::EngineResult;
use crate::infrastructure::rpc_client::{BlockTag, ChainProviders};

/// Nonce 记录
#[derive(Debug, Default)]
struct NonceRecord {
    /// 下一个从未分配过的 nonce
    next_nonce: u64,
    /// 已分配但尚未确认 / 释放的 nonce
    pending_nonces: BTreeSet<u64>,
    /// 已分配但最终没有广播的 nonce，优先复用以免留下空洞
    released_nonces: BTreeSet<u64>,
    /// None 表示需要从链上同步
    last_synced: Option<Instant>,
}

impl NonceRecord {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.last_synced
            .map(|at| at.elapsed() >= ttl)
            .unwrap_or(true)
    }

    /// 与链上 pending nonce 对齐：永远不分配低于链上的 nonce
    fn reconcile(&mut self, chain_nonce: u64) {
        let stale: Vec<u64> = self
            .pending_nonces
            .iter()
            .copied()
            .filter(|&n| n < chain_nonce)
            .collect();
        if !stale.is_empty() {
            tracing::debug!(chain_nonce, stale = ?stale, "pending nonces already mined");
        }
        self.pending_nonces.retain(|&n| n >= chain_nonce);
        self.released_nonces.retain(|&n| n >= chain_nonce);

        self.next_nonce = if self.pending_nonces.is_empty() && self.released_nonces.is_empty() {
            chain_nonce
        } else {
            self.next_nonce.max(chain_nonce)
        };
        // next_nonce 以上的释放记录没有意义
        let next = self.next_nonce;
        self.released_nonces.retain(|&n| n < next);
        self.last_synced = Some(Instant::now());
    }
}

type NonceKey = (Address, u64);

pub struct NonceManager {
    providers: Arc<ChainProviders>,
    ttl: Duration,
    records: Mutex<HashMap<NonceKey, Arc<Mutex<NonceRecord>>>>,
}

impl NonceManager {
    pub fn new(providers: Arc<ChainProviders>, config: &NonceConfig) -> Self {
        Self {
            providers,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            records: Mutex::new(HashMap::new()),
        }
    }

    async fn record(&self, address: Address, chain_id: u64) -> Arc<Mutex<NonceRecord>> {
        let mut records = self.records.lock().await;
        records
            .entry((address, chain_id))
            .or_insert_with(|| Arc::new(Mutex::new(NonceRecord::default())))
            .clone()
    }

    /// 分配下一个 nonce
    ///
    /// 整个过程（含链上同步）持有该地址的锁，同一 (address, chain) 的并发调用严格串行
    pub async fn allocate(&self, address: Address, chain_id: u64) -> EngineResult<u64> {
        let record = self.record(address, chain_id).await;
        let mut record = record.lock().await;

        if record.is_stale(self.ttl) {
            let rpc = self.providers.get(chain_id)?;
            let chain_nonce = rpc.get_transaction_count(address, BlockTag::Pending).await?;
            record.reconcile(chain_nonce);
            tracing::debug!(
                chain_id,
                address = %address,
                chain_nonce,
                next_nonce = record.next_nonce,
                "nonce synced from chain"
            );
        }

        let nonce = match record.released_nonces.pop_first() {
            Some(reused) => reused,
            None => {
                let n = record.next_nonce;
                record.next_nonce += 1;
                n
            }
        };
        record.pending_nonces.insert(nonce);

        tracing::debug!(chain_id, address = %address, nonce, "nonce allocated");
        Ok(nonce)
    }

    /// 交易最终没有广播（签名失败 / 节点拒绝 / 用户放弃），归还 nonce
    pub async fn release(&self, address: Address, chain_id: u64, nonce: u64) {
        let record = self.record(address, chain_id).await;
        let mut record = record.lock().await;
        if record.pending_nonces.remove(&nonce) {
            record.released_nonces.insert(nonce);
            tracing::debug!(chain_id, address = %address, nonce, "nonce released");
        }
    }

    /// 交易已上链（或被同 nonce 交易取代），不再占用
    pub async fn mark_confirmed(&self, address: Address, chain_id: u64, nonce: u64) {
        let record = self.record(address, chain_id).await;
        let mut record = record.lock().await;
        record.pending_nonces.retain(|&n| n > nonce);
        record.released_nonces.retain(|&n| n > nonce);
        if record.next_nonce <= nonce {
            record.next_nonce = nonce + 1;
        }
    }

    /// 下次分配前强制从链上同步
    pub async fn resync(&self, address: Address, chain_id: u64) {
        let record = self.record(address, chain_id).await;
        record.lock().await.last_synced = None;
    }

    /// 已分配未确认的 nonce
    pub async fn pending(&self, address: Address, chain_id: u64) -> Vec<u64> {
        let record = self.record(address, chain_id).await;
        let record = record.lock().await;
        record.pending_nonces.iter().copied().collect()
    }
}

//! EVM JSON-RPC 客户端
//!
//! 只读调用（nonce / 费用 / 模拟 / 回执）按退避重试；
//! eth_sendRawTransaction 绝不自动重试，节点拒绝原样上抛

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::U256;
use serde_json::{json, Value};

use crate::config::RpcConfig;
use crate::domain::account::Address;
use crate::domain::chain_config::ChainRegistry;
use crate::domain::transaction::{AccessListItem, GasPricing, UnsignedTransaction};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::retry::{retry_with_backoff, RetryPolicy};
use crate::infrastructure::rpc_validator::{
    validate_data, validate_rpc_response, validate_tx_hash, validate_u256, validate_u64,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl BlockTag {
    pub fn to_param(&self) -> Value {
        match self {
            Self::Latest => json!("latest"),
            Self::Pending => json!("pending"),
            Self::Number(n) => json!(format!("{:#x}", n)),
        }
    }
}

/// eth_call / eth_estimateGas 的调用参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas: Option<u64>,
    pub fees: Option<GasPricing>,
    pub access_list: Vec<AccessListItem>,
}

impl CallRequest {
    pub fn from_transaction(from: Address, tx: &UnsignedTransaction) -> Self {
        Self {
            from: Some(from),
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            gas: None,
            fees: Some(tx.fees),
            access_list: tx.access_list.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Some(from) = &self.from {
            obj.insert("from".into(), json!(from.to_checksum()));
        }
        if let Some(to) = &self.to {
            obj.insert("to".into(), json!(to.to_checksum()));
        }
        obj.insert("value".into(), json!(format!("{:#x}", self.value)));
        obj.insert("data".into(), json!(format!("0x{}", hex::encode(&self.data))));
        if let Some(gas) = self.gas {
            obj.insert("gas".into(), json!(format!("{:#x}", gas)));
        }
        match &self.fees {
            Some(GasPricing::Legacy { gas_price }) => {
                obj.insert("gasPrice".into(), json!(format!("{:#x}", gas_price)));
            }
            Some(GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }) => {
                obj.insert("maxFeePerGas".into(), json!(format!("{:#x}", max_fee_per_gas)));
                obj.insert(
                    "maxPriorityFeePerGas".into(),
                    json!(format!("{:#x}", max_priority_fee_per_gas)),
                );
            }
            None => {}
        }
        if !self.access_list.is_empty() {
            if let Ok(list) = serde_json::to_value(&self.access_list) {
                obj.insert("accessList".into(), list);
            }
        }
        Value::Object(obj)
    }
}

/// eth_feeHistory 结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeHistory {
    pub oldest_block: u64,
    /// 长度为 block_count + 1，最后一项是下一个区块的预测值
    pub base_fee_per_gas: Vec<U256>,
    pub gas_used_ratio: Vec<f64>,
    /// 每个区块一行，每行对应请求的百分位
    pub reward: Vec<Vec<U256>>,
}

/// 区块头中费用估算关心的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// London 之前的区块或不支持 EIP-1559 的链为 None
    pub base_fee_per_gas: Option<U256>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: [u8; 32],
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: Option<U256>,
    /// 1 = 成功, 0 = revert
    pub status: u8,
}

/// 节点访问接口，服务层只依赖此 trait
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> EngineResult<u64>;

    /// 失败时返回 SimulationReverted(解码后的原因)
    async fn estimate_gas(&self, request: &CallRequest) -> EngineResult<u64>;

    async fn call(&self, request: &CallRequest, tag: BlockTag) -> EngineResult<Vec<u8>>;

    async fn fee_history(
        &self,
        block_count: u64,
        newest: BlockTag,
        reward_percentiles: &[f64],
    ) -> EngineResult<FeeHistory>;

    async fn gas_price(&self) -> EngineResult<U256>;

    async fn get_block(&self, tag: BlockTag) -> EngineResult<BlockHeader>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> EngineResult<[u8; 32]>;

    async fn get_transaction_receipt(
        &self,
        hash: &[u8; 32],
    ) -> EngineResult<Option<TransactionReceipt>>;
}

/// chain_id → 节点客户端
///
/// 启动时按链注册表构建，之后只读共享
#[derive(Clone, Default)]
pub struct ChainProviders {
    clients: HashMap<u64, Arc<dyn RpcClient>>,
}

impl ChainProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chain_id: u64, client: Arc<dyn RpcClient>) {
        self.clients.insert(chain_id, client);
    }

    pub fn with(mut self, chain_id: u64, client: Arc<dyn RpcClient>) -> Self {
        self.register(chain_id, client);
        self
    }

    /// 为注册表中配置了 rpc_url 的链创建 HTTP 客户端
    pub fn from_registry(registry: &ChainRegistry, config: &RpcConfig) -> EngineResult<Self> {
        let mut providers = Self::new();
        for chain in registry.list_all() {
            if let Some(url) = &chain.rpc_url {
                providers.register(chain.chain_id, Arc::new(HttpRpcClient::new(url.clone(), config)?));
            }
        }
        Ok(providers)
    }

    pub fn get(&self, chain_id: u64) -> EngineResult<Arc<dyn RpcClient>> {
        self.clients
            .get(&chain_id)
            .cloned()
            .ok_or(EngineError::ChainNotSupported(chain_id))
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP 实现
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpRpcClient {
    http_client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: &RpcConfig) -> EngineResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: url.into(),
            retry: RetryPolicy::from_config(config),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request_once(&self, method: &str, params: &Value) -> EngineResult<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = format!("{} returned HTTP {}: {}", method, status, body);
            // 5xx / 429 视为瞬时故障
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(EngineError::Network(message))
            } else {
                Err(EngineError::Rpc(message))
            };
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| EngineError::Rpc(format!("{} returned invalid JSON: {}", method, e)))?;
        validate_rpc_response(json)
    }

    /// 只读调用：瞬时错误按退避重试
    async fn read(&self, method: &str, params: Value) -> EngineResult<Value> {
        retry_with_backoff(&self.retry, method, || self.request_once(method, &params)).await
    }

    /// 写调用：只发一次
    async fn write(&self, method: &str, params: Value) -> EngineResult<Value> {
        self.request_once(method, &params).await
    }
}

fn as_str<'a>(value: &'a Value, field: &str) -> EngineResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| EngineError::Rpc(format!("{} is not a string: {}", field, value)))
}

fn field<'a>(obj: &'a Value, name: &str) -> EngineResult<&'a str> {
    obj.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Rpc(format!("missing field {}", name)))
}

fn parse_fee_history(result: &Value) -> EngineResult<FeeHistory> {
    let oldest_block = validate_u64(field(result, "oldestBlock")?, "oldestBlock")?;

    let base_fee_per_gas = result
        .get("baseFeePerGas")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|v| validate_u256(as_str(v, "baseFeePerGas")?, "baseFeePerGas"))
                .collect::<EngineResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    let gas_used_ratio = result
        .get("gasUsedRatio")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default();

    let reward = result
        .get("reward")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| {
                            cells
                                .iter()
                                .map(|c| validate_u256(as_str(c, "reward")?, "reward"))
                                .collect::<EngineResult<Vec<_>>>()
                        })
                        .unwrap_or_else(|| Ok(Vec::new()))
                })
                .collect::<EngineResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(FeeHistory {
        oldest_block,
        base_fee_per_gas,
        gas_used_ratio,
        reward,
    })
}

fn parse_receipt(result: &Value) -> EngineResult<TransactionReceipt> {
    Ok(TransactionReceipt {
        transaction_hash: validate_tx_hash(field(result, "transactionHash")?)?,
        block_number: validate_u64(field(result, "blockNumber")?, "blockNumber")?,
        gas_used: validate_u64(field(result, "gasUsed")?, "gasUsed")?,
        effective_gas_price: result
            .get("effectiveGasPrice")
            .and_then(|v| v.as_str())
            .map(|s| validate_u256(s, "effectiveGasPrice"))
            .transpose()?,
        // 拜占庭之前的回执没有 status，按成功处理
        status: result
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| validate_u64(s, "status"))
            .transpose()?
            .map(|s| s as u8)
            .unwrap_or(1),
    })
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> EngineResult<u64> {
        let result = self
            .read(
                "eth_getTransactionCount",
                json!([address.to_checksum(), tag.to_param()]),
            )
            .await?;
        validate_u64(as_str(&result, "nonce")?, "nonce")
    }

    async fn estimate_gas(&self, request: &CallRequest) -> EngineResult<u64> {
        let result = self.read("eth_estimateGas", json!([request.to_json()])).await?;
        validate_u64(as_str(&result, "gas")?, "gas")
    }

    async fn call(&self, request: &CallRequest, tag: BlockTag) -> EngineResult<Vec<u8>> {
        let result = self
            .read("eth_call", json!([request.to_json(), tag.to_param()]))
            .await?;
        validate_data(as_str(&result, "call result")?, "call result")
    }

    async fn fee_history(
        &self,
        block_count: u64,
        newest: BlockTag,
        reward_percentiles: &[f64],
    ) -> EngineResult<FeeHistory> {
        let result = self
            .read(
                "eth_feeHistory",
                json!([format!("{:#x}", block_count), newest.to_param(), reward_percentiles]),
            )
            .await?;
        parse_fee_history(&result)
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        let result = self.read("eth_gasPrice", json!([])).await?;
        validate_u256(as_str(&result, "gasPrice")?, "gasPrice")
    }

    async fn get_block(&self, tag: BlockTag) -> EngineResult<BlockHeader> {
        let result = self
            .read("eth_getBlockByNumber", json!([tag.to_param(), false]))
            .await?;
        if result.is_null() {
            return Err(EngineError::Rpc(format!("block {:?} not found", tag)));
        }
        Ok(BlockHeader {
            number: validate_u64(field(&result, "number")?, "number")?,
            base_fee_per_gas: result
                .get("baseFeePerGas")
                .and_then(|v| v.as_str())
                .map(|s| validate_u256(s, "baseFeePerGas"))
                .transpose()?,
            timestamp: validate_u64(field(&result, "timestamp")?, "timestamp")?,
        })
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> EngineResult<[u8; 32]> {
        let result = self
            .write(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        validate_tx_hash(as_str(&result, "transaction hash")?)
    }

    async fn get_transaction_receipt(
        &self,
        hash: &[u8; 32],
    ) -> EngineResult<Option<TransactionReceipt>> {
        let result = self
            .read(
                "eth_getTransactionReceipt",
                json!([format!("0x{}", hex::encode(hash))]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_receipt(&result).map(Some)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 单元测试用的脚本化节点
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use super::*;
    use crate::domain::account::keccak256;

    #[derive(Default)]
    pub(crate) struct MockRpc {
        pub nonces: Mutex<HashMap<Address, u64>>,
        pub base_fee: Mutex<U256>,
        pub gas_price: Mutex<U256>,
        pub priority_rewards: Mutex<Vec<U256>>,
        pub estimate: Mutex<Option<Result<u64, String>>>,
        pub send_error: Mutex<Option<String>>,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub receipts: Mutex<HashMap<[u8; 32], TransactionReceipt>>,
        pub block_calls: AtomicU64,
        pub nonce_calls: AtomicU64,
        /// 查询 nonce 时顺带"出块"：写入该回执，模拟两次查询之间交易上链
        pub mine_on_nonce_query: Mutex<Option<([u8; 32], u8)>>,
    }

    impl MockRpc {
        pub(crate) fn set_nonce(&self, address: Address, nonce: u64) {
            self.nonces.lock().unwrap().insert(address, nonce);
        }

        pub(crate) fn set_receipt(&self, hash: [u8; 32], status: u8) {
            self.receipts.lock().unwrap().insert(
                hash,
                TransactionReceipt {
                    transaction_hash: hash,
                    block_number: 100,
                    gas_used: 21_000,
                    effective_gas_price: None,
                    status,
                },
            );
        }
    }

    #[async_trait]
    impl RpcClient for MockRpc {
        async fn get_transaction_count(&self, address: Address, _tag: BlockTag) -> EngineResult<u64> {
            self.nonce_calls.fetch_add(1, Ordering::SeqCst);
            if let Some((hash, status)) = self.mine_on_nonce_query.lock().unwrap().take() {
                self.set_receipt(hash, status);
            }
            Ok(*self.nonces.lock().unwrap().get(&address).unwrap_or(&0))
        }

        async fn estimate_gas(&self, _request: &CallRequest) -> EngineResult<u64> {
            match self.estimate.lock().unwrap().clone() {
                Some(Ok(gas)) => Ok(gas),
                Some(Err(reason)) => Err(EngineError::SimulationReverted(reason)),
                None => Ok(21_000),
            }
        }

        async fn call(&self, _request: &CallRequest, _tag: BlockTag) -> EngineResult<Vec<u8>> {
            Ok(Vec::new())
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
                oldest_block: 1,
                base_fee_per_gas: vec![base; block_count as usize + 1],
                gas_used_ratio: vec![0.5; block_count as usize],
                reward: rewards.into_iter().map(|r| vec![r]).collect(),
            })
        }

        async fn gas_price(&self) -> EngineResult<U256> {
            Ok(*self.gas_price.lock().unwrap())
        }

        async fn get_block(&self, _tag: BlockTag) -> EngineResult<BlockHeader> {
            let n = self.block_calls.fetch_add(1, Ordering::SeqCst);
            Ok(BlockHeader {
                number: 100 + n,
                base_fee_per_gas: Some(*self.base_fee.lock().unwrap()),
                timestamp: 1_700_000_000,
            })
        }

        async fn send_raw_transaction(&self, raw: &[u8]) -> EngineResult<[u8; 32]> {
            if let Some(message) = self.send_error.lock().unwrap().clone() {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_tag_params() {
        assert_eq!(BlockTag::Latest.to_param(), json!("latest"));
        assert_eq!(BlockTag::Pending.to_param(), json!("pending"));
        assert_eq!(BlockTag::Number(255).to_param(), json!("0xff"));
    }

    #[test]
    fn test_call_request_json() {
        let req = CallRequest {
            from: Some(Address::from_bytes([0x11; 20])),
            to: Some(Address::from_bytes([0x22; 20])),
            value: U256::from(1_000u64),
            data: vec![0xa9, 0x05, 0x9c, 0xbb],
            gas: Some(60_000),
            fees: Some(GasPricing::Legacy {
                gas_price: U256::from(20_000_000_000u64),
            }),
            access_list: Vec::new(),
        };
        let v = req.to_json();
        assert_eq!(v["value"], json!("0x3e8"));
        assert_eq!(v["data"], json!("0xa9059cbb"));
        assert_eq!(v["gas"], json!("0xea60"));
        assert_eq!(v["gasPrice"], json!("0x4a817c800"));
        assert!(v.get("maxFeePerGas").is_none());
    }

    #[test]
    fn test_parse_fee_history() {
        let result = json!({
            "oldestBlock": "0x10",
            "baseFeePerGas": ["0x3b9aca00", "0x3b9aca00", "0x4190ab00"],
            "gasUsedRatio": [0.5, 0.9],
            "reward": [["0x59682f00"], ["0x77359400"]]
        });
        let history = parse_fee_history(&result).unwrap();
        assert_eq!(history.oldest_block, 16);
        assert_eq!(history.base_fee_per_gas.len(), 3);
        assert_eq!(history.reward[1][0], U256::from(2_000_000_000u64));
    }

    #[test]
    fn test_parse_receipt() {
        let result = json!({
            "transactionHash": "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef",
            "blockNumber": "0x64",
            "gasUsed": "0x5208",
            "status": "0x0"
        });
        let receipt = parse_receipt(&result).unwrap();
        assert_eq!(receipt.block_number, 100);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.status, 0);
        assert!(receipt.effective_gas_price.is_none());
    }

    #[test]
    fn test_chain_providers_lookup() {
        let providers = ChainProviders::new().with(1, Arc::new(mock::MockRpc::default()));
        assert!(providers.get(1).is_ok());
        assert!(matches!(providers.get(56), Err(EngineError::ChainNotSupported(56))));
        assert_eq!(providers.chain_ids(), vec![1]);

        let from_registry =
            ChainProviders::from_registry(&ChainRegistry::new(), &RpcConfig::default()).unwrap();
        assert!(from_registry.get(1).is_ok());
    }

    #[test]
    fn test_client_builds_from_config() {
        let client = HttpRpcClient::new("http://127.0.0.1:8545", &RpcConfig::default()).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:8545");
    }
}

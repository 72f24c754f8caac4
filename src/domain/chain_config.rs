//! EVM 链配置模块
//!
//! 定义所有支持的 EVM 链及其派生路径 / EIP-1559 能力

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::derivation_path::DerivationPath;
use crate::error::{EngineError, EngineResult};

/// 链配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// EIP-155 链 ID
    pub chain_id: u64,
    /// 链名称
    pub name: String,
    /// 原生币符号 (ETH, BNB, POL, etc.)
    pub symbol: String,
    /// BIP44 coin type（EVM 链统一为 60）
    #[serde(default = "default_coin_type")]
    pub coin_type: u32,
    /// 默认派生路径模板，`{index}` 为地址索引占位符
    #[serde(default = "default_path_template")]
    pub derivation_path_template: String,
    /// 是否为测试网
    #[serde(default)]
    pub is_testnet: bool,
    /// 是否支持 type-2 (EIP-1559) 交易
    #[serde(default = "default_true")]
    pub supports_eip1559: bool,
    /// RPC 端点 (可选)
    #[serde(default)]
    pub rpc_url: Option<String>,
}

fn default_coin_type() -> u32 {
    60
}

fn default_path_template() -> String {
    "m/44'/60'/0'/0/{index}".to_string()
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    /// 生成第 `index` 个账户的派生路径
    pub fn derivation_path(&self, index: u32) -> EngineResult<DerivationPath> {
        let path = self
            .derivation_path_template
            .replace("{index}", &index.to_string());
        path.parse()
    }
}

/// 链配置注册表
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    configs: HashMap<u64, ChainConfig>,
    symbol_map: HashMap<String, u64>,
}

impl ChainRegistry {
    /// 创建预配置的注册表
    pub fn new() -> Self {
        let mut registry = Self {
            configs: HashMap::new(),
            symbol_map: HashMap::new(),
        };

        registry.register_default_chains();
        registry
    }

    /// 注册默认支持的链
    fn register_default_chains(&mut self) {
        let defaults: [(u64, &str, &str, bool, bool, &str, &str); 7] = [
            (1, "Ethereum", "ETH", false, true, "ETH_RPC_URL", "https://eth.llamarpc.com"),
            (
                11155111,
                "Ethereum Sepolia",
                "SEPOLIA",
                true,
                true,
                "SEPOLIA_RPC_URL",
                "https://rpc.sepolia.org",
            ),
            // BSC 的 EIP-1559 仅形式支持，默认走 legacy gasPrice
            (
                56,
                "BNB Smart Chain",
                "BNB",
                false,
                false,
                "BSC_RPC_URL",
                "https://bsc-dataseed.binance.org",
            ),
            (137, "Polygon", "POL", false, true, "POLYGON_RPC_URL", "https://polygon-rpc.com"),
            (
                42161,
                "Arbitrum One",
                "ARB",
                false,
                true,
                "ARBITRUM_RPC_URL",
                "https://arb1.arbitrum.io/rpc",
            ),
            (
                10,
                "Optimism",
                "OP",
                false,
                true,
                "OPTIMISM_RPC_URL",
                "https://mainnet.optimism.io",
            ),
            (8453, "Base", "BASE", false, true, "BASE_RPC_URL", "https://mainnet.base.org"),
        ];

        for (chain_id, name, symbol, is_testnet, supports_eip1559, env_key, fallback) in defaults
        {
            self.register(ChainConfig {
                chain_id,
                name: name.to_string(),
                symbol: symbol.to_string(),
                coin_type: 60,
                derivation_path_template: default_path_template(),
                is_testnet,
                supports_eip1559,
                rpc_url: Some(std::env::var(env_key).unwrap_or_else(|_| fallback.to_string())),
            });
        }
    }

    /// 注册链配置（同 chain_id 覆盖）
    pub fn register(&mut self, config: ChainConfig) {
        let chain_id = config.chain_id;
        let symbol = config.symbol.to_lowercase();

        self.symbol_map.insert(symbol, chain_id);
        self.configs.insert(chain_id, config);
    }

    /// 内置链 + 配置文件中的链
    pub fn with_overrides(chains: &[ChainConfig]) -> Self {
        let mut registry = Self::new();
        for chain in chains {
            registry.register(chain.clone());
        }
        registry
    }

    /// 通过 chain_id 获取配置
    pub fn get_by_chain_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.configs.get(&chain_id)
    }

    /// 通过 chain_id 获取配置，不存在时报错
    pub fn require(&self, chain_id: u64) -> EngineResult<&ChainConfig> {
        self.get_by_chain_id(chain_id)
            .ok_or(EngineError::ChainNotSupported(chain_id))
    }

    /// 通过符号获取配置
    pub fn get_by_symbol(&self, symbol: &str) -> Option<&ChainConfig> {
        let chain_id = self.symbol_map.get(&symbol.to_lowercase())?;
        self.configs.get(chain_id)
    }

    /// 列出所有支持的链（按 chain_id 排序）
    pub fn list_all(&self) -> Vec<&ChainConfig> {
        let mut chains: Vec<_> = self.configs.values().collect();
        chains.sort_by_key(|c| c.chain_id);
        chains
    }

    /// 验证链配置完整性
    pub fn validate_configs(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (chain_id, config) in &self.configs {
            if *chain_id == 0 {
                errors.push(format!("Chain {} has invalid chain_id: 0", config.name));
            }
            if config.name.is_empty() {
                errors.push(format!("Chain {} has empty name", chain_id));
            }
            if config.symbol.is_empty() {
                errors.push(format!("Chain {} has empty symbol", chain_id));
            }
            if config.coin_type != 60 {
                errors.push(format!(
                    "Chain {} uses coin_type {} (EVM chains share 60)",
                    config.name, config.coin_type
                ));
            }
            if let Err(e) = config.derivation_path(0) {
                errors.push(format!(
                    "Chain {} has invalid derivation_path_template: {}",
                    config.name, e
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_registry() {
        let registry = ChainRegistry::new();

        let eth = registry.get_by_chain_id(1).unwrap();
        assert_eq!(eth.name, "Ethereum");
        assert!(eth.supports_eip1559);

        let bsc = registry.get_by_symbol("bnb").unwrap();
        assert_eq!(bsc.chain_id, 56);
        assert!(!bsc.supports_eip1559);

        let path = eth.derivation_path(7).unwrap();
        assert_eq!(path.to_string(), "m/44'/60'/0'/0/7");

        assert!(registry.validate_configs().is_ok());
        assert!(matches!(
            registry.require(999_999),
            Err(EngineError::ChainNotSupported(999_999))
        ));
    }

    #[test]
    fn test_registry_overrides() {
        let anvil = ChainConfig {
            chain_id: 31337,
            name: "Anvil".into(),
            symbol: "ANVIL".into(),
            coin_type: 60,
            derivation_path_template: default_path_template(),
            is_testnet: true,
            supports_eip1559: true,
            rpc_url: Some("http://127.0.0.1:8545".into()),
        };
        let registry = ChainRegistry::with_overrides(&[anvil]);
        assert_eq!(registry.list_all().len(), 8);
        assert_eq!(registry.get_by_symbol("anvil").unwrap().chain_id, 31337);
    }
}

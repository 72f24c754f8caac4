//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::chain_config::ChainConfig;

/// 引擎配置结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    /// 额外注册的链（覆盖或补充内置链表）
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

/// JSON-RPC 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// 单次请求超时
    pub timeout_secs: u64,
    /// 只读调用最大重试次数
    pub max_retries: u32,
    /// 首次退避时长
    pub backoff_ms: u64,
    /// 退避上限
    pub max_backoff_ms: u64,
}

/// 费用估算配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// eth_feeHistory 回看的区块数
    pub history_blocks: u64,
    /// priority fee 取样百分位
    pub reward_percentile: f64,
    /// maxFee = base * multiplier + priority
    pub base_fee_multiplier: u64,
    /// EMA 平滑系数
    pub priority_fee_ema_alpha: f64,
    /// 节点无数据时使用的 priority fee（wei）
    pub fallback_priority_fee_wei: u64,
    /// 加速 / 取消交易默认提价百分比
    pub replacement_bump_percent: u64,
}

/// 交易监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// 无回执超过该时长且 nonce 已前进即判定 Dropped
    pub drop_timeout_secs: u64,
}

/// Keystore / 会话加密配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// 会话 blob 的 PBKDF2 迭代次数
    pub session_pbkdf2_rounds: u32,
    /// 导出 V3 keystore 时的 scrypt log2(N)
    pub scrypt_log_n: u8,
    /// 持久化文件路径（为空时使用内存存储）
    pub blob_path: Option<String>,
}

/// Nonce 管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// 本地缓存有效期，过期后从链上重新同步
    pub cache_ttl_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: env_or("RPC_TIMEOUT_SECS", 10),
            max_retries: env_or("RPC_MAX_RETRIES", 3),
            backoff_ms: env_or("RPC_BACKOFF_MS", 500),
            max_backoff_ms: env_or("RPC_MAX_BACKOFF_MS", 8_000),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            history_blocks: env_or("FEE_HISTORY_BLOCKS", 10),
            reward_percentile: env_or("FEE_REWARD_PERCENTILE", 50.0),
            base_fee_multiplier: env_or("FEE_BASE_MULTIPLIER", 2),
            priority_fee_ema_alpha: env_or("FEE_PRIORITY_EMA_ALPHA", 0.3),
            fallback_priority_fee_wei: env_or("FEE_FALLBACK_PRIORITY_WEI", 1_500_000_000),
            replacement_bump_percent: env_or("FEE_REPLACEMENT_BUMP_PERCENT", 10),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: env_or("WATCHER_POLL_INTERVAL_MS", 2_000),
            max_poll_interval_ms: env_or("WATCHER_MAX_POLL_INTERVAL_MS", 30_000),
            backoff_multiplier: env_or("WATCHER_BACKOFF_MULTIPLIER", 1.5),
            drop_timeout_secs: env_or("WATCHER_DROP_TIMEOUT_SECS", 600),
        }
    }
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            session_pbkdf2_rounds: env_or("KEYSTORE_PBKDF2_ROUNDS", 100_000),
            scrypt_log_n: env_or("KEYSTORE_SCRYPT_LOG_N", 18),
            blob_path: std::env::var("KEYSTORE_BLOB_PATH").ok(),
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: env_or("NONCE_CACHE_TTL_SECS", 300),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self::default())
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    ///
    /// 文件中缺省的段落由 `#[serde(default)]` 回落到环境变量
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if self.rpc.timeout_secs == 0 {
            anyhow::bail!("RPC_TIMEOUT_SECS must be greater than 0");
        }

        if self.rpc.backoff_ms > self.rpc.max_backoff_ms {
            anyhow::bail!("RPC_BACKOFF_MS must not exceed RPC_MAX_BACKOFF_MS");
        }

        if self.fees.history_blocks == 0 || self.fees.history_blocks > 1024 {
            anyhow::bail!("FEE_HISTORY_BLOCKS must be within 1..=1024");
        }

        if !(0.0..=100.0).contains(&self.fees.reward_percentile) {
            anyhow::bail!("FEE_REWARD_PERCENTILE must be within 0..=100");
        }

        if self.fees.base_fee_multiplier == 0 {
            anyhow::bail!("FEE_BASE_MULTIPLIER must be at least 1");
        }

        if !(self.fees.priority_fee_ema_alpha > 0.0 && self.fees.priority_fee_ema_alpha <= 1.0) {
            anyhow::bail!("FEE_PRIORITY_EMA_ALPHA must be within (0, 1]");
        }

        if self.watcher.poll_interval_ms == 0
            || self.watcher.poll_interval_ms > self.watcher.max_poll_interval_ms
        {
            anyhow::bail!("WATCHER_POLL_INTERVAL_MS must be within 1..=WATCHER_MAX_POLL_INTERVAL_MS");
        }

        if self.watcher.backoff_multiplier < 1.0 {
            anyhow::bail!("WATCHER_BACKOFF_MULTIPLIER must be >= 1.0");
        }

        if self.keystore.session_pbkdf2_rounds < 10_000 {
            anyhow::bail!("KEYSTORE_PBKDF2_ROUNDS must be at least 10000");
        }

        if self.keystore.scrypt_log_n == 0 || self.keystore.scrypt_log_n > 24 {
            anyhow::bail!("KEYSTORE_SCRYPT_LOG_N must be within 1..=24");
        }

        for chain in &self.chains {
            if chain.chain_id == 0 {
                anyhow::bail!("chain '{}' has chain_id 0", chain.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_config_from_env() {
        let config = Config::from_env().unwrap();
        assert!(config.rpc.timeout_secs > 0);
        assert!(config.fees.base_fee_multiplier >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"
format = "json"

[rpc]
timeout_secs = 5
max_retries = 2
backoff_ms = 100
max_backoff_ms = 1000

[fees]
history_blocks = 20
reward_percentile = 60.0
base_fee_multiplier = 2
priority_fee_ema_alpha = 0.5
fallback_priority_fee_wei = 1000000000
replacement_bump_percent = 12

[[chains]]
chain_id = 31337
name = "Anvil"
symbol = "ANVIL"
coin_type = 60
derivation_path_template = "m/44'/60'/0'/0/{{index}}"
is_testnet = true
supports_eip1559 = true
rpc_url = "http://127.0.0.1:8545"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.rpc.max_retries, 2);
        assert_eq!(config.fees.history_blocks, 20);
        assert_eq!(config.fees.replacement_bump_percent, 12);
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].chain_id, 31337);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::from_env().unwrap();
        assert!(config.validate().is_ok());

        config.logging.format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = Config::from_env().unwrap();
        config.fees.base_fee_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_env().unwrap();
        config.watcher.poll_interval_ms = config.watcher.max_poll_interval_ms + 1;
        assert!(config.validate().is_err());
    }
}

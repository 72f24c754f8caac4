//! 签名引擎统一错误类型
//!
//! 每个变体对应一个稳定的 snake_case 错误码（`EngineError::code()`），
//! 供上层（UI / RPC 桥接层）映射为用户可读提示。

use thiserror::Error;

/// 签名引擎结果类型
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// 签名引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 密钥派生
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// 助记词校验失败（词表或校验和）
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// 子密钥退化（IL ≥ n 或结果为 0），重试次数耗尽后才会暴露
    #[error("Invalid child key at index {0}")]
    InvalidChildKey(u32),

    /// 派生路径格式错误
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Keyring
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Keyring is locked")]
    KeyringLocked,

    #[error("Keyring not found: {0}")]
    KeyringNotFound(String),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// 例如对 WatchOnly keyring 请求签名
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Unsupported signature scheme: {0}")]
    UnsupportedSignatureScheme(String),

    /// 摘要长度不是 32 字节等
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 交易 / 节点拒绝
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid typed data: {0}")]
    InvalidTypedData(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Transaction underpriced: {0}")]
    Underpriced(String),

    /// 替换交易的费用低于原交易
    #[error("Replacement underpriced: {0}")]
    ReplacementUnderpriced(String),

    /// 模拟执行 revert，携带解码后的原因
    #[error("Simulation reverted: {0}")]
    SimulationReverted(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 外部协作方
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// 硬件设备错误，原样透传
    #[error("Hardware device error: {0}")]
    HardwareDeviceError(String),

    /// 安全聚合器判定 forbidden
    #[error("Signing forbidden by security policy: {0}")]
    SecurityForbidden(String),

    /// danger / warning 需要用户显式确认
    #[error("User acknowledgement required: {0}")]
    AcknowledgementRequired(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 加密 / Keystore
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// Keystore MAC 校验失败（通常是密码错误）
    #[error("MAC mismatch")]
    MacMismatch,

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 基础设施
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Chain not supported: {0}")]
    ChainNotSupported(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// 稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMnemonic(_) => "invalid_mnemonic",
            Self::InvalidChildKey(_) => "invalid_child_key",
            Self::InvalidPath(_) => "invalid_path",
            Self::KeyringLocked => "keyring_locked",
            Self::KeyringNotFound(_) => "keyring_not_found",
            Self::UnknownAddress(_) => "unknown_address",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::UnsupportedSignatureScheme(_) => "unsupported_signature_scheme",
            Self::InvalidDigest(_) => "invalid_digest",
            Self::InvalidAddress(_) => "invalid_address",
            Self::InvalidPrivateKey(_) => "invalid_private_key",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::InvalidTransaction(_) => "invalid_transaction",
            Self::InvalidTypedData(_) => "invalid_typed_data",
            Self::InsufficientFunds(_) => "insufficient_funds",
            Self::NonceTooLow(_) => "nonce_too_low",
            Self::Underpriced(_) => "underpriced",
            Self::ReplacementUnderpriced(_) => "replacement_underpriced",
            Self::SimulationReverted(_) => "simulation_reverted",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::HardwareDeviceError(_) => "hardware_device_error",
            Self::SecurityForbidden(_) => "security_forbidden",
            Self::AcknowledgementRequired(_) => "acknowledgement_required",
            Self::MacMismatch => "mac_mismatch",
            Self::Keystore(_) => "keystore_error",
            Self::Encryption(_) => "encryption_failed",
            Self::Decryption(_) => "decryption_failed",
            Self::Rpc(_) => "rpc_error",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::ChainNotSupported(_) => "chain_not_supported",
            Self::Config(_) => "config_error",
            Self::Persistence(_) => "persistence_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal",
        }
    }

    /// 是否为瞬时网络错误（仅只读调用会据此自动重试）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// 节点拒绝类错误：调用方修正参数后可由用户显式重试
    pub fn is_node_rejection(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds(_)
                | Self::NonceTooLow(_)
                | Self::Underpriced(_)
                | Self::ReplacementUnderpriced(_)
        )
    }

    /// 按节点返回的错误消息归类
    ///
    /// geth / erigon / bsc 的措辞略有不同，这里只匹配稳定的关键字
    pub fn from_node_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("nonce too low") {
            Self::NonceTooLow(message.to_string())
        } else if lower.contains("replacement transaction underpriced") {
            Self::ReplacementUnderpriced(message.to_string())
        } else if lower.contains("underpriced") || lower.contains("fee cap less than block base fee")
        {
            Self::Underpriced(message.to_string())
        } else if lower.contains("insufficient funds") {
            Self::InsufficientFunds(message.to_string())
        } else {
            Self::Rpc(message.to_string())
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else {
            Self::Rpc(err.to_string())
        }
    }
}

impl From<k256::ecdsa::Error> for EngineError {
    fn from(err: k256::ecdsa::Error) -> Self {
        Self::InvalidSignature(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{:#}", err))
    }
}

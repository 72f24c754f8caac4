//! keyring-engine - EVM 密钥管理与交易签名引擎
//!
//! HD 派生、多类型 keyring、EIP-155 / EIP-1559 / EIP-712 签名、
//! 费用估算与交易生命周期（build → sign → broadcast → watch → replace）

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod infrastructure;
pub mod service;

// 重新导出常用类型
pub use engine::{SendOptions, SigningEngine, SubmittedTransaction};
pub use error::{EngineError, EngineResult};

pub mod prelude {
    pub use crate::{
        config::Config,
        domain::{Address, ChainConfig, ChainRegistry, DerivationPath, TransactionStatus},
        engine::{SendOptions, SigningEngine},
        error::{EngineError, EngineResult},
        service::{GasSpeed, TransactionIntent},
    };
}

//! Domain 模块
//!
//! 密钥派生、地址、交易编码、签名与 EIP-712 等纯计算模型，不做 I/O

pub mod account;
pub mod chain_config;
pub mod derivation;
pub mod derivation_path;
pub mod hex_serde;
pub mod revert;
pub mod signature;
pub mod transaction;
pub mod transaction_status;
pub mod typed_data;

// Re-exports
pub use account::{keccak256, Account, Address, KeyringId};
pub use chain_config::{ChainConfig, ChainRegistry};
pub use derivation::ExtendedKey;
pub use derivation_path::{ChildNumber, DerivationPath, PathCompliance};
pub use revert::RevertReason;
pub use signature::RecoverableSignature;
pub use transaction::{
    AccessListItem, GasPricing, SignedTransaction, TxType, UnsignedTransaction,
};
pub use transaction_status::{TrackedTransaction, TransactionStatus};
pub use typed_data::{TypedDataPayload, TypedField};

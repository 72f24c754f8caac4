pub mod broadcaster;
pub mod fee_estimator;
pub mod keyring_store;
pub mod nonce_manager;
pub mod security_aggregator; // 签名前安全闸门
pub mod signer;
pub mod transaction_builder;
pub mod transaction_watcher;

pub use broadcaster::Broadcaster;
pub use fee_estimator::{Eip1559Fees, FeeEstimator, GasSpeed};
pub use keyring_store::{HardwareTransport, KeyringKind, KeyringStore, KeyringSummary, SignatureScheme};
pub use nonce_manager::NonceManager;
pub use security_aggregator::{
    RuleFinding, RuleSource, SecurityDecision, SecurityDecisionAggregator, Severity, SigningRequest,
};
pub use signer::Signer;
pub use transaction_builder::{TransactionBuilder, TransactionIntent};
pub use transaction_watcher::TransactionWatcher;

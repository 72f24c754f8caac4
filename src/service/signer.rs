//! 签名服务
//!
//! 本地 keyring 在调用线程上同步完成 secp256k1 签名（RFC6979 确定性 k），不做任何 I/O；
//! 硬件 keyring 把 `{digest, path}` 转发给外部设备并等待 `{r, s, recoveryId}`。
//! 两条路径的输入输出完全一致，调用方无需区分。

use std::sync::Arc;

use k256::ecdsa::SigningKey;

use crate::domain::account::{keccak256, Address, KeyringId};
use crate::domain::signature::RecoverableSignature;
use crate::domain::transaction::{SignedTransaction, UnsignedTransaction};
use crate::domain::typed_data::TypedDataPayload;
use crate::error::{EngineError, EngineResult};
use crate::service::keyring_store::{KeyringStore, SignatureScheme, SigningHandle};

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

pub struct Signer {
    keyring_store: Arc<KeyringStore>,
}

impl Signer {
    pub fn new(keyring_store: Arc<KeyringStore>) -> Self {
        Self { keyring_store }
    }

    /// 对任意 32 字节摘要签名
    pub async fn sign_digest(
        &self,
        keyring_id: KeyringId,
        address: &Address,
        digest: &[u8],
    ) -> EngineResult<RecoverableSignature> {
        let digest = as_digest(digest)?;
        self.sign_with_scheme(keyring_id, address, &digest, SignatureScheme::RawDigest)
            .await
    }

    /// 签名交易
    ///
    /// legacy 交易的 `v` 折叠 chainId（EIP-155），type-2 交易只存 yParity
    pub async fn sign_transaction(
        &self,
        keyring_id: KeyringId,
        from: &Address,
        tx: UnsignedTransaction,
    ) -> EngineResult<SignedTransaction> {
        tx.validate()?;
        let digest = tx.signing_hash();
        let signature = self
            .sign_with_scheme(keyring_id, from, &digest, SignatureScheme::Transaction)
            .await?;

        let signed = tx.into_signed(signature);
        tracing::info!(
            keyring_id = %keyring_id,
            address = %from,
            chain_id = signed.transaction.chain_id,
            nonce = signed.transaction.nonce,
            tx_hash = %signed.hash_hex(),
            "transaction signed"
        );
        Ok(signed)
    }

    /// eth_signTypedData_v4
    pub async fn sign_typed_data(
        &self,
        keyring_id: KeyringId,
        address: &Address,
        payload: &TypedDataPayload,
    ) -> EngineResult<RecoverableSignature> {
        let digest = payload.signing_digest()?;
        self.sign_with_scheme(keyring_id, address, &digest, SignatureScheme::TypedData)
            .await
    }

    /// personal_sign
    pub async fn sign_personal_message(
        &self,
        keyring_id: KeyringId,
        address: &Address,
        message: &[u8],
    ) -> EngineResult<RecoverableSignature> {
        let digest = personal_message_hash(message);
        self.sign_with_scheme(keyring_id, address, &digest, SignatureScheme::PersonalMessage)
            .await
    }

    async fn sign_with_scheme(
        &self,
        keyring_id: KeyringId,
        address: &Address,
        digest: &[u8; 32],
        scheme: SignatureScheme,
    ) -> EngineResult<RecoverableSignature> {
        match self.keyring_store.signing_handle(keyring_id, address).await? {
            SigningHandle::Local(key) => sign_prehash(&key, digest),
            SigningHandle::Hardware { transport, path } => {
                if !transport.supports(scheme) {
                    return Err(EngineError::UnsupportedSignatureScheme(format!(
                        "{} does not support {:?} signatures",
                        transport.device_name(),
                        scheme
                    )));
                }

                tracing::debug!(
                    device = %transport.device_name(),
                    path = %path,
                    scheme = ?scheme,
                    "forwarding digest to hardware signer"
                );
                let signature = transport.sign_digest(&path, digest, scheme).await?;

                // 设备返回的签名必须能恢复出该账户
                let recovered = signature.recover_address(digest)?;
                if &recovered != address {
                    return Err(EngineError::HardwareDeviceError(format!(
                        "device signed with {} instead of {}",
                        recovered, address
                    )));
                }
                Ok(signature)
            }
        }
    }
}

/// 用本地私钥签名摘要（RFC6979，低 s）
pub fn sign_prehash(key: &SigningKey, digest: &[u8; 32]) -> EngineResult<RecoverableSignature> {
    let (signature, recovery_id) = key.sign_prehash_recoverable(digest)?;
    Ok(RecoverableSignature::from_k256(&signature, recovery_id))
}

/// keccak256("\x19Ethereum Signed Message:\n" ∥ len(message) ∥ message)
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 20 + message.len());
    buf.extend_from_slice(PERSONAL_MESSAGE_PREFIX.as_bytes());
    buf.extend_from_slice(message.len().to_string().as_bytes());
    buf.extend_from_slice(message);
    keccak256(buf)
}

/// 从摘要与签名恢复地址
pub fn recover_address(digest: &[u8], signature: &RecoverableSignature) -> EngineResult<Address> {
    signature.recover_address(&as_digest(digest)?)
}

/// 校验 personal_sign 签名是否出自 `expected`
pub fn verify_personal_message(
    message: &[u8],
    signature: &RecoverableSignature,
    expected: &Address,
) -> EngineResult<bool> {
    let recovered = signature.recover_address(&personal_message_hash(message))?;
    Ok(&recovered == expected)
}

fn as_digest(digest: &[u8]) -> EngineResult<[u8; 32]> {
    digest.try_into().map_err(|_| {
        EngineError::InvalidDigest(format!("expected 32 bytes, got {}", digest.len()))
    })
}

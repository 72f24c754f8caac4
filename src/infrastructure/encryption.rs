//! AES-256-GCM 加密/解密模块
//! 用于 keyring 会话数据的加密存储
//!
//! 密文格式：nonce(12) ∥ ciphertext+tag；
//! 持久化时包在带 KDF 参数的 [`SealedBlob`] 里

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{EngineError, EngineResult};
use crate::infrastructure::pbkdf2;

const NONCE_LEN: usize = 12;
const BLOB_VERSION: u32 = 1;
const KDF_NAME: &str = "pbkdf2-sha256";

/// 加密数据，返回 nonce + ciphertext
pub fn encrypt_data(data: &[u8], key: &[u8]) -> EngineResult<Vec<u8>> {
    if key.len() != 32 {
        return Err(EngineError::Encryption("key must be 32 bytes for AES-256".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EngineError::Encryption(format!("invalid key: {}", e)))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|e| EngineError::Encryption(e.to_string()))?;

    let mut result = nonce.to_vec();
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// 解密 nonce + ciphertext
pub fn decrypt_data(encrypted: &[u8], key: &[u8]) -> EngineResult<Zeroizing<Vec<u8>>> {
    if key.len() != 32 {
        return Err(EngineError::Decryption("key must be 32 bytes for AES-256".into()));
    }

    if encrypted.len() < NONCE_LEN {
        return Err(EngineError::Decryption("encrypted data too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EngineError::Decryption(format!("invalid key: {}", e)))?;

    let nonce = Nonce::from_slice(&encrypted[..NONCE_LEN]);
    let ciphertext = &encrypted[NONCE_LEN..];

    // GCM 认证失败几乎总是密码错误
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EngineError::Decryption("authentication failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}

/// 加密密钥（使用Zeroize保护）
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.key
    }
}

/// 由密码派生的会话密钥，解锁期间常驻内存，用于重新加密
pub struct SessionKey {
    key: EncryptionKey,
    salt: Vec<u8>,
    rounds: u32,
}

impl SessionKey {
    /// 随机盐值派生（新建 vault / 修改密码）
    pub fn derive(password: &str, rounds: u32) -> EngineResult<Self> {
        Self::derive_with_salt(password, &pbkdf2::random_salt(), rounds)
    }

    pub fn derive_with_salt(password: &str, salt: &[u8], rounds: u32) -> EngineResult<Self> {
        let key = pbkdf2::derive_key(password, salt, rounds)?;
        Ok(Self {
            key: EncryptionKey::new(*key),
            salt: salt.to_vec(),
            rounds,
        })
    }
}

/// 持久化的加密 blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    pub version: u32,
    pub kdf: String,
    pub rounds: u32,
    #[serde(with = "crate::domain::hex_serde::bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "crate::domain::hex_serde::bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// 用密码派生的密钥加密明文
    pub fn seal(plaintext: &[u8], password: &str, rounds: u32) -> EngineResult<Self> {
        Self::seal_with(plaintext, &SessionKey::derive(password, rounds)?)
    }

    pub fn seal_with(plaintext: &[u8], key: &SessionKey) -> EngineResult<Self> {
        Ok(Self {
            version: BLOB_VERSION,
            kdf: KDF_NAME.into(),
            rounds: key.rounds,
            salt: key.salt.clone(),
            ciphertext: encrypt_data(plaintext, key.key.as_slice())?,
        })
    }

    /// 由密码重建会话密钥；密码是否正确要到 open_with 才知道
    pub fn session_key(&self, password: &str) -> EngineResult<SessionKey> {
        if self.version != BLOB_VERSION || self.kdf != KDF_NAME {
            return Err(EngineError::Decryption(format!(
                "unsupported blob version {} / kdf {}",
                self.version, self.kdf
            )));
        }
        SessionKey::derive_with_salt(password, &self.salt, self.rounds)
    }

    /// 解密；密码错误返回 Decryption
    pub fn open(&self, password: &str) -> EngineResult<Zeroizing<Vec<u8>>> {
        self.open_with(&self.session_key(password)?)
    }

    pub fn open_with(&self, key: &SessionKey) -> EngineResult<Zeroizing<Vec<u8>>> {
        decrypt_data(&self.ciphertext, key.key.as_slice())
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Decryption(format!("malformed blob: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = b"01234567890123456789012345678901"; // 32 bytes
        let data = b"Hello, World!";

        let encrypted = encrypt_data(data, key).unwrap();
        assert_ne!(encrypted, data);

        let decrypted = decrypt_data(&encrypted, key).unwrap();
        assert_eq!(decrypted.as_slice(), data);

        let wrong = b"11111111111111111111111111111111";
        assert!(decrypt_data(&encrypted, wrong).is_err());
    }

    #[test]
    fn test_sealed_blob_roundtrip() {
        let blob = SealedBlob::seal(b"vault contents", "hunter2", 1_000).unwrap();
        let bytes = blob.to_bytes().unwrap();
        let parsed = SealedBlob::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, blob);

        assert_eq!(parsed.open("hunter2").unwrap().as_slice(), b"vault contents");
        assert!(matches!(
            parsed.open("wrong"),
            Err(EngineError::Decryption(_))
        ));
    }

    #[test]
    fn test_session_key_reseal_keeps_salt() {
        let key = SessionKey::derive("pw", 1_000).unwrap();
        let first = SealedBlob::seal_with(b"one", &key).unwrap();
        let second = SealedBlob::seal_with(b"two", &key).unwrap();
        assert_eq!(first.salt, second.salt);
        assert_ne!(first.ciphertext, second.ciphertext);

        let rebuilt = second.session_key("pw").unwrap();
        assert_eq!(second.open_with(&rebuilt).unwrap().as_slice(), b"two");
    }
}

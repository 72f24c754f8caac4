//! Web3 Secret Storage (Keystore V3)
//!
//! - KDF：scrypt 或 pbkdf2(hmac-sha256)，dklen = 32
//! - 对称加密：aes-128-ctr，key = dk[0..16]
//! - mac = keccak256(dk[16..32] ∥ ciphertext)
//!
//! 先校验 MAC 再解密，MAC 不一致返回 `MacMismatch`，不会产出错误的私钥

use ctr::cipher::{KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::domain::account::{keccak256, Address};
use crate::error::{EngineError, EngineResult};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

const DKLEN: usize = 32;
const CIPHER: &str = "aes-128-ctr";

/// 导出时使用的 KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfChoice {
    /// N = 2^log_n, r = 8, p = 1
    Scrypt { log_n: u8 },
    Pbkdf2 { iterations: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreV3 {
    pub version: u32,
    pub id: Uuid,
    /// 小写 hex，不带 0x
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(alias = "Crypto")]
    pub crypto: CryptoSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoSection {
    pub cipher: String,
    pub cipherparams: CipherParams,
    pub ciphertext: String,
    pub kdf: String,
    pub kdfparams: KdfParams,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KdfParams {
    Scrypt {
        dklen: usize,
        n: u64,
        r: u32,
        p: u32,
        salt: String,
    },
    Pbkdf2 {
        dklen: usize,
        c: u32,
        prf: String,
        salt: String,
    },
}

impl KeystoreV3 {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Keystore(format!("malformed keystore: {}", e)))
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 加密私钥
pub fn encrypt_key(
    private_key: &[u8; 32],
    password: &str,
    kdf: KdfChoice,
) -> EngineResult<KeystoreV3> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 32];
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let kdfparams = match kdf {
        KdfChoice::Scrypt { log_n } => KdfParams::Scrypt {
            dklen: DKLEN,
            n: 1u64 << log_n,
            r: 8,
            p: 1,
            salt: hex::encode(salt),
        },
        KdfChoice::Pbkdf2 { iterations } => KdfParams::Pbkdf2 {
            dklen: DKLEN,
            c: iterations,
            prf: "hmac-sha256".into(),
            salt: hex::encode(salt),
        },
    };

    let dk = derive_key(password, &kdfparams)?;

    let mut ciphertext = private_key.to_vec();
    apply_ctr(&dk[..16], &iv, &mut ciphertext)?;
    let mac = compute_mac(&dk, &ciphertext);

    let signing_key = k256::ecdsa::SigningKey::from_slice(private_key)
        .map_err(|e| EngineError::InvalidPrivateKey(e.to_string()))?;
    let address = Address::from_public_key(signing_key.verifying_key());

    tracing::debug!(address = %address, kdf = kdf_name(&kdfparams), "keystore encrypted");

    Ok(KeystoreV3 {
        version: 3,
        id: Uuid::new_v4(),
        address: Some(address.to_lower_hex()),
        crypto: CryptoSection {
            cipher: CIPHER.into(),
            cipherparams: CipherParams { iv: hex::encode(iv) },
            ciphertext: hex::encode(&ciphertext),
            kdf: kdf_name(&kdfparams).into(),
            kdfparams,
            mac: hex::encode(mac),
        },
    })
}

/// 解密私钥
pub fn decrypt_key(keystore: &KeystoreV3, password: &str) -> EngineResult<Zeroizing<[u8; 32]>> {
    if keystore.version != 3 {
        return Err(EngineError::Keystore(format!(
            "unsupported keystore version {}",
            keystore.version
        )));
    }
    let crypto = &keystore.crypto;
    if crypto.cipher != CIPHER {
        return Err(EngineError::Keystore(format!(
            "unsupported cipher {}",
            crypto.cipher
        )));
    }
    if crypto.kdf != kdf_name(&crypto.kdfparams) {
        return Err(EngineError::Keystore(format!(
            "kdf {} does not match kdfparams",
            crypto.kdf
        )));
    }

    let ciphertext = decode_field(&crypto.ciphertext, "ciphertext")?;
    let iv = decode_field(&crypto.cipherparams.iv, "iv")?;
    let expected_mac = decode_field(&crypto.mac, "mac")?;

    let dk = derive_key(password, &crypto.kdfparams)?;
    let mac = compute_mac(&dk, &ciphertext);
    if !bool::from(mac.as_slice().ct_eq(&expected_mac)) {
        return Err(EngineError::MacMismatch);
    }

    if ciphertext.len() != 32 {
        return Err(EngineError::Keystore(format!(
            "ciphertext must be 32 bytes, got {}",
            ciphertext.len()
        )));
    }
    let mut plaintext = Zeroizing::new([0u8; 32]);
    plaintext.copy_from_slice(&ciphertext);
    apply_ctr(&dk[..16], &iv, &mut plaintext[..])?;

    if let Some(expected) = &keystore.address {
        let signing_key = k256::ecdsa::SigningKey::from_slice(&plaintext[..])
            .map_err(|e| EngineError::InvalidPrivateKey(e.to_string()))?;
        let actual = Address::from_public_key(signing_key.verifying_key()).to_lower_hex();
        if actual != expected.trim_start_matches("0x").to_lowercase() {
            return Err(EngineError::Keystore(format!(
                "decrypted key belongs to 0x{}, keystore says 0x{}",
                actual, expected
            )));
        }
    }

    Ok(plaintext)
}

fn kdf_name(params: &KdfParams) -> &'static str {
    match params {
        KdfParams::Scrypt { .. } => "scrypt",
        KdfParams::Pbkdf2 { .. } => "pbkdf2",
    }
}

fn derive_key(password: &str, params: &KdfParams) -> EngineResult<Zeroizing<[u8; DKLEN]>> {
    let mut dk = Zeroizing::new([0u8; DKLEN]);
    match params {
        KdfParams::Scrypt {
            dklen,
            n,
            r,
            p,
            salt,
        } => {
            check_dklen(*dklen)?;
            if *n < 2 || !n.is_power_of_two() {
                return Err(EngineError::Keystore(format!(
                    "scrypt n must be a power of two, got {}",
                    n
                )));
            }
            let log_n = n.trailing_zeros() as u8;
            let salt = decode_field(salt, "salt")?;
            let params = scrypt::Params::new(log_n, *r, *p, DKLEN)
                .map_err(|e| EngineError::Keystore(format!("invalid scrypt params: {}", e)))?;
            scrypt::scrypt(password.as_bytes(), &salt, &params, &mut dk[..])
                .map_err(|e| EngineError::Keystore(format!("scrypt failed: {}", e)))?;
        }
        KdfParams::Pbkdf2 {
            dklen,
            c,
            prf,
            salt,
        } => {
            check_dklen(*dklen)?;
            if prf != "hmac-sha256" {
                return Err(EngineError::Keystore(format!("unsupported prf {}", prf)));
            }
            let salt = decode_field(salt, "salt")?;
            pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, *c, &mut dk[..]);
        }
    }
    Ok(dk)
}

fn check_dklen(dklen: usize) -> EngineResult<()> {
    if dklen != DKLEN {
        return Err(EngineError::Keystore(format!(
            "dklen must be {}, got {}",
            DKLEN, dklen
        )));
    }
    Ok(())
}

fn compute_mac(dk: &[u8; DKLEN], ciphertext: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(16 + ciphertext.len());
    buf.extend_from_slice(&dk[16..32]);
    buf.extend_from_slice(ciphertext);
    keccak256(buf)
}

fn apply_ctr(key: &[u8], iv: &[u8], data: &mut [u8]) -> EngineResult<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|e| EngineError::Keystore(format!("invalid key or iv: {}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

fn decode_field(value: &str, field: &str) -> EngineResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| EngineError::Keystore(format!("invalid {} hex: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Web3 Secret Storage 文档中的 PBKDF2 测试向量
    const PBKDF2_VECTOR: &str = r#"{
        "crypto": {
            "cipher": "aes-128-ctr",
            "cipherparams": {"iv": "6087dab2f9fdbbfaddc31a909735c1e6"},
            "ciphertext": "5318b4d5bcd28de64ee5559e671353e16f075ecae9f99c7a79a38af5f869aa46",
            "kdf": "pbkdf2",
            "kdfparams": {
                "c": 262144,
                "dklen": 32,
                "prf": "hmac-sha256",
                "salt": "ae3cd4e7013836a3df6bd7241b12db061dbe2c6785853cce422d148a624ce0bd"
            },
            "mac": "517ead924a9d0dc3124507e3393d175ce3ff7c1e96529c6c555ce9e51205e9b2"
        },
        "id": "3198bc9c-6672-5ab3-d995-4942343ae5b6",
        "version": 3
    }"#;

    #[test]
    fn test_decrypt_reference_vector() {
        let keystore = KeystoreV3::from_json(PBKDF2_VECTOR).unwrap();
        let key = decrypt_key(&keystore, "testpassword").unwrap();
        assert_eq!(
            hex::encode(&key[..]),
            "7a28b5ba57c53603b0b07b56bba752f7784bf506fa95edc395f5cf6c7514fe9d"
        );

        assert!(matches!(
            decrypt_key(&keystore, "wrongpassword"),
            Err(EngineError::MacMismatch)
        ));
    }

    #[test]
    fn test_scrypt_roundtrip() {
        let secret = keccak256(b"keystore secret");
        let keystore = encrypt_key(&secret, "p@ss", KdfChoice::Scrypt { log_n: 10 }).unwrap();
        assert_eq!(keystore.crypto.kdf, "scrypt");

        let json = keystore.to_json().unwrap();
        let parsed = KeystoreV3::from_json(&json).unwrap();
        assert_eq!(*decrypt_key(&parsed, "p@ss").unwrap(), secret);
        assert!(matches!(
            decrypt_key(&parsed, "nope"),
            Err(EngineError::MacMismatch)
        ));
    }

    #[test]
    fn test_pbkdf2_roundtrip_records_address() {
        let secret = keccak256(b"another secret");
        let keystore =
            encrypt_key(&secret, "pw", KdfChoice::Pbkdf2 { iterations: 1024 }).unwrap();
        let expected = Address::from_public_key(
            k256::ecdsa::SigningKey::from_slice(&secret)
                .unwrap()
                .verifying_key(),
        );
        assert_eq!(keystore.address.as_deref(), Some(expected.to_lower_hex().as_str()));
        assert_eq!(*decrypt_key(&keystore, "pw").unwrap(), secret);
    }

    #[test]
    fn test_tampered_ciphertext_fails_mac() {
        let secret = keccak256(b"tamper");
        let mut keystore =
            encrypt_key(&secret, "pw", KdfChoice::Pbkdf2 { iterations: 1024 }).unwrap();
        let mut ct = hex::decode(&keystore.crypto.ciphertext).unwrap();
        ct[0] ^= 1;
        keystore.crypto.ciphertext = hex::encode(ct);
        assert!(matches!(
            decrypt_key(&keystore, "pw"),
            Err(EngineError::MacMismatch)
        ));
    }

    #[test]
    fn test_unsupported_cipher_rejected() {
        let mut keystore = KeystoreV3::from_json(PBKDF2_VECTOR).unwrap();
        keystore.crypto.cipher = "aes-256-gcm".into();
        assert!(matches!(
            decrypt_key(&keystore, "testpassword"),
            Err(EngineError::Keystore(_))
        ));
    }
}

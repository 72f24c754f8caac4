//! BIP39 / BIP32 / BIP44 密钥派生
//!
//! 纯函数，无状态：
//! - 助记词 → 种子：bip39 crate（PBKDF2-HMAC-SHA512，2048 轮，passphrase 经 NFKD）
//! - 种子 → 主密钥：HMAC-SHA512(key = "Bitcoin seed")
//! - 子密钥：HMAC-SHA512(chainCode, data)，child = (IL + k) mod n
//!
//! 子密钥必须走完整的 HMAC-SHA512 构造，任何“把索引混入父私钥”的捷径
//! 都会得到与所有标准钱包不一致的地址。

use bip39::{Language, Mnemonic};
use hmac::{Hmac, Mac};
use k256::{
    ecdsa::SigningKey,
    elliptic_curve::{Field, PrimeField},
    FieldBytes, Scalar,
};
use rand::{rngs::OsRng, RngCore};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::domain::{
    account::Address,
    derivation_path::{ChildNumber, DerivationPath, HARDENED_OFFSET},
};
use crate::error::{EngineError, EngineResult};

type HmacSha512 = Hmac<Sha512>;

/// BIP39 种子长度
pub const SEED_LEN: usize = 64;

/// 退化子密钥时最多向后跳过的索引数
const MAX_CHILD_SKIPS: u32 = 16;

/// 扩展私钥（只在派生过程中短暂存在，drop 时清零）
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    private_key: [u8; 32],
    chain_code: [u8; 32],
    #[zeroize(skip)]
    pub depth: u8,
    #[zeroize(skip)]
    pub parent_fingerprint: [u8; 4],
    /// BIP32 序列化形式（硬化时含 2^31）
    #[zeroize(skip)]
    pub child_number: u32,
}

impl std::fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("depth", &self.depth)
            .field("parent_fingerprint", &hex::encode(self.parent_fingerprint))
            .field("child_number", &self.child_number)
            .finish_non_exhaustive()
    }
}

impl ExtendedKey {
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn signing_key(&self) -> EngineResult<SigningKey> {
        SigningKey::from_slice(&self.private_key)
            .map_err(|e| EngineError::InvalidPrivateKey(e.to_string()))
    }

    /// 33 字节压缩公钥
    pub fn public_key(&self) -> EngineResult<Vec<u8>> {
        Ok(self
            .signing_key()?
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec())
    }

    pub fn address(&self) -> EngineResult<Address> {
        Ok(Address::from_public_key(self.signing_key()?.verifying_key()))
    }

    /// hash160(压缩公钥) 的前 4 字节
    pub fn fingerprint(&self) -> EngineResult<[u8; 4]> {
        let sha = Sha256::digest(self.public_key()?);
        let hash160 = Ripemd160::digest(sha);
        let mut out = [0u8; 4];
        out.copy_from_slice(&hash160[..4]);
        Ok(out)
    }
}

/// 校验助记词（词表 + 校验和），返回规范化后的助记词
pub fn parse_mnemonic(words: &str) -> EngineResult<Mnemonic> {
    let normalized = words
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))
}

/// 生成新助记词（12/15/18/21/24 词）
pub fn generate_mnemonic(word_count: usize) -> EngineResult<Zeroizing<String>> {
    if !matches!(word_count, 12 | 15 | 18 | 21 | 24) {
        return Err(EngineError::InvalidMnemonic(format!(
            "unsupported word count: {}",
            word_count
        )));
    }

    let mut entropy = Zeroizing::new(vec![0u8; word_count / 3 * 4]);
    OsRng.fill_bytes(&mut entropy);

    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// 助记词 → 64 字节种子
///
/// passphrase 先做 NFKD 规范化，非 ASCII 口令才能与其他 BIP39 钱包得到同一种子
pub fn seed_from_mnemonic(words: &str, passphrase: &str) -> EngineResult<Zeroizing<[u8; SEED_LEN]>> {
    let mnemonic = parse_mnemonic(words)?;
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase)))
}

/// 种子 → 主密钥
pub fn master_key(seed: &[u8]) -> EngineResult<ExtendedKey> {
    if !(16..=64).contains(&seed.len()) {
        return Err(EngineError::InvalidMnemonic(format!(
            "seed must be 16..=64 bytes, got {}",
            seed.len()
        )));
    }

    let i = hmac_sha512(b"Bitcoin seed", seed)?;
    let (il, ir) = i.split_at(32);

    match parse_scalar(il) {
        Some(k) if !bool::from(k.is_zero()) => {}
        _ => {
            return Err(EngineError::InvalidPrivateKey(
                "master key out of curve order".into(),
            ))
        }
    }

    let mut private_key = [0u8; 32];
    let mut chain_code = [0u8; 32];
    private_key.copy_from_slice(il);
    chain_code.copy_from_slice(ir);

    Ok(ExtendedKey {
        private_key,
        chain_code,
        depth: 0,
        parent_fingerprint: [0u8; 4],
        child_number: 0,
    })
}

/// 严格派生单个子密钥；IL ≥ n 或结果为 0 时返回 `InvalidChildKey`
pub fn derive_child(parent: &ExtendedKey, index: u32, hardened: bool) -> EngineResult<ExtendedKey> {
    let child = ChildNumber::new(index, hardened)?;
    let serialized = child.to_u32();

    let mut data = Zeroizing::new(Vec::with_capacity(37));
    if hardened {
        data.push(0x00);
        data.extend_from_slice(&parent.private_key);
    } else {
        data.extend_from_slice(&parent.public_key()?);
    }
    data.extend_from_slice(&serialized.to_be_bytes());

    let i = hmac_sha512(&parent.chain_code, &data)?;
    let (il, ir) = i.split_at(32);

    let tweak = parse_scalar(il).ok_or(EngineError::InvalidChildKey(index))?;
    let parent_scalar = parse_scalar(&parent.private_key)
        .ok_or_else(|| EngineError::InvalidPrivateKey("parent key out of range".into()))?;
    let child_scalar = tweak + parent_scalar;
    if bool::from(child_scalar.is_zero()) {
        return Err(EngineError::InvalidChildKey(index));
    }

    let mut private_key = [0u8; 32];
    private_key.copy_from_slice(&child_scalar.to_repr());
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(ir);

    Ok(ExtendedKey {
        private_key,
        chain_code,
        depth: parent.depth.saturating_add(1),
        parent_fingerprint: parent.fingerprint()?,
        child_number: serialized,
    })
}

/// 按 BIP32 处理退化子密钥：跳到 index+1 继续，超出重试上限才报错
pub fn derive_child_skipping(
    parent: &ExtendedKey,
    index: u32,
    hardened: bool,
) -> EngineResult<ExtendedKey> {
    let mut candidate = index;
    for _ in 0..=MAX_CHILD_SKIPS {
        match derive_child(parent, candidate, hardened) {
            Err(EngineError::InvalidChildKey(i)) => {
                tracing::warn!(index = i, "Degenerate BIP32 child key, skipping to next index");
                candidate = candidate
                    .checked_add(1)
                    .filter(|c| *c < HARDENED_OFFSET)
                    .ok_or(EngineError::InvalidChildKey(i))?;
            }
            other => return other,
        }
    }
    Err(EngineError::InvalidChildKey(candidate))
}

/// 从主密钥开始逐级派生
pub fn derive_full_path(seed: &[u8], path: &DerivationPath) -> EngineResult<ExtendedKey> {
    let mut key = master_key(seed)?;
    for child in path.children() {
        key = derive_child_skipping(&key, child.index, child.hardened)?;
    }
    Ok(key)
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> EngineResult<Zeroizing<[u8; 64]>> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| EngineError::Other(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// 大端 32 字节 → 标量；≥ n 时返回 None
fn parse_scalar(bytes: &[u8]) -> Option<Scalar> {
    let repr = FieldBytes::clone_from_slice(bytes);
    Option::from(Scalar::from_repr(repr))
}

//! PBKDF2 密钥派生模块
//! 用于从用户密码派生会话加密密钥

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};

pub const SALT_LENGTH: usize = 16; // 16字节盐值
pub const KEY_LENGTH: usize = 32; // 32字节密钥（AES-256）
/// 低于此迭代次数拒绝派生
pub const MIN_ITERATIONS: u32 = 1_000;

/// 生成随机盐值
pub fn random_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// 从密码和盐值派生 32 字节密钥
///
/// # Arguments
/// * `password` - 用户密码
/// * `salt` - 盐值
/// * `iterations` - 迭代次数
pub fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> EngineResult<Zeroizing<[u8; KEY_LENGTH]>> {
    if salt.len() != SALT_LENGTH {
        return Err(EngineError::Encryption(format!(
            "salt must be {} bytes",
            SALT_LENGTH
        )));
    }
    if iterations < MIN_ITERATIONS {
        return Err(EngineError::Encryption(format!(
            "pbkdf2 iterations {} below minimum {}",
            iterations, MIN_ITERATIONS
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    Ok(key)
}

//! 可恢复 ECDSA 签名 {r, s, recoveryId}

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::domain::account::Address;
use crate::error::{EngineError, EngineResult};

/// secp256k1 可恢复签名
///
/// `recovery_id` 只取 0 / 1，按签名方案再编码为 legacy `v`、EIP-155 `v` 或 `yParity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableSignature {
    #[serde(with = "crate::domain::hex_serde::bytes32")]
    pub r: [u8; 32],
    #[serde(with = "crate::domain::hex_serde::bytes32")]
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl RecoverableSignature {
    pub fn new(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> EngineResult<Self> {
        if recovery_id > 1 {
            return Err(EngineError::InvalidSignature(format!(
                "recovery id must be 0 or 1, got {}",
                recovery_id
            )));
        }
        if r == [0u8; 32] || s == [0u8; 32] {
            return Err(EngineError::InvalidSignature("r and s must be non-zero".into()));
        }
        Ok(Self { r, s, recovery_id })
    }

    pub(crate) fn from_k256(signature: &Signature, recovery_id: RecoveryId) -> Self {
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Self {
            r,
            s,
            recovery_id: recovery_id.to_byte() & 1,
        }
    }

    /// EIP-155 `v = recoveryId + chainId * 2 + 35`
    pub fn eip155_v(&self, chain_id: u64) -> u64 {
        self.recovery_id as u64 + chain_id * 2 + 35
    }

    /// personal_sign / eth_signTypedData 惯用的 65 字节 r ∥ s ∥ (27 + recoveryId)
    pub fn to_rsv_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = 27 + self.recovery_id;
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_rsv_bytes()))
    }

    /// 解析 65 字节签名，v 接受 0/1、27/28
    pub fn from_rsv_bytes(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() != 65 {
            return Err(EngineError::InvalidSignature(format!(
                "expected 65 bytes, got {}",
                bytes.len()
            )));
        }
        let v = bytes[64];
        let recovery_id = match v {
            0 | 1 => v,
            27 | 28 => v - 27,
            other => {
                return Err(EngineError::InvalidSignature(format!(
                    "unsupported v value {}",
                    other
                )))
            }
        };
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Self::new(r, s, recovery_id)
    }

    /// 从摘要恢复公钥；高 s 签名先规范化再恢复
    pub fn recover_verifying_key(&self, digest: &[u8; 32]) -> EngineResult<VerifyingKey> {
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&rs)?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id).ok_or_else(|| {
            EngineError::InvalidSignature(format!("bad recovery id {}", self.recovery_id))
        })?;

        let (signature, recovery_id) = match signature.normalize_s() {
            Some(low) => (
                low,
                RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
            ),
            None => (signature, recovery_id),
        };

        Ok(VerifyingKey::recover_from_prehash(
            digest,
            &signature,
            recovery_id,
        )?)
    }

    pub fn recover_address(&self, digest: &[u8; 32]) -> EngineResult<Address> {
        Ok(Address::from_public_key(&self.recover_verifying_key(digest)?))
    }
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::SigningKey;

    use super::*;
    use crate::domain::account::keccak256;

    #[test]
    fn test_sign_recover_roundtrip() {
        for seed in 1u8..=16 {
            let secret = keccak256([seed]);
            let key = SigningKey::from_slice(&secret).unwrap();
            let digest = keccak256(format!("message #{}", seed));

            let (sig, recid) = key.sign_prehash_recoverable(&digest).unwrap();
            let sig = RecoverableSignature::from_k256(&sig, recid);

            let recovered = sig.recover_verifying_key(&digest).unwrap();
            assert_eq!(&recovered, key.verifying_key());
        }
    }

    #[test]
    fn test_high_s_signature_still_recovers() {
        let key = SigningKey::from_slice(&keccak256(b"high-s")).unwrap();
        let digest = keccak256(b"payload");
        let (sig, recid) = key.sign_prehash_recoverable(&digest).unwrap();
        let low = RecoverableSignature::from_k256(&sig, recid);

        // s' = n - s，recovery id 取反
        let s_scalar: k256::Scalar = *sig.s().as_ref();
        let mut high_s = [0u8; 32];
        high_s.copy_from_slice(&(-s_scalar).to_bytes());
        let high = RecoverableSignature::new(low.r, high_s, low.recovery_id ^ 1).unwrap();
        assert_ne!(high.s, low.s);

        assert_eq!(
            high.recover_address(&digest).unwrap(),
            low.recover_address(&digest).unwrap()
        );
    }

    #[test]
    fn test_rsv_encoding() {
        let sig = RecoverableSignature::new([1u8; 32], [2u8; 32], 1).unwrap();
        let bytes = sig.to_rsv_bytes();
        assert_eq!(bytes[64], 28);
        assert_eq!(RecoverableSignature::from_rsv_bytes(&bytes).unwrap(), sig);
        assert_eq!(sig.eip155_v(1), 38);
        assert_eq!(sig.eip155_v(137), 310);

        assert!(RecoverableSignature::new([0u8; 32], [2u8; 32], 0).is_err());
        assert!(RecoverableSignature::new([1u8; 32], [2u8; 32], 2).is_err());
        assert!(RecoverableSignature::from_rsv_bytes(&[0u8; 64]).is_err());
    }
}

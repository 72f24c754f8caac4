//! EVM 交易模型与 RLP 编码
//!
//! - type 0 (legacy, EIP-155)：签名载荷 `RLP([nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0])`
//! - type 2 (EIP-1559)：签名载荷 `0x02 ∥ RLP([chainId, nonce, maxPriorityFeePerGas, maxFeePerGas,
//!   gasLimit, to, value, data, accessList])`
//!
//! 已签名的 legacy 交易把 `v = recoveryId + chainId*2 + 35` 放在列表末尾；
//! type-2 交易直接存 `yParity`（0/1），不折叠 chainId。

use ethers::types::U256;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};

use crate::domain::{
    account::{keccak256, Address},
    signature::RecoverableSignature,
};
use crate::error::{EngineError, EngineResult};

/// 普通转账最低 gas
pub const MIN_TRANSFER_GAS: u64 = 21_000;

/// EIP-2718 交易类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Legacy,
    Eip1559,
}

impl TxType {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::Eip1559 => 2,
        }
    }
}

/// 费用字段：legacy gasPrice 与 (maxFee, maxPriority) 二选一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GasPricing {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPricing {
    pub fn tx_type(&self) -> TxType {
        match self {
            Self::Legacy { .. } => TxType::Legacy,
            Self::Eip1559 { .. } => TxType::Eip1559,
        }
    }

    /// 每单位 gas 最多支付的价格（legacy 为 gasPrice，1559 为 maxFee）
    pub fn fee_cap(&self) -> U256 {
        match self {
            Self::Legacy { gas_price } => *gas_price,
            Self::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// 给矿工的小费（legacy 交易等同于 gasPrice）
    pub fn tip_cap(&self) -> U256 {
        match self {
            Self::Legacy { gas_price } => *gas_price,
            Self::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => *max_priority_fee_per_gas,
        }
    }

    /// 按百分比提价（向上取整），用于加速 / 取消
    pub fn bumped(&self, percent: u64) -> Self {
        let bump = |v: U256| -> U256 {
            let scaled = v * U256::from(100 + percent);
            let hundred = U256::from(100u64);
            (scaled + hundred - U256::one()) / hundred
        };
        match self {
            Self::Legacy { gas_price } => Self::Legacy {
                gas_price: bump(*gas_price),
            },
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Self::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas),
            },
        }
    }
}

/// EIP-2930 访问列表项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListItem {
    pub address: Address,
    #[serde(with = "crate::domain::hex_serde::bytes32_vec")]
    pub storage_keys: Vec<[u8; 32]>,
}

/// 未签名交易（交给 Signer 后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    /// None 表示合约创建
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "crate::domain::hex_serde::bytes")]
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub fees: GasPricing,
    #[serde(default)]
    pub access_list: Vec<AccessListItem>,
}

impl UnsignedTransaction {
    pub fn tx_type(&self) -> TxType {
        self.fees.tx_type()
    }

    /// 签名前的结构校验
    pub fn validate(&self) -> EngineResult<()> {
        if self.chain_id == 0 {
            return Err(EngineError::InvalidTransaction("chain_id must be non-zero".into()));
        }
        if self.gas_limit < MIN_TRANSFER_GAS {
            return Err(EngineError::InvalidTransaction(format!(
                "gas limit {} below intrinsic {}",
                self.gas_limit, MIN_TRANSFER_GAS
            )));
        }
        if self.to.is_none() && self.data.is_empty() {
            return Err(EngineError::InvalidTransaction(
                "contract creation requires init code".into(),
            ));
        }
        match &self.fees {
            GasPricing::Legacy { .. } => {
                if !self.access_list.is_empty() {
                    return Err(EngineError::InvalidTransaction(
                        "access list is not supported on legacy transactions".into(),
                    ));
                }
            }
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                if max_priority_fee_per_gas > max_fee_per_gas {
                    return Err(EngineError::InvalidTransaction(format!(
                        "maxPriorityFeePerGas {} exceeds maxFeePerGas {}",
                        max_priority_fee_per_gas, max_fee_per_gas
                    )));
                }
            }
        }
        Ok(())
    }

    /// 待签名字节
    pub fn signing_payload(&self) -> Vec<u8> {
        match &self.fees {
            GasPricing::Legacy { gas_price } => {
                let mut s = RlpStream::new();
                s.begin_list(9);
                self.append_legacy_fields(&mut s, gas_price);
                s.append(&self.chain_id);
                s.append(&0u8);
                s.append(&0u8);
                s.out().to_vec()
            }
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut s = RlpStream::new();
                s.begin_list(9);
                self.append_eip1559_fields(&mut s, max_fee_per_gas, max_priority_fee_per_gas);
                typed_envelope(TxType::Eip1559, &s.out())
            }
        }
    }

    /// keccak256(signing_payload)
    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(self.signing_payload())
    }

    /// 拼接签名得到已签名交易
    pub fn into_signed(self, signature: RecoverableSignature) -> SignedTransaction {
        let (v, raw) = match &self.fees {
            GasPricing::Legacy { gas_price } => {
                let v = signature.eip155_v(self.chain_id);
                let mut s = RlpStream::new();
                s.begin_list(9);
                self.append_legacy_fields(&mut s, gas_price);
                s.append(&v);
                append_trimmed(&mut s, &signature.r);
                append_trimmed(&mut s, &signature.s);
                (v, s.out().to_vec())
            }
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let y_parity = signature.recovery_id as u64;
                let mut s = RlpStream::new();
                s.begin_list(12);
                self.append_eip1559_fields(&mut s, max_fee_per_gas, max_priority_fee_per_gas);
                s.append(&y_parity);
                append_trimmed(&mut s, &signature.r);
                append_trimmed(&mut s, &signature.s);
                (y_parity, typed_envelope(TxType::Eip1559, &s.out()))
            }
        };

        let hash = keccak256(&raw);
        SignedTransaction {
            transaction: self,
            v,
            signature,
            raw,
            hash,
        }
    }

    fn append_legacy_fields(&self, s: &mut RlpStream, gas_price: &U256) {
        s.append(&self.nonce);
        append_uint(s, gas_price);
        s.append(&self.gas_limit);
        append_to(s, &self.to);
        append_uint(s, &self.value);
        s.append(&self.data);
    }

    fn append_eip1559_fields(&self, s: &mut RlpStream, max_fee: &U256, max_priority: &U256) {
        s.append(&self.chain_id);
        s.append(&self.nonce);
        append_uint(s, max_priority);
        append_uint(s, max_fee);
        s.append(&self.gas_limit);
        append_to(s, &self.to);
        append_uint(s, &self.value);
        s.append(&self.data);
        append_access_list(s, &self.access_list);
    }
}

/// 已签名交易，创建后不再修改；替换交易是新的 UnsignedTransaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: UnsignedTransaction,
    /// legacy: EIP-155 v；type-2: yParity
    pub v: u64,
    pub signature: RecoverableSignature,
    #[serde(with = "crate::domain::hex_serde::bytes")]
    pub raw: Vec<u8>,
    #[serde(with = "crate::domain::hex_serde::bytes32")]
    pub hash: [u8; 32],
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }

    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }

    /// 从签名恢复发送方
    pub fn recover_sender(&self) -> EngineResult<Address> {
        self.signature
            .recover_address(&self.transaction.signing_hash())
    }
}

fn typed_envelope(tx_type: TxType, rlp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rlp.len() + 1);
    out.push(tx_type.as_byte());
    out.extend_from_slice(rlp);
    out
}

/// 整数按最小大端字节编码（0 编码为空串）
fn append_uint(s: &mut RlpStream, value: &U256) {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    append_trimmed(s, &buf);
}

fn append_trimmed(s: &mut RlpStream, bytes: &[u8]) {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    s.append(&bytes[start..].to_vec());
}

fn append_to(s: &mut RlpStream, to: &Option<Address>) {
    match to {
        Some(addr) => {
            s.append(&addr.as_bytes().to_vec());
        }
        None => {
            s.append_empty_data();
        }
    }
}

fn append_access_list(s: &mut RlpStream, list: &[AccessListItem]) {
    s.begin_list(list.len());
    for item in list {
        s.begin_list(2);
        s.append(&item.address.as_bytes().to_vec());
        s.begin_list(item.storage_keys.len());
        for key in &item.storage_keys {
            s.append(&key.to_vec());
        }
    }
}

/// gwei → wei
pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}

/// ether → wei
pub fn ether(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(18)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eip155_example() -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: 1,
            nonce: 9,
            to: Some("0x3535353535353535353535353535353535353535".parse().unwrap()),
            value: ether(1),
            data: vec![],
            gas_limit: 21_000,
            fees: GasPricing::Legacy { gas_price: gwei(20) },
            access_list: vec![],
        }
    }

    #[test]
    fn test_eip155_signing_payload() {
        let tx = eip155_example();
        assert_eq!(
            hex::encode(tx.signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_legacy_signed_encoding_layout() {
        let tx = eip155_example();
        let sig = RecoverableSignature::new([0x11; 32], [0x22; 32], 1).unwrap();
        let signed = tx.into_signed(sig);
        assert_eq!(signed.v, 38);

        let rlp = rlp::Rlp::new(&signed.raw);
        assert_eq!(rlp.item_count().unwrap(), 9);
        assert_eq!(rlp.val_at::<u64>(0).unwrap(), 9);
        assert_eq!(rlp.val_at::<u64>(6).unwrap(), 38);
        assert_eq!(rlp.val_at::<Vec<u8>>(7).unwrap(), vec![0x11; 32]);
        assert_eq!(hex::encode(signed.hash), hex::encode(keccak256(&signed.raw)));
    }

    #[test]
    fn test_eip1559_payload_layout() {
        let tx = UnsignedTransaction {
            chain_id: 1,
            nonce: 0,
            to: Some("0x3535353535353535353535353535353535353535".parse().unwrap()),
            value: U256::zero(),
            data: vec![0xde, 0xad],
            gas_limit: 50_000,
            fees: GasPricing::Eip1559 {
                max_fee_per_gas: gwei(30),
                max_priority_fee_per_gas: gwei(2),
            },
            access_list: vec![AccessListItem {
                address: "0x0000000000000000000000000000000000000001".parse().unwrap(),
                storage_keys: vec![[0u8; 32]],
            }],
        };
        let payload = tx.signing_payload();
        assert_eq!(payload[0], 0x02);

        let rlp = rlp::Rlp::new(&payload[1..]);
        assert_eq!(rlp.item_count().unwrap(), 9);
        assert_eq!(rlp.val_at::<u64>(0).unwrap(), 1);
        assert_eq!(rlp.val_at::<u64>(1).unwrap(), 0);
        assert_eq!(rlp.val_at::<u64>(2).unwrap(), 2_000_000_000);
        assert_eq!(rlp.val_at::<u64>(3).unwrap(), 30_000_000_000);
        assert_eq!(rlp.val_at::<Vec<u8>>(7).unwrap(), vec![0xde, 0xad]);
        let access_list = rlp.at(8).unwrap();
        assert_eq!(access_list.item_count().unwrap(), 1);
        assert_eq!(access_list.at(0).unwrap().at(1).unwrap().item_count().unwrap(), 1);

        let sig = RecoverableSignature::new([0x11; 32], [0x22; 32], 1).unwrap();
        let signed = tx.into_signed(sig);
        // yParity 不折叠 chainId
        assert_eq!(signed.v, 1);
        assert_eq!(signed.raw[0], 0x02);
        let rlp = rlp::Rlp::new(&signed.raw[1..]);
        assert_eq!(rlp.item_count().unwrap(), 12);
        assert_eq!(rlp.val_at::<u64>(9).unwrap(), 1);
    }

    #[test]
    fn test_contract_creation_encodes_empty_to() {
        let mut tx = eip155_example();
        tx.to = None;
        tx.data = vec![0x60, 0x80];
        tx.validate().unwrap();
        let payload = tx.signing_payload();
        let rlp = rlp::Rlp::new(&payload);
        assert!(rlp.at(3).unwrap().is_empty());
    }

    #[test]
    fn test_validate() {
        let mut tx = eip155_example();
        assert!(tx.validate().is_ok());

        tx.gas_limit = 20_000;
        assert!(tx.validate().is_err());

        let mut tx = eip155_example();
        tx.fees = GasPricing::Eip1559 {
            max_fee_per_gas: gwei(1),
            max_priority_fee_per_gas: gwei(2),
        };
        assert!(tx.validate().is_err());

        let mut tx = eip155_example();
        tx.access_list = vec![AccessListItem {
            address: Address::ZERO,
            storage_keys: vec![],
        }];
        assert!(tx.validate().is_err());

        let mut tx = eip155_example();
        tx.chain_id = 0;
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_bumped_fees_round_up() {
        let fees = GasPricing::Legacy {
            gas_price: U256::from(15u64),
        };
        // 15 * 1.1 = 16.5 → 17
        assert_eq!(fees.bumped(10).fee_cap(), U256::from(17u64));

        let fees = GasPricing::Eip1559 {
            max_fee_per_gas: gwei(100),
            max_priority_fee_per_gas: gwei(2),
        };
        let bumped = fees.bumped(10);
        assert_eq!(bumped.fee_cap(), gwei(110));
        assert_eq!(bumped.tip_cap(), U256::from(2_200_000_000u64));
    }
}

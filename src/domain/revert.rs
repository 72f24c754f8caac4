//! revert 数据解码
//!
//! - `Error(string)`  selector `0x08c379a0`
//! - `Panic(uint256)` selector `0x4e487b71`
//! - 其他数据原样以 hex 返回，不吞掉

use std::fmt;

use ethers::types::U256;

pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    /// require(cond, "msg") / revert("msg")
    Error(String),
    /// assert 失败、溢出、除零等
    Panic(U256),
    /// 自定义错误或无法识别的数据
    Opaque(Vec<u8>),
    /// 无 revert 数据
    Empty,
}

impl RevertReason {
    /// 解码 revert 返回数据
    pub fn decode(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::Empty;
        }
        if data.len() < 4 {
            return Self::Opaque(data.to_vec());
        }

        let (selector, body) = data.split_at(4);
        if selector == ERROR_SELECTOR {
            if let Some(message) = decode_abi_string(body) {
                return Self::Error(message);
            }
        } else if selector == PANIC_SELECTOR && body.len() == 32 {
            return Self::Panic(U256::from_big_endian(body));
        }
        Self::Opaque(data.to_vec())
    }

    /// Solidity 内置 panic code 说明
    pub fn panic_description(code: &U256) -> &'static str {
        if code.bits() > 8 {
            return "unknown panic code";
        }
        match code.low_u64() {
            0x00 => "generic compiler panic",
            0x01 => "assertion failed",
            0x11 => "arithmetic overflow or underflow",
            0x12 => "division or modulo by zero",
            0x21 => "invalid enum value",
            0x22 => "invalid storage byte array encoding",
            0x31 => "pop on empty array",
            0x32 => "array index out of bounds",
            0x41 => "out of memory",
            0x51 => "call to zero-initialized function",
            _ => "unknown panic code",
        }
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => f.write_str(message),
            Self::Panic(code) => write!(
                f,
                "Panic(0x{:02x}): {}",
                code.low_u64(),
                Self::panic_description(code)
            ),
            Self::Opaque(data) => write!(f, "0x{}", hex::encode(data)),
            Self::Empty => f.write_str("execution reverted"),
        }
    }
}

/// ABI 解码单个 `string` 参数：offset(32) ∥ length(32) ∥ bytes
fn decode_abi_string(body: &[u8]) -> Option<String> {
    let offset = read_usize(body, 0)?;
    let len = read_usize(body, offset)?;
    let start = offset.checked_add(32)?;
    let end = start.checked_add(len)?;
    let bytes = body.get(start..end)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn read_usize(body: &[u8], at: usize) -> Option<usize> {
    let word = body.get(at..at.checked_add(32)?)?;
    let value = U256::from_big_endian(word);
    if value.bits() > 32 {
        return None;
    }
    Some(value.low_u64() as usize)
}

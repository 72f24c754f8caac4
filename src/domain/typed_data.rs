//! EIP-712 结构化数据编码
//!
//! `digest = keccak256(0x19 ∥ 0x01 ∥ hashStruct(EIP712Domain, domain) ∥ hashStruct(primaryType, message))`
//!
//! - `encodeType`：主类型在前，其余引用到的结构体按字母序追加
//! - `bytes` / `string` 直接 keccak；静态值类型按 ABI 就地编码为 32 字节
//! - 结构体字段取 hashStruct，数组取 keccak(元素编码拼接)

use std::collections::{BTreeMap, BTreeSet};

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::account::{keccak256, Address};
use crate::domain::hex_serde;
use crate::error::{EngineError, EngineResult};

const DOMAIN_TYPE: &str = "EIP712Domain";

/// 结构体字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

pub type TypeDefinitions = BTreeMap<String, Vec<TypedField>>;

/// eth_signTypedData_v4 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDataPayload {
    pub types: TypeDefinitions,
    pub primary_type: String,
    pub domain: Value,
    pub message: Value,
}

impl TypedDataPayload {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidTypedData(e.to_string()))
    }

    /// 类型表中缺少 EIP712Domain 时，按 domain 中出现的字段补全
    fn types_with_domain(&self) -> EngineResult<TypeDefinitions> {
        let mut types = self.types.clone();
        if !types.contains_key(DOMAIN_TYPE) {
            types.insert(DOMAIN_TYPE.to_string(), infer_domain_fields(&self.domain)?);
        }
        Ok(types)
    }

    /// hashStruct(EIP712Domain, domain)
    pub fn domain_separator(&self) -> EngineResult<[u8; 32]> {
        let types = self.types_with_domain()?;
        hash_struct(DOMAIN_TYPE, &types, &self.domain)
    }

    /// hashStruct(primaryType, message)
    pub fn message_hash(&self) -> EngineResult<[u8; 32]> {
        let types = self.types_with_domain()?;
        hash_struct(&self.primary_type, &types, &self.message)
    }

    /// 最终签名摘要
    pub fn signing_digest(&self) -> EngineResult<[u8; 32]> {
        let mut buf = Vec::with_capacity(66);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&self.domain_separator()?);
        // primaryType 为 EIP712Domain 时只签 domain
        if self.primary_type != DOMAIN_TYPE {
            buf.extend_from_slice(&self.message_hash()?);
        }
        Ok(keccak256(buf))
    }
}

fn infer_domain_fields(domain: &Value) -> EngineResult<Vec<TypedField>> {
    let obj = domain
        .as_object()
        .ok_or_else(|| EngineError::InvalidTypedData("domain must be an object".into()))?;

    let canonical = [
        ("name", "string"),
        ("version", "string"),
        ("chainId", "uint256"),
        ("verifyingContract", "address"),
        ("salt", "bytes32"),
    ];
    Ok(canonical
        .iter()
        .filter(|(name, _)| obj.get(*name).map(|v| !v.is_null()).unwrap_or(false))
        .map(|(name, kind)| TypedField {
            name: name.to_string(),
            kind: kind.to_string(),
        })
        .collect())
}

/// 去掉数组后缀得到基础类型名：`Person[][3]` → `Person`
fn base_type(kind: &str) -> &str {
    kind.find('[').map(|i| &kind[..i]).unwrap_or(kind)
}

fn collect_dependencies(
    type_name: &str,
    types: &TypeDefinitions,
    found: &mut BTreeSet<String>,
) -> EngineResult<()> {
    let base = base_type(type_name);
    if found.contains(base) {
        return Ok(());
    }
    let Some(fields) = types.get(base) else {
        return Ok(());
    };
    found.insert(base.to_string());
    for field in fields {
        collect_dependencies(&field.kind, types, found)?;
    }
    Ok(())
}

/// encodeType(typeName)
pub fn encode_type(type_name: &str, types: &TypeDefinitions) -> EngineResult<String> {
    if !types.contains_key(type_name) {
        return Err(EngineError::InvalidTypedData(format!(
            "unknown type {}",
            type_name
        )));
    }

    let mut deps = BTreeSet::new();
    collect_dependencies(type_name, types, &mut deps)?;
    deps.remove(type_name);

    let mut out = String::new();
    for name in std::iter::once(type_name).chain(deps.iter().map(String::as_str)) {
        let fields = &types[name];
        let members = fields
            .iter()
            .map(|f| format!("{} {}", f.kind, f.name))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&format!("{}({})", name, members));
    }
    Ok(out)
}

/// typeHash = keccak256(encodeType)
pub fn type_hash(type_name: &str, types: &TypeDefinitions) -> EngineResult<[u8; 32]> {
    Ok(keccak256(encode_type(type_name, types)?))
}

/// hashStruct = keccak256(typeHash ∥ encodeData)
pub fn hash_struct(type_name: &str, types: &TypeDefinitions, value: &Value) -> EngineResult<[u8; 32]> {
    let mut buf = type_hash(type_name, types)?.to_vec();
    buf.extend_from_slice(&encode_data(type_name, types, value)?);
    Ok(keccak256(buf))
}

fn encode_data(type_name: &str, types: &TypeDefinitions, value: &Value) -> EngineResult<Vec<u8>> {
    let fields = types.get(type_name).ok_or_else(|| {
        EngineError::InvalidTypedData(format!("unknown type {}", type_name))
    })?;
    let obj = value.as_object().ok_or_else(|| {
        EngineError::InvalidTypedData(format!("value of {} must be an object", type_name))
    })?;

    let mut out = Vec::with_capacity(32 * fields.len());
    for field in fields {
        let field_value = obj.get(&field.name).ok_or_else(|| {
            EngineError::InvalidTypedData(format!("{}.{} is missing", type_name, field.name))
        })?;
        out.extend_from_slice(&encode_value(&field.kind, types, field_value)?);
    }
    Ok(out)
}

fn encode_value(kind: &str, types: &TypeDefinitions, value: &Value) -> EngineResult<[u8; 32]> {
    // 数组：keccak(concat(encode(e)))
    if let Some(open) = kind.rfind('[') {
        let size = kind[open + 1..].strip_suffix(']').ok_or_else(|| {
            EngineError::InvalidTypedData(format!("malformed array type {}", kind))
        })?;
        let inner = &kind[..open];
        if inner.is_empty() {
            return Err(EngineError::InvalidTypedData(format!(
                "malformed array type {}",
                kind
            )));
        }
        let items = value.as_array().ok_or_else(|| {
            EngineError::InvalidTypedData(format!("{} expects an array", kind))
        })?;
        if !size.is_empty() {
            let expected: usize = size.parse().map_err(|_| {
                EngineError::InvalidTypedData(format!("bad array length in {}", kind))
            })?;
            if items.len() != expected {
                return Err(EngineError::InvalidTypedData(format!(
                    "{} expects {} items, got {}",
                    kind,
                    expected,
                    items.len()
                )));
            }
        }
        let mut buf = Vec::with_capacity(32 * items.len());
        for item in items {
            buf.extend_from_slice(&encode_value(inner, types, item)?);
        }
        return Ok(keccak256(buf));
    }

    if types.contains_key(kind) {
        return hash_struct(kind, types, value);
    }

    match kind {
        "string" => {
            let s = value.as_str().ok_or_else(|| type_error(kind, value))?;
            Ok(keccak256(s.as_bytes()))
        }
        "bytes" => {
            let s = value.as_str().ok_or_else(|| type_error(kind, value))?;
            let bytes = hex_serde::parse(s).map_err(|_| type_error(kind, value))?;
            Ok(keccak256(bytes))
        }
        "bool" => {
            let b = match value {
                Value::Bool(b) => *b,
                Value::String(s) if s == "true" => true,
                Value::String(s) if s == "false" => false,
                _ => return Err(type_error(kind, value)),
            };
            let mut word = [0u8; 32];
            word[31] = b as u8;
            Ok(word)
        }
        "address" => {
            let s = value.as_str().ok_or_else(|| type_error(kind, value))?;
            // DApp 传入的地址大小写不一定符合 EIP-55
            let address: Address = s.to_lowercase().parse()?;
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(address.as_bytes());
            Ok(word)
        }
        _ if kind.starts_with("uint") => {
            let bits = parse_bits(kind, "uint")?;
            let (negative, magnitude) = parse_integer(value).ok_or_else(|| type_error(kind, value))?;
            if negative || magnitude.bits() > bits {
                return Err(EngineError::InvalidTypedData(format!(
                    "{} out of range for {}",
                    value, kind
                )));
            }
            Ok(to_word(magnitude))
        }
        _ if kind.starts_with("int") => {
            let bits = parse_bits(kind, "int")?;
            let (negative, magnitude) = parse_integer(value).ok_or_else(|| type_error(kind, value))?;
            let limit = U256::one() << (bits - 1);
            let in_range = if negative { magnitude <= limit } else { magnitude < limit };
            if !in_range {
                return Err(EngineError::InvalidTypedData(format!(
                    "{} out of range for {}",
                    value, kind
                )));
            }
            let encoded = if negative && !magnitude.is_zero() {
                (!magnitude).overflowing_add(U256::one()).0
            } else {
                magnitude
            };
            Ok(to_word(encoded))
        }
        _ if kind.starts_with("bytes") => {
            let size: usize = kind["bytes".len()..]
                .parse()
                .map_err(|_| EngineError::InvalidTypedData(format!("unknown type {}", kind)))?;
            if !(1..=32).contains(&size) {
                return Err(EngineError::InvalidTypedData(format!("unknown type {}", kind)));
            }
            let s = value.as_str().ok_or_else(|| type_error(kind, value))?;
            let bytes = hex_serde::parse(s).map_err(|_| type_error(kind, value))?;
            if bytes.len() > size {
                return Err(EngineError::InvalidTypedData(format!(
                    "{} longer than {} bytes",
                    s, size
                )));
            }
            let mut word = [0u8; 32];
            word[..bytes.len()].copy_from_slice(&bytes);
            Ok(word)
        }
        _ => Err(EngineError::InvalidTypedData(format!("unknown type {}", kind))),
    }
}

fn parse_bits(kind: &str, prefix: &str) -> EngineResult<usize> {
    let suffix = &kind[prefix.len()..];
    if suffix.is_empty() {
        return Ok(256);
    }
    let bits: usize = suffix
        .parse()
        .map_err(|_| EngineError::InvalidTypedData(format!("unknown type {}", kind)))?;
    if bits == 0 || bits > 256 || bits % 8 != 0 {
        return Err(EngineError::InvalidTypedData(format!("unknown type {}", kind)));
    }
    Ok(bits)
}

/// JSON 数字 / 十进制字符串 / 0x 十六进制字符串 → (是否为负, 绝对值)
fn parse_integer(value: &Value) -> Option<(bool, U256)> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some((false, U256::from(u)))
            } else {
                n.as_i64().map(|i| (i < 0, U256::from(i.unsigned_abs())))
            }
        }
        Value::String(s) => {
            let s = s.trim();
            let (negative, digits) = match s.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, s),
            };
            let magnitude = if let Some(hex_digits) = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
            {
                let bytes = hex_serde::parse(hex_digits).ok()?;
                if bytes.len() > 32 {
                    return None;
                }
                U256::from_big_endian(&bytes)
            } else {
                U256::from_dec_str(digits).ok()?
            };
            Some((negative, magnitude))
        }
        _ => None,
    }
}

fn to_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

fn type_error(kind: &str, value: &Value) -> EngineError {
    EngineError::InvalidTypedData(format!("{} is not a valid {}", value, kind))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn mail_example() -> TypedDataPayload {
        serde_json::from_value(json!({
            "types": {
                "EIP712Domain": [
                    {"name": "name", "type": "string"},
                    {"name": "version", "type": "string"},
                    {"name": "chainId", "type": "uint256"},
                    {"name": "verifyingContract", "type": "address"}
                ],
                "Person": [
                    {"name": "name", "type": "string"},
                    {"name": "wallet", "type": "address"}
                ],
                "Mail": [
                    {"name": "from", "type": "Person"},
                    {"name": "to", "type": "Person"},
                    {"name": "contents", "type": "string"}
                ]
            },
            "primaryType": "Mail",
            "domain": {
                "name": "Ether Mail",
                "version": "1",
                "chainId": 1,
                "verifyingContract": "0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC"
            },
            "message": {
                "from": {"name": "Cow", "wallet": "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826"},
                "to": {"name": "Bob", "wallet": "0xbBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB"},
                "contents": "Hello, Bob!"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_eip712_reference_example() {
        let payload = mail_example();

        assert_eq!(
            encode_type("Mail", &payload.types).unwrap(),
            "Mail(Person from,Person to,string contents)Person(string name,address wallet)"
        );
        assert_eq!(
            hex::encode(type_hash("Mail", &payload.types).unwrap()),
            "a0cedeb2dc280ba39b857546d74f5549c3a1d7bdc2dd96bf881f76108e23dac2"
        );
        assert_eq!(
            hex::encode(payload.domain_separator().unwrap()),
            "f2cee375fa42b42143804025fc449deafd50cc031ca257e0b194a650a912090f"
        );
        assert_eq!(
            hex::encode(payload.message_hash().unwrap()),
            "c52c0ee5d84264471806290a3f2c4cecfc5490626bf912d01f240d7a274b371e"
        );
        assert_eq!(
            hex::encode(payload.signing_digest().unwrap()),
            "be609aee343fb3c4b28e1df9e632fca64fcfaede20f02e86244efddf30957bd2"
        );
    }

    #[test]
    fn test_domain_type_inferred_when_missing() {
        let mut payload = mail_example();
        payload.types.remove("EIP712Domain");
        assert_eq!(
            hex::encode(payload.domain_separator().unwrap()),
            "f2cee375fa42b42143804025fc449deafd50cc031ca257e0b194a650a912090f"
        );
    }

    #[test]
    fn test_encode_type_orders_dependencies_alphabetically() {
        let types: TypeDefinitions = serde_json::from_value(json!({
            "Transaction": [
                {"name": "to", "type": "Person"},
                {"name": "asset", "type": "Asset"},
                {"name": "cc", "type": "Person[]"}
            ],
            "Person": [{"name": "wallet", "type": "address"}],
            "Asset": [{"name": "amount", "type": "uint256"}]
        }))
        .unwrap();
        assert_eq!(
            encode_type("Transaction", &types).unwrap(),
            "Transaction(Person to,Asset asset,Person[] cc)Asset(uint256 amount)Person(address wallet)"
        );
    }

    #[test]
    fn test_arrays_and_static_types() {
        let types: TypeDefinitions = serde_json::from_value(json!({
            "Batch": [
                {"name": "ids", "type": "uint256[]"},
                {"name": "flag", "type": "bool"},
                {"name": "delta", "type": "int8"},
                {"name": "tag", "type": "bytes4"},
                {"name": "blob", "type": "bytes"}
            ]
        }))
        .unwrap();
        let value = json!({
            "ids": [1, "2", "0x03"],
            "flag": true,
            "delta": -1,
            "tag": "0xdeadbeef",
            "blob": "0x0102"
        });

        let hash = hash_struct("Batch", &types, &value).unwrap();

        // 手工拼出预期编码
        let mut ids = Vec::new();
        for i in 1u8..=3 {
            let mut w = [0u8; 32];
            w[31] = i;
            ids.extend_from_slice(&w);
        }
        let mut expected = type_hash("Batch", &types).unwrap().to_vec();
        expected.extend_from_slice(&keccak256(ids));
        let mut flag = [0u8; 32];
        flag[31] = 1;
        expected.extend_from_slice(&flag);
        expected.extend_from_slice(&[0xff; 32]);
        let mut tag = [0u8; 32];
        tag[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        expected.extend_from_slice(&tag);
        expected.extend_from_slice(&keccak256([0x01, 0x02]));

        assert_eq!(hash, keccak256(expected));
    }

    #[test]
    fn test_max_uint256_permit_value() {
        let types: TypeDefinitions = serde_json::from_value(json!({
            "Permit": [{"name": "value", "type": "uint256"}]
        }))
        .unwrap();
        let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        assert!(hash_struct("Permit", &types, &json!({ "value": max })).is_ok());

        let over = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!(hash_struct("Permit", &types, &json!({ "value": over })).is_err());
    }

    #[test]
    fn test_invalid_inputs() {
        let types: TypeDefinitions = serde_json::from_value(json!({
            "T": [
                {"name": "small", "type": "uint8"},
                {"name": "x", "type": "Unknown"}
            ]
        }))
        .unwrap();
        assert!(hash_struct("T", &types, &json!({"small": 256, "x": 1})).is_err());
        assert!(hash_struct("T", &types, &json!({"small": 1})).is_err());
        assert!(encode_type("Missing", &types).is_err());

        // DApp 传来的畸形数组类型只能报错
        for kind in ["uint256[", "uint256[2", "[]", "uint256[x]", "uint256[]]"] {
            let types: TypeDefinitions =
                serde_json::from_value(json!({"T": [{"name": "a", "type": kind}]})).unwrap();
            assert!(
                matches!(
                    hash_struct("T", &types, &json!({"a": [1]})),
                    Err(EngineError::InvalidTypedData(_))
                ),
                "{} accepted",
                kind
            );
        }
    }
}

//! RPC响应校验模块 - 防止链上数据污染
//!
//! 节点返回的 QUANTITY / DATA 一律经过这里解析，长度越界或非 hex 直接拒绝

use ethers::types::U256;
use serde_json::Value;

use crate::domain::hex_serde;
use crate::domain::revert::RevertReason;
use crate::error::{EngineError, EngineResult};

/// 解析 u64 QUANTITY（nonce / gas / 区块号）
pub fn validate_u64(hex_str: &str, field: &str) -> EngineResult<u64> {
    let body = strip_hex_prefix(hex_str, field)?;

    // u64最多16个十六进制字符
    if body.len() > 16 {
        return Err(EngineError::Rpc(format!(
            "{} hex string too long: {}",
            field,
            body.len()
        )));
    }
    if body.is_empty() {
        return Ok(0);
    }

    u64::from_str_radix(body, 16)
        .map_err(|e| EngineError::Rpc(format!("failed to parse {} from hex: {}", field, e)))
}

/// 解析 U256 QUANTITY（wei 金额、gas 价格）
pub fn validate_u256(hex_str: &str, field: &str) -> EngineResult<U256> {
    let body = strip_hex_prefix(hex_str, field)?;

    // 最多32字节 = 64个十六进制字符
    if body.len() > 64 {
        return Err(EngineError::Rpc(format!(
            "{} hex string too long: {}",
            field,
            body.len()
        )));
    }
    if body.is_empty() {
        return Ok(U256::zero());
    }

    U256::from_str_radix(body, 16)
        .map_err(|e| EngineError::Rpc(format!("failed to parse {} from hex: {:?}", field, e)))
}

/// 验证交易哈希格式
pub fn validate_tx_hash(tx_hash: &str) -> EngineResult<[u8; 32]> {
    let hash = strip_hex_prefix(tx_hash, "transaction hash")?;

    if hash.len() != 64 {
        return Err(EngineError::Rpc(format!(
            "invalid transaction hash length: expected 64, got {}",
            hash.len()
        )));
    }

    let bytes = hex::decode(hash)
        .map_err(|e| EngineError::Rpc(format!("invalid transaction hash format: {}", e)))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// 解析 DATA 字段
pub fn validate_data(hex_str: &str, field: &str) -> EngineResult<Vec<u8>> {
    let body = strip_hex_prefix(hex_str, field)?;
    hex_serde::parse(body)
        .map_err(|e| EngineError::Rpc(format!("invalid {} data: {}", field, e)))
}

fn strip_hex_prefix<'a>(s: &'a str, field: &str) -> EngineResult<&'a str> {
    s.strip_prefix("0x")
        .ok_or_else(|| EngineError::Rpc(format!("{} must be 0x-prefixed: {}", field, s)))
}

/// 验证RPC响应格式并取出 result
///
/// error 对象按以下顺序归类：
/// 1. 带 revert data → SimulationReverted(解码后的原因)
/// 2. message 含 "execution reverted" → SimulationReverted(message)
/// 3. 其余按节点消息关键字归类（nonce too low / underpriced / insufficient funds）
pub fn validate_rpc_response(mut json: Value) -> EngineResult<Value> {
    if let Some(version) = json.get("jsonrpc") {
        if version.as_str() != Some("2.0") {
            return Err(EngineError::Rpc(format!(
                "unsupported JSON-RPC version: {}",
                version
            )));
        }
    }

    if let Some(error) = json.get("error") {
        if !error.is_null() {
            return Err(classify_rpc_error(error));
        }
    }

    match json.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(EngineError::Rpc("missing result field in RPC response".into())),
    }
}

/// JSON-RPC error 对象 → EngineError
pub fn classify_rpc_error(error: &Value) -> EngineError {
    let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown RPC error");

    let revert_data = error
        .get("data")
        .and_then(|d| match d {
            Value::String(s) => Some(s.as_str()),
            // 部分节点把 data 包在对象里
            Value::Object(o) => o.get("data").and_then(|v| v.as_str()),
            _ => None,
        })
        .and_then(|s| s.strip_prefix("0x"))
        .and_then(|s| hex_serde::parse(s).ok())
        .filter(|bytes| !bytes.is_empty());

    if let Some(data) = revert_data {
        let reason = RevertReason::decode(&data);
        tracing::debug!(code, %reason, "RPC call reverted");
        return EngineError::SimulationReverted(reason.to_string());
    }

    if message.to_lowercase().contains("execution reverted") {
        let reason = message
            .split_once("execution reverted:")
            .map(|(_, r)| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or(message);
        return EngineError::SimulationReverted(reason.to_string());
    }

    EngineError::from_node_message(message)
}

//! BIP32 / BIP44 派生路径
//!
//! `m/44'/60'/0'/0/5` ↔ `DerivationPath`；支持 `'`、`h`、`H` 三种硬化标记，
//! 并对 EVM 标准路径（purpose 44', coin 60'）做合规检查。

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, EngineResult};

/// 硬化索引偏移量 2^31
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// 路径中的单个层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildNumber {
    pub index: u32,
    pub hardened: bool,
}

impl ChildNumber {
    pub fn normal(index: u32) -> EngineResult<Self> {
        Self::new(index, false)
    }

    pub fn hardened(index: u32) -> EngineResult<Self> {
        Self::new(index, true)
    }

    /// 索引必须小于 2^31，硬化与否由 `hardened` 单独表达
    pub fn new(index: u32, hardened: bool) -> EngineResult<Self> {
        if index >= HARDENED_OFFSET {
            return Err(EngineError::InvalidPath(format!(
                "index {} out of range (must be < 2^31)",
                index
            )));
        }
        Ok(Self { index, hardened })
    }

    /// BIP32 序列化用的 32 位索引（硬化时加 2^31）
    pub fn to_u32(self) -> u32 {
        if self.hardened {
            self.index | HARDENED_OFFSET
        } else {
            self.index
        }
    }
}

impl fmt::Display for ChildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hardened {
            write!(f, "{}'", self.index)
        } else {
            write!(f, "{}", self.index)
        }
    }
}

/// 派生路径（账户创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DerivationPath(Vec<ChildNumber>);

/// 路径合规检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCompliance {
    /// m/44'/60'/account'/change/index
    Standard,
    /// 格式正确但不符合 EVM BIP44 推荐布局
    NonStandard(String),
}

impl DerivationPath {
    pub fn new(children: Vec<ChildNumber>) -> Self {
        Self(children)
    }

    /// m/44'/60'/0'/0/{index}
    pub fn bip44_ethereum(index: u32) -> EngineResult<Self> {
        Ok(Self(vec![
            ChildNumber::hardened(44)?,
            ChildNumber::hardened(60)?,
            ChildNumber::hardened(0)?,
            ChildNumber::normal(0)?,
            ChildNumber::normal(index)?,
        ]))
    }

    pub fn children(&self) -> &[ChildNumber] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// 最后一级替换为 `index`，用于 HD keyring 递增地址
    pub fn with_last_index(&self, index: u32) -> EngineResult<Self> {
        let mut children = self.0.clone();
        match children.last_mut() {
            Some(last) => *last = ChildNumber::new(index, last.hardened)?,
            None => return Err(EngineError::InvalidPath("empty path".into())),
        }
        Ok(Self(children))
    }

    /// 最后一级索引
    pub fn last_index(&self) -> Option<u32> {
        self.0.last().map(|c| c.index)
    }

    /// 检查是否为 EVM BIP44 标准路径
    pub fn compliance(&self) -> PathCompliance {
        let c = &self.0;
        if c.len() != 5 {
            return PathCompliance::NonStandard(format!("expected 5 levels, got {}", c.len()));
        }
        if c[0] != (ChildNumber { index: 44, hardened: true }) {
            return PathCompliance::NonStandard("purpose must be 44'".into());
        }
        if c[1] != (ChildNumber { index: 60, hardened: true }) {
            return PathCompliance::NonStandard(format!("coin type {} is not 60'", c[1]));
        }
        if !c[2].hardened {
            return PathCompliance::NonStandard("account level must be hardened".into());
        }
        if c[3].hardened || c[4].hardened {
            return PathCompliance::NonStandard("change/index levels must not be hardened".into());
        }
        if c[3].index > 1 {
            return PathCompliance::NonStandard("change level must be 0 or 1".into());
        }
        PathCompliance::Standard
    }
}

impl FromStr for DerivationPath {
    type Err = EngineError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let path = path.trim();
        let rest = if path == "m" {
            return Ok(Self::default());
        } else if let Some(rest) = path.strip_prefix("m/") {
            rest
        } else {
            return Err(EngineError::InvalidPath(format!(
                "path must start with 'm/': {}",
                path
            )));
        };

        let mut children = Vec::new();
        for component in rest.split('/') {
            let (digits, hardened) = match component
                .strip_suffix('\'')
                .or_else(|| component.strip_suffix('h'))
                .or_else(|| component.strip_suffix('H'))
            {
                Some(d) => (d, true),
                None => (component, false),
            };

            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(EngineError::InvalidPath(format!(
                    "invalid component '{}' in {}",
                    component, path
                )));
            }

            let index: u32 = digits.parse().map_err(|_| {
                EngineError::InvalidPath(format!("index overflow in component '{}'", component))
            })?;
            children.push(ChildNumber::new(index, hardened)?);
        }

        Ok(Self(children))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for child in &self.0 {
            write!(f, "/{}", child)?;
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_ethereum_path() {
        let path: DerivationPath = "m/44'/60'/0'/0/5".parse().unwrap();
        assert_eq!(path.depth(), 5);
        assert_eq!(path.to_string(), "m/44'/60'/0'/0/5");
        assert_eq!(path.compliance(), PathCompliance::Standard);
        assert_eq!(path, DerivationPath::bip44_ethereum(5).unwrap());
    }

    #[test]
    fn test_alternative_hardened_markers() {
        let a: DerivationPath = "m/44h/60H/0'/0/0".parse().unwrap();
        let b: DerivationPath = "m/44'/60'/0'/0/0".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.children()[0].to_u32(), 44 | HARDENED_OFFSET);
    }

    #[test]
    fn test_rejects_malformed_paths() {
        assert!("44'/60'/0'/0/0".parse::<DerivationPath>().is_err());
        assert!("m/44'/x/0".parse::<DerivationPath>().is_err());
        assert!("m/44'//0".parse::<DerivationPath>().is_err());
        assert!("m/2147483648".parse::<DerivationPath>().is_err());
        assert!("m/99999999999".parse::<DerivationPath>().is_err());
    }

    #[test]
    fn test_non_standard_paths_are_flagged() {
        let ledger_live: DerivationPath = "m/44'/60'/3'/0/0".parse().unwrap();
        assert_eq!(ledger_live.compliance(), PathCompliance::Standard);

        let btc: DerivationPath = "m/84'/0'/0'/0/0".parse().unwrap();
        assert!(matches!(btc.compliance(), PathCompliance::NonStandard(_)));

        let legacy_mew: DerivationPath = "m/44'/60'/0'/0".parse().unwrap();
        assert!(matches!(legacy_mew.compliance(), PathCompliance::NonStandard(_)));
    }

    #[test]
    fn test_with_last_index() {
        let path = DerivationPath::bip44_ethereum(0).unwrap();
        let next = path.with_last_index(3).unwrap();
        assert_eq!(next.to_string(), "m/44'/60'/0'/0/3");
        assert_eq!(next.last_index(), Some(3));
        assert!(DerivationPath::default().with_last_index(1).is_err());
    }
}

//! 签名前安全决策
//!
//! 本模块不评估具体规则（合约信誉、钓鱼名单等由外部规则源提供），
//! 只负责合并各规则源的结论并在签名前把关：
//! `forbidden > danger > warning > pass`，取最严重者

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::account::Address;
use crate::domain::transaction::UnsignedTransaction;
use crate::domain::typed_data::TypedDataPayload;
use crate::error::{EngineError, EngineResult};

/// 风险等级（派生顺序即严重程度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 直接放行
    #[default]
    Pass,
    /// 需要用户确认
    Warning,
    /// 需要用户确认（醒目提示）
    Danger,
    /// 禁止签名
    Forbidden,
}

/// 单条规则结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFinding {
    pub rule_id: String,
    /// 规则来源（如 phishing-list、contract-reputation）
    pub source: String,
    pub severity: Severity,
    pub message: String,
}

impl RuleFinding {
    pub fn new(
        rule_id: impl Into<String>,
        source: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            source: source.into(),
            severity,
            message: message.into(),
        }
    }
}

/// 合并后的决策
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDecision {
    pub level: Severity,
    /// 非 pass 的结论，最严重的在前
    pub findings: Vec<RuleFinding>,
}

impl SecurityDecision {
    pub fn pass() -> Self {
        Self {
            level: Severity::Pass,
            findings: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.level == Severity::Forbidden
    }

    pub fn requires_acknowledgement(&self) -> bool {
        matches!(self.level, Severity::Warning | Severity::Danger)
    }

    /// 给用户展示的汇总
    pub fn summary(&self) -> String {
        self.findings
            .iter()
            .filter(|f| f.severity == self.level)
            .map(|f| format!("[{}] {}", f.rule_id, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 待签名的请求，交给规则源评估
#[derive(Debug, Clone, Copy)]
pub enum SigningRequest<'a> {
    Transaction {
        from: &'a Address,
        tx: &'a UnsignedTransaction,
        origin: Option<&'a str>,
    },
    TypedData {
        address: &'a Address,
        payload: &'a TypedDataPayload,
        origin: Option<&'a str>,
    },
    PersonalMessage {
        address: &'a Address,
        message: &'a [u8],
        origin: Option<&'a str>,
    },
}

/// 外部规则源
#[async_trait]
pub trait RuleSource: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, request: &SigningRequest<'_>) -> EngineResult<Vec<RuleFinding>>;
}

#[derive(Default)]
pub struct SecurityDecisionAggregator {
    sources: Vec<Arc<dyn RuleSource>>,
}

impl SecurityDecisionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn RuleSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// 合并结论：取最严重等级，空列表为 pass
    pub fn aggregate(findings: Vec<RuleFinding>) -> SecurityDecision {
        let mut findings: Vec<RuleFinding> = findings
            .into_iter()
            .filter(|f| f.severity != Severity::Pass)
            .collect();
        // 稳定排序，同级保持规则源给出的顺序
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));

        let level = findings
            .first()
            .map(|f| f.severity)
            .unwrap_or(Severity::Pass);
        SecurityDecision { level, findings }
    }

    /// 询问所有规则源并合并
    ///
    /// 规则源不可用时记一条 warning，交由用户确认
    pub async fn evaluate(&self, request: &SigningRequest<'_>) -> SecurityDecision {
        let mut findings = Vec::new();
        for source in &self.sources {
            match source.evaluate(request).await {
                Ok(mut found) => findings.append(&mut found),
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "rule source unavailable");
                    findings.push(RuleFinding::new(
                        "source_unavailable",
                        source.name(),
                        Severity::Warning,
                        format!("security check unavailable: {}", e),
                    ));
                }
            }
        }
        let decision = Self::aggregate(findings);
        if decision.level != Severity::Pass {
            tracing::info!(
                level = ?decision.level,
                findings = decision.findings.len(),
                "security decision"
            );
        }
        decision
    }

    /// 签名前的闸门
    pub fn gate(decision: &SecurityDecision, acknowledged: bool) -> EngineResult<()> {
        match decision.level {
            Severity::Forbidden => Err(EngineError::SecurityForbidden(decision.summary())),
            Severity::Danger | Severity::Warning if !acknowledged => {
                Err(EngineError::AcknowledgementRequired(decision.summary()))
            }
            _ => Ok(()),
        }
    }
}

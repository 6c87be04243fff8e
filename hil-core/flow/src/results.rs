//! 标签判定与运行结果汇总
//!
//! - [`TagEvaluator`]: 判定单个标签值是否通过
//! - [`TagRuleTable`]: 从 YAML 加载的标签规则表 (比较运算符 + 期望值/上下限)
//! - [`ResultsAccumulator`]: 接收每次完成运行的报告 (报告格式与存储由实现决定)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;

use crate::sequence::TestId;
use crate::sequencer::SequenceOutcome;
use crate::step::TestError;
use crate::tag::{Tag, TagValue};
use crate::{FlowError, Result};

/// 标签判定器
pub trait TagEvaluator: Send + Sync {
    /// 返回标签值是否通过
    fn evaluate(&self, tag: &Tag, value: &TagValue) -> Result<bool>;
}

/// 按真值判定 (默认判定器)
#[derive(Debug, Clone, Copy, Default)]
pub struct TruthyEvaluator;

impl TagEvaluator for TruthyEvaluator {
    fn evaluate(&self, _tag: &Tag, value: &TagValue) -> Result<bool> {
        Ok(value.is_truthy())
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComparisonOperator {
    /// 等于
    Eq,
    /// lower <= v <= upper
    Gele,
    /// lower < v < upper
    Gtlt,
    /// v > lower
    Gt,
    /// v < upper
    Lt,
    /// v >= lower
    Ge,
    /// v <= upper
    Le,
    /// 只记录，不比较
    Log,
}

impl FromStr for ComparisonOperator {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "eq" => Ok(Self::Eq),
            "gele" => Ok(Self::Gele),
            "gtlt" => Ok(Self::Gtlt),
            "gt" => Ok(Self::Gt),
            "lt" => Ok(Self::Lt),
            "ge" => Ok(Self::Ge),
            "le" => Ok(Self::Le),
            "log" => Ok(Self::Log),
            other => Err(FlowError::TagRule(format!("未知比较运算符: {}", other))),
        }
    }
}

impl TryFrom<String> for ComparisonOperator {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ComparisonOperator> for String {
    fn from(op: ComparisonOperator) -> Self {
        op.to_string()
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Gele => "gele",
            Self::Gtlt => "gtlt",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::Log => "log",
        };
        f.write_str(s)
    }
}

/// 单个标签的判定规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRule {
    #[serde(default)]
    pub description: String,

    #[serde(rename = "compOp")]
    pub comp_op: ComparisonOperator,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<TagValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<TagValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<TagValue>,

    #[serde(default)]
    pub unit: String,
}

impl TagRule {
    /// 判定值是否满足规则
    pub fn is_passing(&self, value: &TagValue) -> Result<bool> {
        if self.comp_op == ComparisonOperator::Log {
            return Ok(true);
        }

        match value {
            TagValue::Bool(v) => {
                self.require_eq("bool")?;
                match &self.expected_value {
                    Some(TagValue::Bool(expected)) => Ok(v == expected),
                    _ => Err(FlowError::TagRule(
                        "布尔比较要求 expectedValue 为布尔值".to_string(),
                    )),
                }
            }
            TagValue::Text(v) => {
                self.require_eq("string")?;
                match &self.expected_value {
                    Some(TagValue::Text(expected)) => Ok(v == expected),
                    _ => Err(FlowError::TagRule(
                        "字符串比较要求 expectedValue 为字符串".to_string(),
                    )),
                }
            }
            TagValue::Int(_) | TagValue::Float(_) => self.is_passing_numeric(value),
        }
    }

    fn require_eq(&self, kind: &str) -> Result<()> {
        if self.comp_op != ComparisonOperator::Eq {
            return Err(FlowError::TagRule(format!("{} 类型只支持 eq 比较", kind)));
        }
        Ok(())
    }

    fn is_passing_numeric(&self, value: &TagValue) -> Result<bool> {
        let v = numeric(Some(value), "value")?;
        let lower = || numeric(self.lower_limit.as_ref(), "lowerLimit");
        let upper = || numeric(self.upper_limit.as_ref(), "upperLimit");

        let passed = match self.comp_op {
            ComparisonOperator::Eq => v == numeric(self.expected_value.as_ref(), "expectedValue")?,
            ComparisonOperator::Gele => v >= lower()? && v <= upper()?,
            ComparisonOperator::Gtlt => v > lower()? && v < upper()?,
            ComparisonOperator::Gt => v > lower()?,
            ComparisonOperator::Ge => v >= lower()?,
            ComparisonOperator::Lt => v < upper()?,
            ComparisonOperator::Le => v <= upper()?,
            ComparisonOperator::Log => true,
        };
        Ok(passed)
    }
}

fn numeric(value: Option<&TagValue>, field: &str) -> Result<f64> {
    match value {
        Some(TagValue::Int(v)) => Ok(*v as f64),
        Some(TagValue::Float(v)) => Ok(*v),
        Some(other) => Err(FlowError::TagRule(format!(
            "{} 类型不匹配: 期望数值，实际为 {}",
            field,
            other.kind()
        ))),
        None => Err(FlowError::TagRule(format!("缺少 {}", field))),
    }
}

/// 标签规则表
#[derive(Debug, Clone, Default)]
pub struct TagRuleTable {
    rules: HashMap<String, TagRule>,
}

impl TagRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag_id: &str, rule: TagRule) {
        self.rules.insert(tag_id.to_string(), rule);
    }

    pub fn get(&self, tag_id: &str) -> Option<&TagRule> {
        self.rules.get(tag_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 从 YAML 字符串加载 (顶层为 标签ID -> 规则 的映射)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: HashMap<String, TagRule> =
            serde_yaml::from_str(yaml).map_err(|e| FlowError::SerdeError(e.to_string()))?;
        Ok(Self { rules })
    }

    /// 从 YAML 文件加载
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

impl TagEvaluator for TagRuleTable {
    fn evaluate(&self, tag: &Tag, value: &TagValue) -> Result<bool> {
        let rule = self
            .rules
            .get(&tag.id)
            .ok_or_else(|| FlowError::UnknownTag(tag.id.clone()))?;
        rule.is_passing(value)
    }
}

/// 标签提交记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tag: Tag,
    pub value: TagValue,
    pub passing: bool,
}

/// 一次完成运行的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub test_id: TestId,
    pub sequence_name: String,
    pub metadata: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub is_passing: bool,
    pub cancelled: bool,
    pub fatal: Option<String>,
    pub step_passed: Vec<bool>,
    pub tags: Vec<TagRecord>,
    pub failed_tags: Vec<Tag>,
    pub errors: Vec<TestError>,
}

impl RunReport {
    pub fn from_outcome(
        test_id: TestId,
        sequence_name: &str,
        metadata: &HashMap<String, String>,
        started_at: DateTime<Utc>,
        outcome: &SequenceOutcome,
    ) -> Self {
        let tags = outcome
            .tag_values
            .iter()
            .map(|(tag, value)| TagRecord {
                tag: tag.clone(),
                value: value.clone(),
                passing: !outcome.failed_tags.contains(tag),
            })
            .collect();

        Self {
            test_id,
            sequence_name: sequence_name.to_string(),
            metadata: metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            started_at,
            duration_ms: outcome.total_duration().as_millis() as u64,
            is_passing: outcome.is_passing(),
            cancelled: outcome.cancelled,
            fatal: outcome.fatal.clone(),
            step_passed: outcome.step_passed.clone(),
            tags,
            failed_tags: outcome.failed_tags.clone(),
            errors: outcome.errors.clone(),
        }
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// 结果汇总器
#[async_trait]
pub trait ResultsAccumulator: Send + Sync {
    /// 记录一次完成 (或取消) 的运行
    async fn record_run(&self, report: &RunReport) -> anyhow::Result<()>;
}

/// 内存历史记录，最新的运行排在最前
#[derive(Debug, Default)]
pub struct MemoryAccumulator {
    history: RwLock<Vec<RunReport>>,
}

impl MemoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history(&self) -> Vec<RunReport> {
        self.history.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn find(&self, test_id: TestId) -> Option<RunReport> {
        self.history
            .read()
            .await
            .iter()
            .find(|r| r.test_id == test_id)
            .cloned()
    }
}

#[async_trait]
impl ResultsAccumulator for MemoryAccumulator {
    async fn record_run(&self, report: &RunReport) -> anyhow::Result<()> {
        self.history.write().await.insert(0, report.clone());
        Ok(())
    }
}

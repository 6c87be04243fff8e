//! 测试标签

use serde::{Deserialize, Serialize};
use std::fmt;

/// 测试标签
///
/// 标签是步骤可以断言的一个具名事实 (例如 "前控制器已刷写")。
/// 标签预先声明，不可变，可以被多个步骤共享。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    /// 标签 ID
    pub id: String,

    /// 标签描述
    pub description: String,
}

impl Tag {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.description)
    }
}

/// 步骤上报的标签值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// 按真值判定: false、0、NaN 和空字符串视为失败
    pub fn is_truthy(&self) -> bool {
        match self {
            TagValue::Bool(v) => *v,
            TagValue::Int(v) => *v != 0,
            TagValue::Float(v) => *v != 0.0 && !v.is_nan(),
            TagValue::Text(v) => !v.is_empty(),
        }
    }

    /// 值类型名称 (用于错误信息)
    pub fn kind(&self) -> &'static str {
        match self {
            TagValue::Bool(_) => "bool",
            TagValue::Int(_) => "int",
            TagValue::Float(_) => "float",
            TagValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::Int(v) => write!(f, "{}", v),
            TagValue::Float(v) => write!(f, "{}", v),
            TagValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Text(v)
    }
}

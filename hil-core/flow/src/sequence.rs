//! 测试序列与序列目录

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::step::Step;
use crate::{FlowError, Result};

/// 测试运行 ID，在运行请求被创建时生成
pub type TestId = Uuid;

/// 测试序列 - 按声明顺序执行的一组步骤
pub struct Sequence {
    /// 序列名称
    pub name: String,

    /// 序列描述
    pub description: String,

    /// 步骤列表
    pub steps: Vec<Box<dyn Step>>,
}

impl Sequence {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            steps: Vec::new(),
        }
    }

    /// 追加一个步骤
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("description", &self.description)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

type SequenceBuilder = Arc<dyn Fn() -> Sequence + Send + Sync>;

/// 目录条目摘要
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub step_count: usize,
}

/// 序列目录
///
/// 保存序列构造函数而不是序列实例，每次运行都构造新的步骤实例，
/// 避免上一次运行的步骤状态泄漏到下一次。
#[derive(Clone, Default)]
pub struct SequenceCatalog {
    entries: Vec<(String, SequenceBuilder)>,
}

impl SequenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册序列构造函数，名称取自构造出的序列
    pub fn register<F>(&mut self, builder: F) -> Result<()>
    where
        F: Fn() -> Sequence + Send + Sync + 'static,
    {
        let name = builder().name;
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(FlowError::DuplicateSequence(name));
        }
        self.entries.push((name, Arc::new(builder)));
        Ok(())
    }

    /// 构造指定名称的新序列实例
    pub fn instantiate(&self, name: &str) -> Result<Sequence> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, builder)| builder())
            .ok_or_else(|| FlowError::SequenceNotFound(name.to_string()))
    }

    /// 按注册顺序列出所有序列
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.entries
            .iter()
            .map(|(_, builder)| {
                let seq = builder();
                CatalogEntry {
                    name: seq.name,
                    description: seq.description,
                    step_count: seq.steps.len(),
                }
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

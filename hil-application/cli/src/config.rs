//! CLI 配置管理
//!
//! 配置文件查找顺序：
//! 1. `--config` 指定的路径
//! 2. 环境变量 `HIL_CONFIG`
//! 3. `./hil.toml`
//! 4. `~/.config/hil/config.toml`
//! 5. `/etc/hil/config.toml`
//!
//! 找不到配置文件时使用默认值。加载后再用 `HIL_*` 环境变量覆盖。

use anyhow::{Context, Result};
use hil_orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// HIL 配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HilConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub results: ResultsConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// 结果判定配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// 标签规则表 (YAML)，未设置时按真值判定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags_file: Option<PathBuf>,
}

impl HilConfig {
    /// 用户配置文件路径
    pub fn user_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("无法获取用户主目录")?;
        Ok(home.join(".config").join("hil").join("config.toml"))
    }

    /// 加载配置，返回配置及其来源文件
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let source = Self::find_config_file(explicit)?;

        let mut config = match &source {
            Some(path) => {
                tracing::debug!("加载配置文件: {:?}", path);
                Self::load_from_file(path)?
            }
            None => {
                tracing::debug!("未找到配置文件，使用默认配置");
                Self::default()
            }
        };

        config.apply_env_vars()?;
        config.validate()?;

        Ok((config, source))
    }

    /// 从 TOML 文件加载
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 查找配置文件
    pub fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("配置文件不存在: {:?}", path);
            }
            return Ok(Some(path.to_path_buf()));
        }

        if let Ok(path) = env::var("HIL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            tracing::warn!("HIL_CONFIG 指向的文件不存在: {:?}", path);
        }

        let mut candidates = vec![PathBuf::from("hil.toml")];
        if let Ok(path) = Self::user_config_path() {
            candidates.push(path);
        }
        candidates.push(PathBuf::from("/etc/hil/config.toml"));

        Ok(candidates.into_iter().find(|p| p.exists()))
    }

    /// 从环境变量覆盖
    pub fn apply_env_vars(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// 按给定的查找函数覆盖配置项
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("HIL_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(value) = lookup("HIL_MAX_QUEUE_LENGTH") {
            self.orchestrator.max_queue_length = value
                .parse::<usize>()
                .map(Some)
                .with_context(|| format!("HIL_MAX_QUEUE_LENGTH 不是有效数字: {}", value))?;
        }

        if let Some(value) = lookup("HIL_SHUTDOWN_TIMEOUT") {
            self.orchestrator.shutdown_timeout_secs = value
                .parse()
                .with_context(|| format!("HIL_SHUTDOWN_TIMEOUT 不是有效数字: {}", value))?;
        }

        if let Some(path) = lookup("HIL_TAGS_FILE") {
            self.results.tags_file = Some(PathBuf::from(path));
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        self.orchestrator
            .validate()
            .context("orchestrator 配置无效")?;

        if let Some(path) = &self.results.tags_file {
            if path.as_os_str().is_empty() {
                anyhow::bail!("results.tags_file 不能为空");
            }
        }

        Ok(())
    }

    /// 保存配置
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置失败")
    }
}

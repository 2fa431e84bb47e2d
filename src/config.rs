//! 配置
//!
//! 配置文件为 TOML。组件持有 `ConfigHandle`，每次调用时读取最新快照，
//! 因此运行中修改服务地址或模型会在下一个阶段生效。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::book::BookCategory;
use crate::error::{PipelineError, PipelineResult};

/// 生成服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    /// 支持 `{env:VAR}` 形式，加载时解析
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            timeout_secs: 300,
        }
    }
}

/// 分析流程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub book_category: BookCategory,
    /// 流式输出推送给观察者的最小间隔（毫秒）
    pub stream_interval_ms: u64,
    /// 是否使用流式生成
    pub stream: bool,
    /// 思维导图模式下是否生成关联箭头
    pub generate_mindmap_arrows: bool,
    /// 输出语言，如 "中文"、"English"
    pub output_language: Option<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            book_category: BookCategory::Fiction,
            stream_interval_ms: 1000,
            stream: true,
            generate_mindmap_arrows: true,
            output_language: None,
        }
    }
}

impl AnalysisSettings {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// 数据库路径，未配置时使用系统数据目录
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("deep-reader-analysis")
                .join("artifacts.db")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub provider: ProviderSettings,
    pub analysis: AnalysisSettings,
    pub storage: StorageSettings,
}

impl AnalysisConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deep-reader-analysis")
            .join("config.toml")
    }

    /// 从文件加载配置；文件不存在时返回默认配置
    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "配置文件不存在，使用默认配置");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("读取配置文件失败: {}", e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> PipelineResult<Self> {
        let mut config: AnalysisConfig = toml::from_str(text)
            .map_err(|e| PipelineError::Config(format!("配置文件格式错误: {}", e)))?;
        config.provider.api_key = match config.provider.api_key.take() {
            Some(raw) => Some(resolve_secret(&raw)?),
            None => None,
        };
        Ok(config)
    }
}

/// 解析 `{env:VAR}` 引用
fn resolve_secret(raw: &str) -> PipelineResult<String> {
    match raw
        .strip_prefix("{env:")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(var) => std::env::var(var)
            .map_err(|_| PipelineError::Config(format!("环境变量 {} 未设置", var))),
        None => Ok(raw.to_string()),
    }
}

/// 配置访问句柄
///
/// 可克隆、可跨任务共享；`snapshot()` 返回调用时刻的配置
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<AnalysisConfig>>,
}

impl ConfigHandle {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> AnalysisConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 修改配置，后续阶段立即使用新值
    pub fn update<F: FnOnce(&mut AnalysisConfig)>(&self, f: F) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

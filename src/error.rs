use thiserror::Error;

use crate::cache::keys::ArtifactKind;

/// 存储层错误
///
/// 持久化层的 I/O 失败。读取时降级为缓存未命中，写入时仅记录日志。
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("后台任务失败: {0}")]
    Join(String),
    #[error("锁定存储失败: {0}")]
    Lock(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Join(e.to_string())
    }
}

/// 流水线错误
///
/// `Cancelled` 不是失败：它只表示用户中止，阶段不会写入缓存，也不应作为错误展示给用户。
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 非 2xx 响应或网络失败
    #[error("请求生成服务失败: {0}")]
    Transport(String),
    /// 空文本，或结构化结果无法解析
    #[error("生成结果无效 ({kind}): {reason}")]
    MalformedOutput { kind: ArtifactKind, reason: String },
    #[error("操作已取消")]
    Cancelled,
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    #[error("配置错误: {0}")]
    Config(String),
    #[error("读取章节失败: {0}")]
    Source(String),
}

impl PipelineError {
    pub fn malformed(kind: ArtifactKind, reason: impl Into<String>) -> Self {
        PipelineError::MalformedOutput {
            kind,
            reason: reason.into(),
        }
    }

    /// 是否为取消信号（而非失败）
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// 失败后重新运行是否可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_)
                | PipelineError::MalformedOutput { .. }
                | PipelineError::Store(_)
        )
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transport(e.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

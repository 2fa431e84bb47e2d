//! 生成服务
//!
//! 流水线通过 `GenerationProvider` 调用外部文本生成服务。
//! 取消由调用方负责：丢弃进行中的 future 即中止 HTTP 请求。

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::cache::keys::ArtifactKind;
use crate::error::PipelineResult;

pub mod extract;
pub mod openai;

pub use extract::{extract_json, extract_mindmap};
pub use openai::OpenAiCompatibleProvider;

/// 流式分片
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationChunk {
    pub content_delta: String,
    pub reasoning_delta: String,
}

impl GenerationChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_delta: text.into(),
            reasoning_delta: String::new(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            content_delta: String::new(),
            reasoning_delta: text.into(),
        }
    }
}

pub type ChunkStream = BoxStream<'static, PipelineResult<GenerationChunk>>;

/// 生成请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// 该请求服务的产物类型（用于日志和测试）
    pub kind: ArtifactKind,
    pub system: String,
    pub user: String,
}

/// 一次生成的结果：完整文本，或尚未消费的分片流
pub enum Generation {
    Complete(String),
    Stream(ChunkStream),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 生成服务 trait
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 非流式生成
    async fn generate(&self, request: &GenerationRequest) -> PipelineResult<String>;

    /// 流式生成；连接建立失败时直接返回错误
    async fn generate_stream(&self, request: &GenerationRequest) -> PipelineResult<ChunkStream>;

    fn supports_streaming(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

/// 按服务能力选择流式或非流式调用
pub async fn invoke(
    provider: &dyn GenerationProvider,
    request: &GenerationRequest,
    stream: bool,
) -> PipelineResult<Generation> {
    if stream && provider.supports_streaming() {
        Ok(Generation::Stream(provider.generate_stream(request).await?))
    } else {
        Ok(Generation::Complete(provider.generate(request).await?))
    }
}

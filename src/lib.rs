//! Deep Reader 分析流水线
//!
//! 把已经切分好的章节交给外部文本生成服务，产出章节摘要、章节关联、
//! 人物关系和思维导图。所有产物按 (书籍, 类型, 章节/分组) 缓存，
//! 运行可以中断、重试，重复运行只会生成缺失的部分。

pub mod book;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod grouping;
pub mod pipeline;
pub mod prompts;
pub mod source;
pub mod stage;
pub mod store;

#[cfg(test)]
mod test_support;

pub use book::{BookCategory, BookIdentity, Chapter};
pub use cache::{ArtifactKey, ArtifactKind, ArtifactValue, BookPreferences, CacheManager};
pub use config::{AnalysisConfig, ConfigHandle};
pub use error::{PipelineError, PipelineResult, StoreError};
pub use generation::{GenerationProvider, OpenAiCompatibleProvider};
pub use grouping::{group_chapters, ChapterGroup, TagAssignment};
pub use pipeline::{
    Orchestrator, PipelineObserver, PipelineOutput, PipelineRequest, PipelineState, ProcessingMode, RunHandle,
    RunOutcome,
};
pub use store::{ArtifactStore, MemoryArtifactStore, SqliteArtifactStore};

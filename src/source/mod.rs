//! 章节来源
//!
//! 把源文件转换为章节列表。同一文件重复提取时章节 id 保持不变，
//! 这样以章节/分组为键的缓存在不同会话之间仍然有效。

use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::book::Chapter;
use crate::error::{PipelineError, PipelineResult};

pub mod detector;
pub mod text;

pub use text::TextChapterSource;

/// 章节来源 trait
pub trait ChapterSource: Send + Sync {
    /// 提取章节
    ///
    /// # 参数
    /// - `path`: 源文件路径
    ///
    /// # 返回
    /// 按书中顺序排列的章节
    fn extract_chapters(&self, path: &Path) -> PipelineResult<Vec<Chapter>>;

    fn supported_extensions(&self) -> &'static [&'static str];
}

/// 章节 id：`ch-{序号}-{标题 SHA256 前 8 位}`
pub fn chapter_id(index: usize, title: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(title.as_bytes()));
    format!("ch-{}-{}", index, &hash[..8])
}

/// JSON 章节来源
///
/// 读取外部解析器导出的章节数组：`[{"id": "...", "title": "...", "content": "...", "tag": "..."}]`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonChapterSource;

impl ChapterSource for JsonChapterSource {
    fn extract_chapters(&self, path: &Path) -> PipelineResult<Vec<Chapter>> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::Source(format!("读取文件失败 {}: {}", path.display(), e)))?;
        let chapters: Vec<Chapter> = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Source(format!("章节 JSON 格式错误: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        if let Some(duplicate) = chapters.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(PipelineError::Source(format!("章节 id 重复: {}", duplicate.id)));
        }
        Ok(chapters)
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["json"]
    }
}

/// 按扩展名选择章节来源；未知扩展名按纯文本处理
pub fn source_for_path(path: &Path) -> Box<dyn ChapterSource> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if JsonChapterSource.supported_extensions().contains(&extension.as_str()) {
        Box::new(JsonChapterSource)
    } else {
        Box::new(TextChapterSource::new())
    }
}

use encoding_rs::{Encoding, GBK, UTF_8};
use std::fs;
use std::path::Path;

use super::detector::ChapterDetector;
use super::{chapter_id, ChapterSource};
use crate::book::Chapter;
use crate::error::{PipelineError, PipelineResult};

/// 纯文本章节来源
///
/// 自动检测编码（BOM、UTF-8、GBK），按空行分段后识别章节
#[derive(Debug, Clone, Default)]
pub struct TextChapterSource {
    detector: ChapterDetector,
}

impl TextChapterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检测文件编码
    ///
    /// # 参数
    /// - `bytes`: 文件字节数据
    ///
    /// # 返回
    /// 检测到的编码，无法判断时为 UTF-8
    fn detect_encoding(&self, bytes: &[u8]) -> &'static Encoding {
        if let Some((encoding, _bom_length)) = Encoding::for_bom(bytes) {
            return encoding;
        }
        if std::str::from_utf8(bytes).is_ok() {
            return UTF_8;
        }
        if self.looks_like_gbk(bytes) {
            return GBK;
        }
        UTF_8
    }

    /// 超过一半的非 ASCII 字节对符合 GBK 规则（首字节 0x81-0xFE，次字节 0x40-0xFE）
    fn looks_like_gbk(&self, bytes: &[u8]) -> bool {
        let mut gbk_pairs = 0;
        let mut total_pairs = 0;

        let mut i = 0;
        while i < bytes.len().saturating_sub(1) {
            let (b1, b2) = (bytes[i], bytes[i + 1]);
            if b1 < 0x80 {
                i += 1;
                continue;
            }

            total_pairs += 1;
            if (0x81..=0xFE).contains(&b1) && (0x40..=0xFE).contains(&b2) {
                gbk_pairs += 1;
                i += 2;
            } else {
                i += 1;
            }
        }

        total_pairs > 0 && (gbk_pairs as f32 / total_pairs as f32) > 0.5
    }

    /// 按空行分段，段内换行保留
    fn split_into_paragraphs(&self, content: &str) -> Vec<String> {
        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if !current.is_empty() {
                    paragraphs.push(current.join("\n"));
                    current.clear();
                }
            } else {
                current.push(trimmed);
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join("\n"));
        }

        paragraphs
    }

    /// 从已解码的文本中提取章节
    pub fn chapters_from_text(&self, content: &str) -> Vec<Chapter> {
        let paragraphs = self.split_into_paragraphs(content);
        self.detector
            .detect(&paragraphs)
            .into_iter()
            .enumerate()
            .map(|(index, detected)| {
                Chapter::new(
                    chapter_id(index, &detected.title),
                    detected.title,
                    detected.paragraphs.join("\n\n"),
                )
            })
            .collect()
    }
}

impl ChapterSource for TextChapterSource {
    fn extract_chapters(&self, path: &Path) -> PipelineResult<Vec<Chapter>> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::Source(format!("读取文件失败 {}: {}", path.display(), e)))?;

        let encoding = self.detect_encoding(&bytes);
        let (content, _encoding_used, had_errors) = encoding.decode(&bytes);
        if had_errors {
            tracing::warn!(path = %path.display(), encoding = encoding.name(), "文件解码时出现错误，可能存在乱码");
        }

        let chapters = self.chapters_from_text(&content);
        tracing::debug!(path = %path.display(), chapters = chapters.len(), "已提取章节");
        Ok(chapters)
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["txt", "md"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_detect_encoding() {
        let source = TextChapterSource::new();
        assert_eq!(source.detect_encoding("测试文本".as_bytes()), UTF_8);
        assert_eq!(source.detect_encoding(b"Hello World"), UTF_8);

        // GBK 编码的 "测试"
        assert_eq!(source.detect_encoding(&[0xB2, 0xE2, 0xCA, 0xD4]), GBK);
    }

    #[test]
    fn test_looks_like_gbk() {
        let source = TextChapterSource::new();
        assert!(source.looks_like_gbk(&[0xB2, 0xE2, 0xCA, 0xD4]));
        assert!(!source.looks_like_gbk(b"This is a test"));
    }

    #[test]
    fn test_split_into_paragraphs() {
        let source = TextChapterSource::new();
        let paragraphs = source.split_into_paragraphs("第一段。\n第二行。\n\n\n\n第二段。\n   \n");

        assert_eq!(paragraphs, vec!["第一段。\n第二行。".to_string(), "第二段。".to_string()]);
        assert!(source.split_into_paragraphs("   \n\n   ").is_empty());
    }

    #[test]
    fn test_chapter_ids_are_stable() {
        let source = TextChapterSource::new();
        let text = "第一章 开端\n\n正文一\n\n第二章 发展\n\n正文二";

        let first = source.chapters_from_text(text);
        let second = source.chapters_from_text(text);

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].title, "第一章 开端");
        assert_eq!(first[1].content, "正文二");
        assert!(first[0].id.starts_with("ch-0-"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_extract_gbk_file() {
        let (encoded, _, _) = GBK.encode("第一章 开端\n\n正文");
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&encoded).unwrap();

        let chapters = TextChapterSource::new().extract_chapters(file.path()).unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "第一章 开端");
        assert_eq!(chapters[0].content, "正文");
    }

    #[test]
    fn test_missing_file() {
        let err = TextChapterSource::new()
            .extract_chapters(Path::new("/nonexistent/book.txt"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
    }
}

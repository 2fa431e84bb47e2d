use regex::Regex;
use std::sync::OnceLock;

/// 章节识别置信度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// 匹配到明确的章节标记
    Explicit,
    /// 根据段落长度变化推断
    Inferred,
    /// 无法识别，整本书作为一个章节
    Linear,
}

/// 章节边界
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub title: String,
    pub confidence: Confidence,
    /// 标题所在段落的索引
    pub start_index: usize,
}

/// 切分后的章节：标题与正文段落
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChapter {
    pub title: String,
    pub paragraphs: Vec<String>,
    pub confidence: Confidence,
}

fn heading_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // 中文章节标题
            r"^第[零一二三四五六七八九十百千万\d]+[章节回卷]",
            // 英文章节标题
            r"(?i)^(chapter|section|part)\s+(\d+|[ivxlc]+)\b",
            // Markdown 标题
            r"^#{1,2}\s+",
            // 数字章节
            r"^\d+\.\s+",
            r"^\d+、",
            r"^卷\s*[零一二三四五六七八九十百千万\d]+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("章节标题正则表达式无效"))
        .collect()
    })
}

/// 章节检测器
///
/// 三层回退：
/// 1. 显式识别：正则匹配章节标记
/// 2. 结构性推断：短段落后紧跟长段落
/// 3. 线性模式：整本书作为一个章节
#[derive(Debug, Clone, Copy, Default)]
pub struct ChapterDetector;

impl ChapterDetector {
    pub fn new() -> Self {
        Self
    }

    /// 判断单个段落是否为显式章节标题
    ///
    /// 超过 100 字节的段落视为正文
    pub fn detect_explicit(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.len() > 100 {
            return None;
        }
        heading_patterns()
            .iter()
            .any(|p| p.is_match(trimmed))
            .then(|| trimmed.trim_start_matches('#').trim().to_string())
    }

    pub fn explicit_boundaries(&self, paragraphs: &[String]) -> Vec<Boundary> {
        paragraphs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                self.detect_explicit(p).map(|title| Boundary {
                    title,
                    confidence: Confidence::Explicit,
                    start_index: i,
                })
            })
            .collect()
    }

    /// 短段落（< 50 字节）后跟长段落（> 200 字节），视为标题 + 正文
    pub fn inferred_boundaries(&self, paragraphs: &[String]) -> Vec<Boundary> {
        paragraphs
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| {
                let (prev, current) = (pair[0].trim().len(), pair[1].trim().len());
                prev > 0 && prev < 50 && current > 200
            })
            .map(|(i, pair)| Boundary {
                title: pair[0].trim().to_string(),
                confidence: Confidence::Inferred,
                start_index: i,
            })
            .collect()
    }

    /// 综合检测
    pub fn detect(&self, paragraphs: &[String]) -> Vec<DetectedChapter> {
        let mut boundaries = self.explicit_boundaries(paragraphs);
        if boundaries.is_empty() {
            boundaries = self.inferred_boundaries(paragraphs);
        }

        let chapters = split_by_boundaries(paragraphs, &boundaries);
        if chapters.is_empty() {
            return vec![DetectedChapter {
                title: "全文".to_string(),
                paragraphs: paragraphs.to_vec(),
                confidence: Confidence::Linear,
            }];
        }
        chapters
    }
}

/// 按边界切分；第一个标题之前的内容成为"前言"，没有正文的标题被跳过
fn split_by_boundaries(paragraphs: &[String], boundaries: &[Boundary]) -> Vec<DetectedChapter> {
    let mut chapters = Vec::new();
    let Some(first) = boundaries.first() else {
        return chapters;
    };

    if first.start_index > 0 {
        chapters.push(DetectedChapter {
            title: "前言".to_string(),
            paragraphs: paragraphs[..first.start_index].to_vec(),
            confidence: first.confidence,
        });
    }

    for (i, boundary) in boundaries.iter().enumerate() {
        let start = boundary.start_index + 1;
        let end = boundaries
            .get(i + 1)
            .map(|next| next.start_index)
            .unwrap_or(paragraphs.len());

        if start < end {
            chapters.push(DetectedChapter {
                title: boundary.title.clone(),
                paragraphs: paragraphs[start..end].to_vec(),
                confidence: boundary.confidence,
            });
        }
    }

    chapters
}

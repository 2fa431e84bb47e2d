use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::value::ValueShape;

/// 分隔符：书籍标识清洗后不可能出现该字符
const SEPARATOR: char = ':';
/// 章节/分组级产物在键中嵌入的字面段
const ENTITY_SEGMENT: &str = "chapter";

/// 产物类型
///
/// 固定枚举，每种类型在编译期对应唯一的值形态（见 `shape`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ChapterSummary,
    ChapterMindmap,
    CrossChapterConnections,
    OverallSummary,
    CharacterRelationship,
    MergedMindmap,
    CombinedMindmap,
    MindmapArrows,
    SelectedChapters,
    ChapterTags,
    CustomPrompt,
    UseCustomOnlyFlag,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 12] = [
        ArtifactKind::ChapterSummary,
        ArtifactKind::ChapterMindmap,
        ArtifactKind::CrossChapterConnections,
        ArtifactKind::OverallSummary,
        ArtifactKind::CharacterRelationship,
        ArtifactKind::MergedMindmap,
        ArtifactKind::CombinedMindmap,
        ArtifactKind::MindmapArrows,
        ArtifactKind::SelectedChapters,
        ArtifactKind::ChapterTags,
        ArtifactKind::CustomPrompt,
        ArtifactKind::UseCustomOnlyFlag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::ChapterSummary => "chapter-summary",
            ArtifactKind::ChapterMindmap => "chapter-mindmap",
            ArtifactKind::CrossChapterConnections => "cross-chapter-connections",
            ArtifactKind::OverallSummary => "overall-summary",
            ArtifactKind::CharacterRelationship => "character-relationship",
            ArtifactKind::MergedMindmap => "merged-mindmap",
            ArtifactKind::CombinedMindmap => "combined-mindmap",
            ArtifactKind::MindmapArrows => "mindmap-arrows",
            ArtifactKind::SelectedChapters => "selected-chapters",
            ArtifactKind::ChapterTags => "chapter-tags",
            ArtifactKind::CustomPrompt => "custom-prompt",
            ArtifactKind::UseCustomOnlyFlag => "use-custom-only-flag",
        }
    }

    /// 是否为章节/分组级产物（键中必须带 entity id）
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            ArtifactKind::ChapterSummary | ArtifactKind::ChapterMindmap
        )
    }

    /// 该类型在存储中对应的值形态
    pub fn shape(&self) -> ValueShape {
        match self {
            ArtifactKind::ChapterSummary
            | ArtifactKind::CrossChapterConnections
            | ArtifactKind::OverallSummary
            | ArtifactKind::CharacterRelationship
            | ArtifactKind::CustomPrompt => ValueShape::Text,
            ArtifactKind::ChapterMindmap
            | ArtifactKind::MergedMindmap
            | ArtifactKind::CombinedMindmap
            | ArtifactKind::MindmapArrows => ValueShape::MindMap,
            ArtifactKind::SelectedChapters => ValueShape::StringList,
            ArtifactKind::ChapterTags => ValueShape::StringMap,
            ArtifactKind::UseCustomOnlyFlag => ValueShape::Flag,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("未知的产物类型: {}", s))
    }
}

/// 由书籍文件名生成书籍标识
///
/// 去掉扩展名，把非字母数字且非中日韩文字的字符替换为 `_`。
/// 不同文件名可能映射到同一标识，这是可接受的。
pub fn book_token(file_name: &str) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);

    let token: String = stem
        .chars()
        .map(|c| if is_token_char(c) { c } else { '_' })
        .collect();

    if token.is_empty() {
        "untitled".to_string()
    } else {
        token
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || is_cjk(c)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK 统一表意文字
        | '\u{3400}'..='\u{4DBF}' // 扩展 A
        | '\u{3040}'..='\u{30FF}' // 平假名、片假名
        | '\u{AC00}'..='\u{D7AF}' // 韩文音节
    )
}

/// 缓存键
///
/// (书籍标识, 产物类型, 可选 entity id)，与字符串键之间可无损互转
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub book_token: String,
    pub kind: ArtifactKind,
    pub entity_id: Option<String>,
}

impl ArtifactKey {
    /// 书籍级产物的键
    pub fn book(book_token: impl Into<String>, kind: ArtifactKind) -> Self {
        debug_assert!(!kind.is_entity_scoped(), "{} 需要 entity id", kind);
        Self {
            book_token: book_token.into(),
            kind,
            entity_id: None,
        }
    }

    /// 章节/分组级产物的键
    pub fn entity(
        book_token: impl Into<String>,
        kind: ArtifactKind,
        entity_id: impl Into<String>,
    ) -> Self {
        debug_assert!(kind.is_entity_scoped(), "{} 不接受 entity id", kind);
        Self {
            book_token: book_token.into(),
            kind,
            entity_id: Some(entity_id.into()),
        }
    }

    /// 编码为存储键
    ///
    /// 格式：`{book}:{kind}` 或 `{book}:{kind}:chapter:{entity}`。
    /// entity id 放在最后，因此可以包含任意字符。
    pub fn encode(&self) -> String {
        match &self.entity_id {
            Some(entity) => format!(
                "{}{sep}{}{sep}{}{sep}{}",
                self.book_token,
                self.kind,
                ENTITY_SEGMENT,
                entity,
                sep = SEPARATOR
            ),
            None => format!("{}{}{}", self.book_token, SEPARATOR, self.kind),
        }
    }

    /// 从存储键解码
    ///
    /// 不符合格式的键（包括其他程序写入的键）返回 None
    pub fn decode(key: &str) -> Option<Self> {
        let (book, rest) = key.split_once(SEPARATOR)?;
        if book.is_empty() || !book.chars().all(is_token_char) {
            return None;
        }

        let (kind_str, entity) = match rest.split_once(SEPARATOR) {
            Some((kind_str, tail)) => {
                let entity = tail.strip_prefix(ENTITY_SEGMENT)?.strip_prefix(SEPARATOR)?;
                (kind_str, Some(entity))
            }
            None => (rest, None),
        };

        let kind: ArtifactKind = kind_str.parse().ok()?;
        if kind.is_entity_scoped() != entity.is_some() {
            return None;
        }

        Some(Self {
            book_token: book.to_string(),
            kind,
            entity_id: entity.map(str::to_string),
        })
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

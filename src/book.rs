use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cache::keys::book_token;

/// 书籍标识
///
/// `token` 由文件名清洗得到，是所有缓存键的前缀
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BookIdentity {
    pub token: String,
    pub title: String,
}

impl BookIdentity {
    /// 由源文件名构造，标题取去掉扩展名后的文件名
    pub fn from_file_name(file_name: &str) -> Self {
        let title = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("未命名书籍")
            .to_string();

        Self {
            token: book_token(file_name),
            title,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// 书籍分类；非虚构类书籍跳过人物关系分析
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BookCategory {
    #[default]
    Fiction,
    NonFiction,
}

/// 章节
///
/// 由外部解析器产生；`id` 在同一本书内唯一，且同一文件重复解析时保持不变
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub content: String,
    /// 用户指定的分组标签
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Chapter {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

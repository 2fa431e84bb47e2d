use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use super::keys::ArtifactKind;
use crate::error::{PipelineError, PipelineResult};

/// 值形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueShape {
    Text,
    MindMap,
    StringList,
    StringMap,
    Flag,
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueShape::Text => "text",
            ValueShape::MindMap => "mindmap",
            ValueShape::StringList => "string-list",
            ValueShape::StringMap => "string-map",
            ValueShape::Flag => "flag",
        };
        f.write_str(name)
    }
}

/// 思维导图节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMapNode {
    #[serde(default)]
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MindMapNode>,
}

impl MindMapNode {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            children: Vec::new(),
        }
    }

    /// 子树节点总数（含自身）
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// 深度优先查找节点
    pub fn find(&self, id: &str) -> Option<&MindMapNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

/// 节点之间的关联箭头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMapArrow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bidirectional: bool,
}

/// 节点分组概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMapSummary {
    #[serde(default)]
    pub id: String,
    pub label: String,
    pub parent: String,
    pub start: usize,
    pub end: usize,
}

/// 思维导图：根节点 + 子节点 + 关联箭头 + 概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindMapData {
    pub node_data: MindMapNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arrows: Vec<MindMapArrow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summaries: Vec<MindMapSummary>,
}

impl MindMapData {
    pub fn new(root: MindMapNode) -> Self {
        Self {
            node_data: root,
            arrows: Vec::new(),
            summaries: Vec::new(),
        }
    }
}

/// 缓存值
///
/// 标签联合体；某个产物类型应该是哪种形态由 `ArtifactKind::shape` 决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ArtifactValue {
    Text(String),
    MindMap(MindMapData),
    StringList(Vec<String>),
    StringMap(BTreeMap<String, String>),
    Flag(bool),
}

impl ArtifactValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            ArtifactValue::Text(_) => ValueShape::Text,
            ArtifactValue::MindMap(_) => ValueShape::MindMap,
            ArtifactValue::StringList(_) => ValueShape::StringList,
            ArtifactValue::StringMap(_) => ValueShape::StringMap,
            ArtifactValue::Flag(_) => ValueShape::Flag,
        }
    }
}

/// 可缓存的产物载荷
///
/// 把 Rust 类型和值形态一一对应，避免运行时猜测形态
pub trait ArtifactPayload: Clone + Send + Sync + Sized + 'static {
    const SHAPE: ValueShape;

    fn into_value(self) -> ArtifactValue;

    /// 形态不匹配时返回 None
    fn from_value(value: ArtifactValue) -> Option<Self>;

    /// 检查生成结果是否完整；空文本或缺少根节点视为生成失败
    fn validate(&self, kind: ArtifactKind) -> PipelineResult<()>;

    /// 推送给观察者时使用的文本形式
    fn render(&self) -> String;
}

impl ArtifactPayload for String {
    const SHAPE: ValueShape = ValueShape::Text;

    fn into_value(self) -> ArtifactValue {
        ArtifactValue::Text(self)
    }

    fn from_value(value: ArtifactValue) -> Option<Self> {
        match value {
            ArtifactValue::Text(text) => Some(text),
            _ => None,
        }
    }

    fn validate(&self, kind: ArtifactKind) -> PipelineResult<()> {
        if self.trim().is_empty() {
            return Err(PipelineError::malformed(kind, "生成内容为空"));
        }
        Ok(())
    }

    fn render(&self) -> String {
        self.clone()
    }
}

impl ArtifactPayload for MindMapData {
    const SHAPE: ValueShape = ValueShape::MindMap;

    fn into_value(self) -> ArtifactValue {
        ArtifactValue::MindMap(self)
    }

    fn from_value(value: ArtifactValue) -> Option<Self> {
        match value {
            ArtifactValue::MindMap(data) => Some(data),
            _ => None,
        }
    }

    fn validate(&self, kind: ArtifactKind) -> PipelineResult<()> {
        if self.node_data.topic.trim().is_empty() {
            return Err(PipelineError::malformed(kind, "思维导图缺少根节点"));
        }
        Ok(())
    }

    fn render(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl ArtifactPayload for Vec<String> {
    const SHAPE: ValueShape = ValueShape::StringList;

    fn into_value(self) -> ArtifactValue {
        ArtifactValue::StringList(self)
    }

    fn from_value(value: ArtifactValue) -> Option<Self> {
        match value {
            ArtifactValue::StringList(list) => Some(list),
            _ => None,
        }
    }

    fn validate(&self, _kind: ArtifactKind) -> PipelineResult<()> {
        Ok(())
    }

    fn render(&self) -> String {
        self.join("\n")
    }
}

impl ArtifactPayload for BTreeMap<String, String> {
    const SHAPE: ValueShape = ValueShape::StringMap;

    fn into_value(self) -> ArtifactValue {
        ArtifactValue::StringMap(self)
    }

    fn from_value(value: ArtifactValue) -> Option<Self> {
        match value {
            ArtifactValue::StringMap(map) => Some(map),
            _ => None,
        }
    }

    fn validate(&self, _kind: ArtifactKind) -> PipelineResult<()> {
        Ok(())
    }

    fn render(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ArtifactPayload for bool {
    const SHAPE: ValueShape = ValueShape::Flag;

    fn into_value(self) -> ArtifactValue {
        ArtifactValue::Flag(self)
    }

    fn from_value(value: ArtifactValue) -> Option<Self> {
        match value {
            ArtifactValue::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    fn validate(&self, _kind: ArtifactKind) -> PipelineResult<()> {
        Ok(())
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

/// 带类型的产物槽位
///
/// 把产物类型和载荷类型在编译期绑定，读写缓存时不会用错形态
pub struct ArtifactSlot<P> {
    kind: ArtifactKind,
    _payload: PhantomData<fn() -> P>,
}

impl<P> ArtifactSlot<P> {
    const fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            _payload: PhantomData,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }
}

impl<P> Clone for ArtifactSlot<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ArtifactSlot<P> {}

impl<P> fmt::Debug for ArtifactSlot<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactSlot({})", self.kind)
    }
}

pub mod slots {
    use super::*;

    pub const CHAPTER_SUMMARY: ArtifactSlot<String> = ArtifactSlot::new(ArtifactKind::ChapterSummary);
    pub const CHAPTER_MINDMAP: ArtifactSlot<MindMapData> = ArtifactSlot::new(ArtifactKind::ChapterMindmap);
    pub const CONNECTIONS: ArtifactSlot<String> = ArtifactSlot::new(ArtifactKind::CrossChapterConnections);
    pub const OVERALL_SUMMARY: ArtifactSlot<String> = ArtifactSlot::new(ArtifactKind::OverallSummary);
    pub const CHARACTER_RELATIONSHIP: ArtifactSlot<String> =
        ArtifactSlot::new(ArtifactKind::CharacterRelationship);
    pub const MERGED_MINDMAP: ArtifactSlot<MindMapData> = ArtifactSlot::new(ArtifactKind::MergedMindmap);
    pub const COMBINED_MINDMAP: ArtifactSlot<MindMapData> = ArtifactSlot::new(ArtifactKind::CombinedMindmap);
    pub const MINDMAP_ARROWS: ArtifactSlot<MindMapData> = ArtifactSlot::new(ArtifactKind::MindmapArrows);
    pub const SELECTED_CHAPTERS: ArtifactSlot<Vec<String>> = ArtifactSlot::new(ArtifactKind::SelectedChapters);
    pub const CHAPTER_TAGS: ArtifactSlot<BTreeMap<String, String>> = ArtifactSlot::new(ArtifactKind::ChapterTags);
    pub const CUSTOM_PROMPT: ArtifactSlot<String> = ArtifactSlot::new(ArtifactKind::CustomPrompt);
    pub const USE_CUSTOM_ONLY: ArtifactSlot<bool> = ArtifactSlot::new(ArtifactKind::UseCustomOnlyFlag);
}

//! 分析流水线
//!
//! 每次运行的状态机：
//! `Grouping → PerGroupStage(i) → Connections → CharacterRelationship（非虚构跳过）→ OverallSummary → Done`
//! 思维导图模式：`Grouping → PerGroupStage(i) → Merge → Arrows（可选）→ Done`
//! 整书思维导图：`Grouping → WholeBookMindmap → Done`
//! 任意状态都可能进入 `Aborted`（用户取消）或 `Failed`（阶段失败，保留请求以便重试）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::book::{BookIdentity, Chapter};
use crate::cache::keys::ArtifactKind;
use crate::cache::value::MindMapData;
use crate::error::PipelineError;
use crate::grouping::{ChapterGroup, TagAssignment};
use crate::stage::StagePartial;

pub mod mindmap;
pub mod orchestrator;


pub use orchestrator::Orchestrator;

/// 处理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    /// 分组摘要 + 章节关联 + 人物关系 + 全书总结
    Summary,
    /// 分组思维导图，合并为一张图
    ChapterMindmap,
    /// 一次生成整本书的思维导图
    WholeBookMindmap,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Summary => "summary",
            ProcessingMode::ChapterMindmap => "chapter-mindmap",
            ProcessingMode::WholeBookMindmap => "whole-book-mindmap",
        }
    }

    /// 该模式产生的产物类型
    pub fn artifact_kinds(&self) -> &'static [ArtifactKind] {
        match self {
            ProcessingMode::Summary => &[
                ArtifactKind::ChapterSummary,
                ArtifactKind::CrossChapterConnections,
                ArtifactKind::CharacterRelationship,
                ArtifactKind::OverallSummary,
            ],
            ProcessingMode::ChapterMindmap => &[
                ArtifactKind::ChapterMindmap,
                ArtifactKind::MergedMindmap,
                ArtifactKind::MindmapArrows,
            ],
            ProcessingMode::WholeBookMindmap => &[ArtifactKind::CombinedMindmap],
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(ProcessingMode::Summary),
            "chapter-mindmap" | "mindmap" => Ok(ProcessingMode::ChapterMindmap),
            "whole-book-mindmap" | "combined-mindmap" => Ok(ProcessingMode::WholeBookMindmap),
            _ => Err(format!("未知的处理模式: {}", s)),
        }
    }
}

/// 运行状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Grouping,
    PerGroupStage { index: usize, total: usize },
    Connections,
    CharacterRelationship,
    OverallSummary,
    Merge,
    Arrows,
    WholeBookMindmap,
    Done,
    Aborted,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Grouping => f.write_str("分组"),
            PipelineState::PerGroupStage { index, total } => {
                write!(f, "处理分组 {}/{}", index + 1, total)
            }
            PipelineState::Connections => f.write_str("章节关联"),
            PipelineState::CharacterRelationship => f.write_str("人物关系"),
            PipelineState::OverallSummary => f.write_str("全书总结"),
            PipelineState::Merge => f.write_str("合并思维导图"),
            PipelineState::Arrows => f.write_str("生成关联箭头"),
            PipelineState::WholeBookMindmap => f.write_str("整书思维导图"),
            PipelineState::Done => f.write_str("完成"),
            PipelineState::Aborted => f.write_str("已取消"),
            PipelineState::Failed => f.write_str("失败"),
        }
    }
}

/// 进度（0.0 - 1.0 由 `fraction` 计算）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f32 / self.total as f32
        }
    }
}

/// 单个分组的产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupArtifact {
    Summary(String),
    MindMap(MindMapData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group: ChapterGroup,
    pub artifact: GroupArtifact,
}

/// 按章节查看分组产物时的一行
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterArtifact<'a> {
    pub chapter_id: &'a str,
    pub chapter_title: &'a str,
    pub group_id: &'a str,
    pub artifact: &'a GroupArtifact,
}

/// 一次成功运行的全部产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub book: BookIdentity,
    pub mode: ProcessingMode,
    pub groups: Vec<GroupResult>,
    pub connections: Option<String>,
    pub character_relationship: Option<String>,
    pub overall_summary: Option<String>,
    /// 合并后（或整书）的思维导图
    pub mindmap: Option<MindMapData>,
}

impl PipelineOutput {
    pub(crate) fn new(book: BookIdentity, mode: ProcessingMode) -> Self {
        Self {
            book,
            mode,
            groups: Vec::new(),
            connections: None,
            character_relationship: None,
            overall_summary: None,
            mindmap: None,
        }
    }

    /// 把每个分组的产物归属到它的每个成员章节
    pub fn chapter_view(&self) -> Vec<ChapterArtifact<'_>> {
        self.groups
            .iter()
            .flat_map(|result| {
                result
                    .group
                    .chapter_ids
                    .iter()
                    .zip(result.group.chapter_titles.iter())
                    .map(move |(id, title)| ChapterArtifact {
                        chapter_id: id,
                        chapter_title: title,
                        group_id: &result.group.group_id,
                        artifact: &result.artifact,
                    })
            })
            .collect()
    }
}

/// 运行请求；失败时原样保留，用于重试
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub book: BookIdentity,
    pub chapters: Vec<Chapter>,
    pub tags: TagAssignment,
    pub mode: ProcessingMode,
}

/// 失败的运行
#[derive(Debug)]
pub struct FailedRun {
    pub stage: PipelineState,
    pub error: PipelineError,
    pub request: PipelineRequest,
}

/// 运行结果
#[derive(Debug)]
pub enum RunOutcome {
    Completed(PipelineOutput),
    /// 用户取消；已完成阶段的缓存保留
    Aborted { stage: PipelineState },
    Failed(FailedRun),
}

impl RunOutcome {
    pub fn output(&self) -> Option<&PipelineOutput> {
        match self {
            RunOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<PipelineOutput> {
        match self {
            RunOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

/// 运行句柄，持有本次运行的取消令牌
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    token: CancellationToken,
}

impl RunHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// 运行观察者
///
/// 所有方法默认什么都不做
pub trait PipelineObserver: Send + Sync {
    fn on_state(&self, _state: &PipelineState) {}

    fn on_progress(&self, _progress: Progress) {}

    /// 分组开始处理（界面显示占位）
    fn on_group_pending(&self, _index: usize, _group: &ChapterGroup) {}

    /// 分组产物就绪
    fn on_group_resolved(&self, _index: usize, _group: &ChapterGroup, _artifact: &GroupArtifact) {}

    fn on_partial(&self, _partial: &StagePartial) {}
}

/// 不关心过程的观察者
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("summary".parse(), Ok(ProcessingMode::Summary));
        assert_eq!("mindmap".parse(), Ok(ProcessingMode::ChapterMindmap));
        assert_eq!(
            "whole-book-mindmap".parse(),
            Ok(ProcessingMode::WholeBookMindmap)
        );
        assert!("other".parse::<ProcessingMode>().is_err());
    }

    #[test]
    fn test_mode_kinds_are_disjoint() {
        let modes = [
            ProcessingMode::Summary,
            ProcessingMode::ChapterMindmap,
            ProcessingMode::WholeBookMindmap,
        ];
        for (i, a) in modes.iter().enumerate() {
            for b in &modes[i + 1..] {
                assert!(a.artifact_kinds().iter().all(|k| !b.artifact_kinds().contains(k)));
            }
        }
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress { completed: 1, total: 4 }.fraction(), 0.25);
        assert_eq!(Progress { completed: 0, total: 0 }.fraction(), 1.0);
    }

    #[test]
    fn test_chapter_view_attributes_group_to_members() {
        let mut output = PipelineOutput::new(
            BookIdentity::from_file_name("book.txt"),
            ProcessingMode::Summary,
        );
        output.groups.push(GroupResult {
            group: ChapterGroup {
                group_id: "g1".to_string(),
                tag: Some("Act1".to_string()),
                chapter_ids: vec!["c1".to_string(), "c2".to_string()],
                chapter_titles: vec!["Intro".to_string(), "Body".to_string()],
            },
            artifact: GroupArtifact::Summary("摘要".to_string()),
        });

        let view = output.chapter_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].chapter_id, "c1");
        assert_eq!(view[1].chapter_title, "Body");
        assert!(view.iter().all(|row| row.group_id == "g1"));
        assert!(view
            .iter()
            .all(|row| *row.artifact == GroupArtifact::Summary("摘要".to_string())));
    }

    #[test]
    fn test_run_handle_cancel() {
        let handle = RunHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.token().is_cancelled());
    }
}

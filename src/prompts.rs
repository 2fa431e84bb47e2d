use crate::cache::keys::ArtifactKind;
use crate::cache::value::{MindMapData, MindMapNode};
use crate::generation::GenerationRequest;
use crate::grouping::ChapterGroup;

const MINDMAP_FORMAT: &str = r#"只输出 JSON，格式如下：
{"nodeData":{"id":"root","topic":"主题","children":[{"id":"n1","topic":"要点","children":[]}]}}
每个节点的 id 在整张图中唯一。"#;

/// 提示词构建器
///
/// 自定义提示词作为附加要求；`use_custom_only` 时章节摘要只使用自定义提示词
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    pub output_language: Option<String>,
    pub custom_prompt: Option<String>,
    pub use_custom_only: bool,
}

impl PromptBuilder {
    pub fn new(output_language: Option<String>) -> Self {
        Self {
            output_language,
            ..Self::default()
        }
    }

    pub fn with_custom_prompt(mut self, prompt: Option<String>, use_custom_only: bool) -> Self {
        self.custom_prompt = prompt.filter(|p| !p.trim().is_empty());
        self.use_custom_only = use_custom_only && self.custom_prompt.is_some();
        self
    }

    fn finish(&self, kind: ArtifactKind, system: String, user: String) -> GenerationRequest {
        let mut system = system;
        if let Some(language) = &self.output_language {
            system.push_str(&format!("\n请使用{}输出。", language));
        }
        GenerationRequest { kind, system, user }
    }

    fn with_extra(&self, mut system: String) -> String {
        if let Some(custom) = &self.custom_prompt {
            system.push_str("\n附加要求：");
            system.push_str(custom);
        }
        system
    }

    /// 分组摘要
    pub fn group_summary(&self, book_title: &str, group: &ChapterGroup, content: &str) -> GenerationRequest {
        let system = match (&self.custom_prompt, self.use_custom_only) {
            (Some(custom), true) => custom.clone(),
            _ => self.with_extra(
                "你是一名专业的读书助手。请总结给定章节的主要内容、关键情节和核心观点，条理清晰，不要遗漏重要信息。"
                    .to_string(),
            ),
        };
        let user = format!(
            "书名：《{}》\n章节：{}\n\n{}",
            book_title,
            group.chapter_titles.join("、"),
            content
        );
        self.finish(ArtifactKind::ChapterSummary, system, user)
    }

    /// 分组思维导图
    pub fn group_mindmap(&self, book_title: &str, group: &ChapterGroup, content: &str) -> GenerationRequest {
        let system = self.with_extra(format!(
            "你是一名擅长结构化整理的读书助手。请把给定章节整理为思维导图，根节点为章节名称。\n{}",
            MINDMAP_FORMAT
        ));
        let user = format!(
            "书名：《{}》\n章节：{}\n\n{}",
            book_title,
            group.display_name(),
            content
        );
        self.finish(ArtifactKind::ChapterMindmap, system, user)
    }

    /// 章节关联分析
    pub fn connections(&self, book_title: &str, summaries: &[(String, String)]) -> GenerationRequest {
        let system = "请分析各章节之间的联系：情节呼应、观点递进、因果关系与伏笔。".to_string();
        self.finish(
            ArtifactKind::CrossChapterConnections,
            system,
            format_summaries(book_title, summaries),
        )
    }

    /// 人物关系
    pub fn character_relationship(&self, book_title: &str, summaries: &[(String, String)]) -> GenerationRequest {
        let system = "请梳理书中主要人物及其相互关系，用 mermaid graph 语法输出人物关系图，并附简要说明。"
            .to_string();
        self.finish(
            ArtifactKind::CharacterRelationship,
            system,
            format_summaries(book_title, summaries),
        )
    }

    /// 全书总结
    pub fn overall_summary(&self, book_title: &str, summaries: &[(String, String)]) -> GenerationRequest {
        let system = "请根据各章节摘要写出全书总结：核心主题、结构脉络、主要观点与阅读价值。".to_string();
        self.finish(
            ArtifactKind::OverallSummary,
            system,
            format_summaries(book_title, summaries),
        )
    }

    /// 思维导图关联箭头
    pub fn mindmap_arrows(&self, book_title: &str, merged: &MindMapData) -> GenerationRequest {
        let system = r#"请在给定的思维导图中找出跨分支的重要关联。只输出 JSON 数组：
[{"from":"节点id","to":"节点id","label":"关联说明"}]
from 和 to 必须是图中已有的节点 id。"#
            .to_string();
        let mut outline = String::new();
        outline_nodes(&merged.node_data, 0, &mut outline);
        let user = format!("书名：《{}》\n\n{}", book_title, outline);
        self.finish(ArtifactKind::MindmapArrows, system, user)
    }

    /// 整书思维导图
    pub fn whole_book_mindmap(&self, book_title: &str, content: &str) -> GenerationRequest {
        let system = self.with_extra(format!(
            "你是一名擅长结构化整理的读书助手。请把整本书整理为一张思维导图，根节点为书名。\n{}",
            MINDMAP_FORMAT
        ));
        let user = format!("书名：《{}》\n\n{}", book_title, content);
        self.finish(ArtifactKind::CombinedMindmap, system, user)
    }
}

fn format_summaries(book_title: &str, summaries: &[(String, String)]) -> String {
    let mut text = format!("书名：《{}》\n", book_title);
    for (name, summary) in summaries {
        text.push_str(&format!("\n## {}\n{}\n", name, summary));
    }
    text
}

fn outline_nodes(node: &MindMapNode, depth: usize, out: &mut String) {
    out.push_str(&format!("{}- [{}] {}\n", "  ".repeat(depth), node.id, node.topic));
    for child in &node.children {
        outline_nodes(child, depth + 1, out);
    }
}

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

use crate::cache::keys::ArtifactKind;
use crate::cache::value::{ArtifactPayload, MindMapData};
use crate::error::{PipelineError, PipelineResult};

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").expect("fenced block pattern")
    })
}

/// 提取第一个代码块的内容
pub fn fenced_content(text: &str) -> Option<&str> {
    fenced_block()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// 解析生成的 JSON
///
/// 先直接解析原文，失败后再尝试代码块中的内容
pub fn extract_json<T: DeserializeOwned>(text: &str, kind: ArtifactKind) -> PipelineResult<T> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::malformed(kind, "生成内容为空"));
    }

    let direct_err = match serde_json::from_str::<T>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    match fenced_content(trimmed) {
        Some(inner) => serde_json::from_str::<T>(inner).map_err(|e| {
            PipelineError::malformed(kind, format!("代码块中的 JSON 无法解析: {}", e))
        }),
        None => Err(PipelineError::malformed(
            kind,
            format!("JSON 无法解析: {}", direct_err),
        )),
    }
}

/// 解析生成的思维导图，缺少根节点同样视为生成失败
pub fn extract_mindmap(text: &str, kind: ArtifactKind) -> PipelineResult<MindMapData> {
    let data: MindMapData = extract_json(text, kind)?;
    data.validate(kind)?;
    Ok(data)
}

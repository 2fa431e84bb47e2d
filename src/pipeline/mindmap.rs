use serde::Deserialize;
use std::collections::HashSet;

use crate::cache::keys::ArtifactKind;
use crate::cache::value::{MindMapArrow, MindMapData, MindMapNode};
use crate::error::PipelineResult;
use crate::generation::extract_json;
use crate::grouping::{group_hash, ChapterGroup};

/// 分组节点在合并图中的稳定 id
///
/// 同样的分组顺序和成员总是得到同样的 id
pub fn group_node_id(index: usize, group: &ChapterGroup) -> String {
    format!("g{}_{}", index, &group_hash(&[&group.group_id])[..8])
}

fn prefix_ids(node: &mut MindMapNode, prefix: &str) {
    node.id = format!("{}-{}", prefix, node.id);
    for child in &mut node.children {
        prefix_ids(child, prefix);
    }
}

/// 把各分组的思维导图挂到以书名为根的一张图下
///
/// 分组根节点改用稳定 id，其余节点 id 加上分组前缀以避免冲突；
/// 分组内已有的箭头随节点一起改写
pub fn merge_group_mindmaps(book_title: &str, groups: &[(&ChapterGroup, &MindMapData)]) -> MindMapData {
    let mut root = MindMapNode::new("root", book_title);
    let mut arrows = Vec::new();

    for (index, (group, map)) in groups.iter().enumerate() {
        let group_id = group_node_id(index, group);

        let mut node = map.node_data.clone();
        for child in &mut node.children {
            prefix_ids(child, &group_id);
        }
        let original_root = std::mem::replace(&mut node.id, group_id.clone());

        let remap = |id: &str| {
            if id == original_root {
                group_id.clone()
            } else {
                format!("{}-{}", group_id, id)
            }
        };
        for arrow in &map.arrows {
            arrows.push(MindMapArrow {
                id: format!("{}-{}", group_id, arrow.id),
                label: arrow.label.clone(),
                from: remap(&arrow.from),
                to: remap(&arrow.to),
                bidirectional: arrow.bidirectional,
            });
        }

        root.children.push(node);
    }

    let mut merged = MindMapData::new(root);
    merged.arrows = arrows;
    merged
}

/// 合并图的分组节点是否与当前分组一一对应
///
/// 重新打标签后分组变化，以书为键的合并图就不再对应当前分组
pub fn merged_matches_groups(merged: &MindMapData, groups: &[(&ChapterGroup, &MindMapData)]) -> bool {
    let children = &merged.node_data.children;
    children.len() == groups.len()
        && children
            .iter()
            .zip(groups)
            .enumerate()
            .all(|(index, (node, (group, _)))| node.id == group_node_id(index, group))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArrowsPayload {
    List(Vec<MindMapArrow>),
    Wrapped { arrows: Vec<MindMapArrow> },
}

/// 解析关联箭头并叠加到合并图上
///
/// 指向不存在节点的箭头被丢弃
pub fn apply_arrows(text: &str, merged: &MindMapData) -> PipelineResult<MindMapData> {
    let payload: ArrowsPayload = extract_json(text, ArtifactKind::MindmapArrows)?;
    let generated = match payload {
        ArrowsPayload::List(arrows) | ArrowsPayload::Wrapped { arrows } => arrows,
    };

    let mut known = HashSet::new();
    collect_ids(&merged.node_data, &mut known);

    let mut map = merged.clone();
    for (index, mut arrow) in generated.into_iter().enumerate() {
        if !known.contains(arrow.from.as_str()) || !known.contains(arrow.to.as_str()) {
            tracing::debug!(from = %arrow.from, to = %arrow.to, "丢弃指向未知节点的箭头");
            continue;
        }
        if arrow.id.trim().is_empty() {
            arrow.id = format!("arrow-{}", index);
        }
        map.arrows.push(arrow);
    }
    Ok(map)
}

fn collect_ids<'a>(node: &'a MindMapNode, out: &mut HashSet<&'a str>) {
    out.insert(node.id.as_str());
    for child in &node.children {
        collect_ids(child, out);
    }
}

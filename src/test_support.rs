//! 测试辅助：脚本化的生成服务和记录型观察者

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::cache::keys::ArtifactKind;
use crate::error::{PipelineError, PipelineResult};
use crate::generation::{ChunkStream, GenerationChunk, GenerationProvider, GenerationRequest};
use crate::grouping::ChapterGroup;
use crate::pipeline::{GroupArtifact, PipelineObserver, PipelineState, Progress, RunHandle};
use crate::stage::StagePartial;

/// 预设响应
#[derive(Debug, Clone)]
pub enum MockResponse {
    Text(String),
    /// 流式分片；非流式调用时拼接返回
    Chunks(Vec<String>),
    Fail(String),
    /// 先输出一个分片，然后永远不结束
    Hang(String),
}

/// 脚本化的生成服务
///
/// 未预设响应的类型返回可解析的默认内容
pub struct MockProvider {
    scripted: Mutex<HashMap<ArtifactKind, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<GenerationRequest>>,
    streaming: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            streaming: false,
        }
    }

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::new()
        }
    }

    /// 为某个类型追加一次响应
    pub fn script(self, kind: ArtifactKind, response: MockResponse) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, kind: ArtifactKind) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn default_response(kind: ArtifactKind) -> MockResponse {
        let text = match kind {
            ArtifactKind::ChapterMindmap | ArtifactKind::CombinedMindmap => {
                r#"{"nodeData":{"id":"root","topic":"主题","children":[{"id":"n1","topic":"要点","children":[]}]}}"#
                    .to_string()
            }
            ArtifactKind::MindmapArrows => r#"[{"from":"root","to":"root","label":"自指"}]"#.to_string(),
            other => format!("{} 生成结果", other),
        };
        MockResponse::Text(text)
    }

    fn next_response(&self, request: &GenerationRequest) -> MockResponse {
        self.calls.lock().unwrap().push(request.clone());
        self.scripted
            .lock()
            .unwrap()
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Self::default_response(request.kind))
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    async fn generate(&self, request: &GenerationRequest) -> PipelineResult<String> {
        match self.next_response(request) {
            MockResponse::Text(text) => Ok(text),
            MockResponse::Chunks(parts) => Ok(parts.concat()),
            MockResponse::Fail(message) => Err(PipelineError::Transport(message)),
            MockResponse::Hang(_) => futures::future::pending().await,
        }
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> PipelineResult<ChunkStream> {
        let parts = match self.next_response(request) {
            MockResponse::Text(text) => vec![text],
            MockResponse::Chunks(parts) => parts,
            MockResponse::Fail(message) => return Err(PipelineError::Transport(message)),
            MockResponse::Hang(first) => {
                let head = futures::stream::iter(vec![Ok::<_, PipelineError>(GenerationChunk::content(first))]);
                return Ok(Box::pin(head.chain(futures::stream::pending())));
            }
        };
        let items: Vec<PipelineResult<GenerationChunk>> =
            parts.into_iter().map(|p| Ok(GenerationChunk::content(p))).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 记录所有回调的观察者
#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<PipelineState>>,
    pub progress: Mutex<Vec<Progress>>,
    pub partials: Mutex<Vec<StagePartial>>,
    /// (序号, 分组 id, 是否已解析)
    pub groups: Mutex<Vec<(usize, String, bool)>>,
    /// 收到该类型的第一个非缓存中间结果时取消运行
    cancel_on: Option<(ArtifactKind, RunHandle)>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling(kind: ArtifactKind, handle: RunHandle) -> Self {
        Self {
            cancel_on: Some((kind, handle)),
            ..Self::default()
        }
    }

    pub fn states(&self) -> Vec<PipelineState> {
        self.states.lock().unwrap().clone()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_state(&self, state: &PipelineState) {
        self.states.lock().unwrap().push(state.clone());
    }

    fn on_progress(&self, progress: Progress) {
        self.progress.lock().unwrap().push(progress);
    }

    fn on_group_pending(&self, index: usize, group: &ChapterGroup) {
        self.groups.lock().unwrap().push((index, group.group_id.clone(), false));
    }

    fn on_group_resolved(&self, index: usize, group: &ChapterGroup, _artifact: &GroupArtifact) {
        self.groups.lock().unwrap().push((index, group.group_id.clone(), true));
    }

    fn on_partial(&self, partial: &StagePartial) {
        if let Some((kind, handle)) = &self.cancel_on {
            if partial.kind == *kind && !partial.from_cache {
                handle.cancel();
            }
        }
        self.partials.lock().unwrap().push(partial.clone());
    }
}

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::throttle::{StreamCoalescer, StreamSnapshot};
use crate::cache::keys::{ArtifactKey, ArtifactKind};
use crate::cache::value::{ArtifactPayload, ArtifactSlot};
use crate::error::{PipelineError, PipelineResult};
use crate::generation::Generation;
use crate::store::ArtifactStore;

/// 推送给观察者的阶段中间结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePartial {
    pub kind: ArtifactKind,
    pub entity_id: Option<String>,
    /// 到目前为止累积的完整内容
    pub content: String,
    pub reasoning: String,
    pub is_final: bool,
    /// 内容来自缓存回放
    pub from_cache: bool,
}

pub type PartialSink<'a> = &'a (dyn Fn(StagePartial) + Send + Sync);

/// 阶段的目标产物
pub struct StageTarget<'a, P> {
    pub slot: ArtifactSlot<P>,
    pub book_token: &'a str,
    pub entity_id: Option<&'a str>,
}

impl<'a, P> StageTarget<'a, P> {
    pub fn book(slot: ArtifactSlot<P>, book_token: &'a str) -> Self {
        Self {
            slot,
            book_token,
            entity_id: None,
        }
    }

    pub fn entity(slot: ArtifactSlot<P>, book_token: &'a str, entity_id: &'a str) -> Self {
        Self {
            slot,
            book_token,
            entity_id: Some(entity_id),
        }
    }

    pub fn key(&self) -> ArtifactKey {
        match self.entity_id {
            Some(entity) => ArtifactKey::entity(self.book_token, self.slot.kind(), entity),
            None => ArtifactKey::book(self.book_token, self.slot.kind()),
        }
    }
}

/// 阶段执行器
///
/// "先读缓存，未命中再计算并写入"。保证：
/// - 命中时不调用计算函数，但仍向观察者回放一次完整结果
/// - 被取消的阶段不写缓存
/// - 结果为空或结构不完整时视为生成失败，不写缓存
/// - 每个阶段只有一次存储写入
#[derive(Clone)]
pub struct StageRunner {
    store: Arc<dyn ArtifactStore>,
    flush_interval: Duration,
}

impl StageRunner {
    pub fn new(store: Arc<dyn ArtifactStore>, flush_interval: Duration) -> Self {
        Self {
            store,
            flush_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// 读取缓存；读取失败或形态不匹配都按未命中处理
    pub async fn lookup<P: ArtifactPayload>(&self, key: &ArtifactKey) -> Option<P> {
        let encoded = key.encode();
        match self.store.get(&encoded).await {
            Ok(Some(value)) => {
                let found = value.shape();
                let expected = P::SHAPE;
                let payload = P::from_value(value);
                if payload.is_none() {
                    tracing::warn!(key = %encoded, %found, %expected, "缓存值形态不匹配，按未命中处理");
                }
                payload
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %encoded, error = %e, "读取缓存失败，按未命中处理");
                None
            }
        }
    }

    /// 写入缓存；失败只记录日志，计算结果仍然返回给调用方
    async fn persist<P: ArtifactPayload>(&self, key: &ArtifactKey, payload: &P) {
        let encoded = key.encode();
        match self.store.set(&encoded, &payload.clone().into_value()).await {
            Ok(()) => tracing::debug!(key = %encoded, "已写入缓存"),
            Err(e) => tracing::warn!(key = %encoded, error = %e, "写入缓存失败"),
        }
    }

    async fn hit<P: ArtifactPayload>(&self, key: &ArtifactKey, partial: Option<PartialSink<'_>>) -> Option<P> {
        let cached: P = self.lookup(key).await?;
        tracing::debug!(key = %key, "缓存命中");
        if let Some(sink) = partial {
            sink(StagePartial {
                kind: key.kind,
                entity_id: key.entity_id.clone(),
                content: cached.render(),
                reasoning: String::new(),
                is_final: true,
                from_cache: true,
            });
        }
        Some(cached)
    }

    /// 本地计算的阶段（例如合并思维导图）
    pub async fn resolve<P, Fut>(
        &self,
        target: StageTarget<'_, P>,
        cancel: &CancellationToken,
        partial: Option<PartialSink<'_>>,
        compute: Fut,
    ) -> PipelineResult<P>
    where
        P: ArtifactPayload,
        Fut: Future<Output = PipelineResult<P>>,
    {
        let key = target.key();
        if let Some(cached) = self.hit(&key, partial).await {
            return Ok(cached);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        tracing::debug!(key = %key, "缓存未命中，开始计算");
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = compute => result?,
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        value.validate(key.kind)?;
        self.persist(&key, &value).await;
        Ok(value)
    }

    /// 调用生成服务的阶段
    ///
    /// `compute` 只在未命中时调用；`parse` 把完整文本转换为载荷
    pub async fn generate<P, F, Fut, Parse>(
        &self,
        target: StageTarget<'_, P>,
        cancel: &CancellationToken,
        partial: Option<PartialSink<'_>>,
        compute: F,
        parse: Parse,
    ) -> PipelineResult<P>
    where
        P: ArtifactPayload,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<Generation>>,
        Parse: FnOnce(&str) -> PipelineResult<P>,
    {
        let key = target.key();
        if let Some(cached) = self.hit(&key, partial).await {
            return Ok(cached);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        tracing::debug!(key = %key, "缓存未命中，开始生成");
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.drive(&key, compute(), partial) => result?,
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let value = parse(&text)?;
        value.validate(key.kind)?;
        self.persist(&key, &value).await;
        Ok(value)
    }

    /// 消费生成结果，按合并策略推送中间结果，返回完整文本
    async fn drive<Fut>(
        &self,
        key: &ArtifactKey,
        generation: Fut,
        partial: Option<PartialSink<'_>>,
    ) -> PipelineResult<String>
    where
        Fut: Future<Output = PipelineResult<Generation>>,
    {
        let emit = |snapshot: &StreamSnapshot, is_final: bool| {
            if let Some(sink) = partial {
                sink(StagePartial {
                    kind: key.kind,
                    entity_id: key.entity_id.clone(),
                    content: snapshot.content.clone(),
                    reasoning: snapshot.reasoning.clone(),
                    is_final,
                    from_cache: false,
                });
            }
        };

        match generation.await? {
            Generation::Complete(text) => {
                emit(
                    &StreamSnapshot {
                        content: text.clone(),
                        reasoning: String::new(),
                    },
                    true,
                );
                Ok(text)
            }
            Generation::Stream(mut chunks) => {
                let mut coalescer = StreamCoalescer::new(self.flush_interval);
                while let Some(chunk) = chunks.next().await {
                    if let Some(snapshot) = coalescer.push(&chunk?, Instant::now()) {
                        emit(&snapshot, false);
                    }
                }
                let last = coalescer.finish();
                emit(&last, true);
                Ok(last.content)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::value::{slots, ArtifactValue, MindMapData, MindMapNode};
    use crate::error::StoreError;
    use crate::generation::{ChunkStream, GenerationChunk};
    use crate::store::MemoryArtifactStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn runner(store: Arc<dyn ArtifactStore>) -> StageRunner {
        StageRunner::new(store, Duration::from_millis(1000))
    }

    fn chunks(parts: &[&str]) -> ChunkStream {
        let items: Vec<PipelineResult<GenerationChunk>> =
            parts.iter().map(|p| Ok(GenerationChunk::content(*p))).collect();
        Box::pin(futures::stream::iter(items))
    }

    fn identity(text: &str) -> PipelineResult<String> {
        Ok(text.to_string())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());
        let cancel = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..2 {
            let value = runner
                .generate(
                    StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                    &cancel,
                    None,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Generation::Complete("摘要".to_string()))
                    },
                    identity,
                )
                .await
                .unwrap();
            assert_eq!(value, "摘要");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get("book:chapter-summary:chapter:c1").await.unwrap(),
            Some(ArtifactValue::Text("摘要".into()))
        );
    }

    #[tokio::test]
    async fn test_hit_replays_to_observer() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .set("book:overall-summary", &ArtifactValue::Text("缓存内容".into()))
            .await
            .unwrap();
        let runner = runner(store);
        let seen = Mutex::new(Vec::new());
        let sink = |p: StagePartial| seen.lock().unwrap().push(p);

        let value = runner
            .generate(
                StageTarget::book(slots::OVERALL_SUMMARY, "book"),
                &CancellationToken::new(),
                Some(&sink),
                || async { panic!("命中缓存时不应调用生成") },
                identity,
            )
            .await
            .unwrap();

        assert_eq!(value, "缓存内容");
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].from_cache && seen[0].is_final);
        assert_eq!(seen[0].content, "缓存内容");
    }

    #[tokio::test]
    async fn test_stream_forwards_first_and_final() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store);
        let seen = Mutex::new(Vec::new());
        let sink = |p: StagePartial| seen.lock().unwrap().push((p.content, p.is_final));

        let value = runner
            .generate(
                StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                &CancellationToken::new(),
                Some(&sink),
                || async { Ok(Generation::Stream(chunks(&["第", "一", "章"]))) },
                identity,
            )
            .await
            .unwrap();

        assert_eq!(value, "第一章");
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&("第".to_string(), false)));
        assert_eq!(seen.last(), Some(&("第一章".to_string(), true)));
    }

    #[tokio::test]
    async fn test_empty_output_is_not_cached() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());

        let err = runner
            .generate(
                StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                &CancellationToken::new(),
                None,
                || async { Ok(Generation::Complete(String::new())) },
                identity,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedOutput { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_cached() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());

        let err = runner
            .generate(
                StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                &CancellationToken::new(),
                None,
                || async {
                    let items: Vec<PipelineResult<GenerationChunk>> = vec![
                        Ok(GenerationChunk::content("部分")),
                        Err(PipelineError::Transport("连接中断".into())),
                    ];
                    Ok(Generation::Stream(Box::pin(futures::stream::iter(items))))
                },
                identity,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Transport(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .generate(
                StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                &cancel,
                None,
                || async { panic!("取消后不应调用生成") },
                identity,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_leaves_no_trace() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());
        let cancel = CancellationToken::new();
        let sink = |_: StagePartial| cancel.cancel();

        let err = runner
            .generate(
                StageTarget::entity(slots::CHAPTER_SUMMARY, "book", "c1"),
                &cancel,
                Some(&sink),
                || async {
                    let head = futures::stream::iter(vec![Ok::<_, PipelineError>(GenerationChunk::content("半截"))]);
                    let stream: ChunkStream = Box::pin(head.chain(futures::stream::pending()));
                    Ok(Generation::Stream(stream))
                },
                identity,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(store.get("book:chapter-summary:chapter:c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_local_computation() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(store.clone());
        let cancel = CancellationToken::new();
        let map = MindMapData::new(MindMapNode::new("root", "书名"));

        let first = runner
            .resolve(
                StageTarget::book(slots::MERGED_MINDMAP, "book"),
                &cancel,
                None,
                async { Ok(map.clone()) },
            )
            .await
            .unwrap();
        let second = runner
            .resolve(
                StageTarget::book(slots::MERGED_MINDMAP, "book"),
                &cancel,
                None,
                async { panic!("第二次应命中缓存") },
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_wrong_shape_is_a_miss() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .set("book:merged-mindmap", &ArtifactValue::Text("旧格式".into()))
            .await
            .unwrap();
        let runner = runner(store);

        let cached: Option<MindMapData> = runner
            .lookup(&ArtifactKey::book("book", ArtifactKind::MergedMindmap))
            .await;
        assert!(cached.is_none());
    }

    struct BrokenStore;

    #[async_trait]
    impl ArtifactStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<ArtifactValue>, StoreError> {
            Err(StoreError::Lock("磁盘不可用".into()))
        }
        async fn set(&self, _key: &str, _value: &ArtifactValue) -> Result<(), StoreError> {
            Err(StoreError::Lock("磁盘不可用".into()))
        }
        async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_not_fatal() {
        let runner = runner(Arc::new(BrokenStore));

        let value = runner
            .generate(
                StageTarget::book(slots::CONNECTIONS, "book"),
                &CancellationToken::new(),
                None,
                || async { Ok(Generation::Complete("关联".to_string())) },
                identity,
            )
            .await
            .unwrap();

        assert_eq!(value, "关联");
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::mindmap::{apply_arrows, merge_group_mindmaps, merged_matches_groups};
use super::{
    FailedRun, GroupArtifact, GroupResult, PipelineObserver, PipelineOutput, PipelineRequest, PipelineState,
    ProcessingMode, Progress, RunHandle, RunOutcome,
};
use crate::book::{BookCategory, Chapter};
use crate::cache::keys::{ArtifactKey, ArtifactKind};
use crate::cache::manager::{BookPreferences, CacheManager};
use crate::cache::value::{slots, ArtifactPayload, MindMapData};
use crate::config::{AnalysisSettings, ConfigHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::generation::{self, extract_mindmap, GenerationProvider, GenerationRequest};
use crate::grouping::{group_chapters, ChapterGroup};
use crate::prompts::PromptBuilder;
use crate::stage::{StagePartial, StageRunner, StageTarget};
use crate::store::ArtifactStore;

/// 流水线编排器
///
/// 按模式依次执行各阶段，分组之间串行。每个阶段都经过 `StageRunner`，
/// 所以重复运行同一请求只会重新生成缺失的产物。
pub struct Orchestrator {
    store: Arc<dyn ArtifactStore>,
    provider: Arc<dyn GenerationProvider>,
    config: ConfigHandle,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ArtifactStore>, provider: Arc<dyn GenerationProvider>, config: ConfigHandle) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn cache(&self) -> CacheManager {
        CacheManager::new(self.store.clone())
    }

    /// 执行一次分析
    ///
    /// # 参数
    /// - `request`: 书籍、章节、标签与处理模式
    /// - `observer`: 接收状态、进度和中间结果
    /// - `handle`: 取消句柄
    ///
    /// # 返回
    /// 完成、取消或失败；失败时附带原始请求，可交给 `retry`
    pub async fn run(
        &self,
        request: &PipelineRequest,
        observer: &dyn PipelineObserver,
        handle: &RunHandle,
    ) -> RunOutcome {
        let settings = self.config.snapshot().analysis;
        let preferences = self.preferences(&request.book.token).await;
        let prompts = PromptBuilder::new(settings.output_language.clone())
            .with_custom_prompt(preferences.custom_prompt, preferences.use_custom_only);

        let mut ctx = RunContext {
            request,
            observer,
            cancel: handle.token(),
            provider: self.provider.as_ref(),
            runner: StageRunner::new(self.store.clone(), settings.stream_interval()),
            prompts,
            settings,
            state: PipelineState::Grouping,
            progress: Progress { completed: 0, total: 0 },
        };

        tracing::info!(
            book = %request.book.token,
            mode = %request.mode,
            chapters = request.chapters.len(),
            provider = self.provider.name(),
            "开始分析"
        );

        match ctx.execute().await {
            Ok(output) => {
                tracing::info!(book = %request.book.token, groups = output.groups.len(), "分析完成");
                RunOutcome::Completed(output)
            }
            Err(error) if error.is_cancellation() => {
                let stage = ctx.state.clone();
                tracing::info!(book = %request.book.token, stage = %stage, "分析已取消");
                ctx.observer.on_state(&PipelineState::Aborted);
                RunOutcome::Aborted { stage }
            }
            Err(error) => {
                let stage = ctx.state.clone();
                tracing::warn!(book = %request.book.token, stage = %stage, error = %error, "分析失败");
                ctx.observer.on_state(&PipelineState::Failed);
                RunOutcome::Failed(FailedRun {
                    stage,
                    error,
                    request: request.clone(),
                })
            }
        }
    }

    /// 用失败时保留的请求重新运行；已缓存的阶段直接命中
    pub async fn retry(&self, failed: FailedRun, observer: &dyn PipelineObserver, handle: &RunHandle) -> RunOutcome {
        tracing::info!(stage = %failed.stage, error = %failed.error, "重试分析");
        self.run(&failed.request, observer, handle).await
    }

    async fn preferences(&self, book_token: &str) -> BookPreferences {
        match self.cache().load_preferences(book_token).await {
            Ok(preferences) => preferences,
            Err(e) => {
                tracing::warn!(book = %book_token, error = %e, "读取书籍偏好失败，使用默认值");
                BookPreferences::default()
            }
        }
    }
}

struct RunContext<'a> {
    request: &'a PipelineRequest,
    observer: &'a dyn PipelineObserver,
    cancel: &'a CancellationToken,
    provider: &'a dyn GenerationProvider,
    runner: StageRunner,
    prompts: PromptBuilder,
    settings: AnalysisSettings,
    state: PipelineState,
    progress: Progress,
}

fn plain_text(text: &str) -> PipelineResult<String> {
    Ok(text.trim().to_string())
}

fn group_content(group: &ChapterGroup, chapters: &HashMap<&str, &Chapter>) -> String {
    group
        .chapter_ids
        .iter()
        .filter_map(|id| chapters.get(id.as_str()))
        .map(|chapter| format!("## {}\n\n{}", chapter.title, chapter.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl<'a> RunContext<'a> {
    /// 进入新阶段；已取消时不再开始
    fn enter(&mut self, state: PipelineState) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tracing::debug!(state = %state, "进入阶段");
        self.observer.on_state(&state);
        self.state = state;
        Ok(())
    }

    /// 所有阶段都已完成；此时到达的取消不再影响结果
    fn finish(&mut self) {
        tracing::debug!(state = %PipelineState::Done, "进入阶段");
        self.observer.on_state(&PipelineState::Done);
        self.state = PipelineState::Done;
    }

    fn advance(&mut self) {
        self.progress.completed += 1;
        self.observer.on_progress(self.progress);
    }

    fn stage_count(&self, groups: usize) -> usize {
        match self.request.mode {
            ProcessingMode::Summary => {
                let relationship = self.settings.book_category == BookCategory::Fiction;
                groups + 2 + usize::from(relationship)
            }
            ProcessingMode::ChapterMindmap => groups + 1 + usize::from(self.settings.generate_mindmap_arrows),
            ProcessingMode::WholeBookMindmap => 1,
        }
    }

    async fn generate<P, Parse>(
        &self,
        target: StageTarget<'_, P>,
        prompt: &GenerationRequest,
        parse: Parse,
    ) -> PipelineResult<P>
    where
        P: ArtifactPayload,
        Parse: FnOnce(&str) -> PipelineResult<P>,
    {
        let observer = self.observer;
        let sink = move |partial: StagePartial| observer.on_partial(&partial);
        let provider = self.provider;
        let stream = self.settings.stream;

        self.runner
            .generate(
                target,
                self.cancel,
                Some(&sink),
                || generation::invoke(provider, prompt, stream),
                parse,
            )
            .await
    }

    async fn execute(&mut self) -> PipelineResult<PipelineOutput> {
        let request = self.request;
        self.enter(PipelineState::Grouping)?;
        if request.chapters.is_empty() {
            return Err(PipelineError::Source("没有可分析的章节".to_string()));
        }

        let groups = match request.mode {
            ProcessingMode::WholeBookMindmap => Vec::new(),
            _ => group_chapters(&request.chapters, &request.tags),
        };
        self.progress = Progress {
            completed: 0,
            total: self.stage_count(groups.len()),
        };
        self.observer.on_progress(self.progress);

        let mut output = PipelineOutput::new(request.book.clone(), request.mode);
        match request.mode {
            ProcessingMode::Summary => {
                self.group_stages(&groups, &mut output).await?;
                self.summary_stages(&mut output).await?;
            }
            ProcessingMode::ChapterMindmap => {
                self.group_stages(&groups, &mut output).await?;
                self.mindmap_stages(&mut output).await?;
            }
            ProcessingMode::WholeBookMindmap => self.whole_book_stage(&mut output).await?,
        }

        self.finish();
        Ok(output)
    }

    async fn group_stages(&mut self, groups: &[ChapterGroup], output: &mut PipelineOutput) -> PipelineResult<()> {
        let request = self.request;
        let chapters: HashMap<&str, &Chapter> = request.chapters.iter().map(|c| (c.id.as_str(), c)).collect();
        let (title, token) = (request.book.title.as_str(), request.book.token.as_str());
        let total = groups.len();

        for (index, group) in groups.iter().enumerate() {
            self.enter(PipelineState::PerGroupStage { index, total })?;
            self.observer.on_group_pending(index, group);

            let content = group_content(group, &chapters);
            let artifact = if request.mode == ProcessingMode::ChapterMindmap {
                let prompt = self.prompts.group_mindmap(title, group, &content);
                let target = StageTarget::entity(slots::CHAPTER_MINDMAP, token, &group.group_id);
                let map = self
                    .generate(target, &prompt, |text| extract_mindmap(text, ArtifactKind::ChapterMindmap))
                    .await?;
                GroupArtifact::MindMap(map)
            } else {
                let prompt = self.prompts.group_summary(title, group, &content);
                let target = StageTarget::entity(slots::CHAPTER_SUMMARY, token, &group.group_id);
                GroupArtifact::Summary(self.generate(target, &prompt, plain_text).await?)
            };

            self.observer.on_group_resolved(index, group, &artifact);
            output.groups.push(GroupResult {
                group: group.clone(),
                artifact,
            });
            self.advance();
        }
        Ok(())
    }

    async fn summary_stages(&mut self, output: &mut PipelineOutput) -> PipelineResult<()> {
        let request = self.request;
        let (title, token) = (request.book.title.as_str(), request.book.token.as_str());
        let summaries: Vec<(String, String)> = output
            .groups
            .iter()
            .filter_map(|result| match &result.artifact {
                GroupArtifact::Summary(text) => Some((result.group.display_name().to_string(), text.clone())),
                GroupArtifact::MindMap(_) => None,
            })
            .collect();

        self.enter(PipelineState::Connections)?;
        let prompt = self.prompts.connections(title, &summaries);
        let connections = self
            .generate(StageTarget::book(slots::CONNECTIONS, token), &prompt, plain_text)
            .await?;
        output.connections = Some(connections);
        self.advance();

        if self.settings.book_category == BookCategory::Fiction {
            self.enter(PipelineState::CharacterRelationship)?;
            let prompt = self.prompts.character_relationship(title, &summaries);
            let relationship = self
                .generate(StageTarget::book(slots::CHARACTER_RELATIONSHIP, token), &prompt, plain_text)
                .await?;
            output.character_relationship = Some(relationship);
            self.advance();
        } else {
            tracing::debug!(book = %token, "非虚构类书籍，跳过人物关系");
        }

        self.enter(PipelineState::OverallSummary)?;
        let prompt = self.prompts.overall_summary(title, &summaries);
        let overall = self
            .generate(StageTarget::book(slots::OVERALL_SUMMARY, token), &prompt, plain_text)
            .await?;
        output.overall_summary = Some(overall);
        self.advance();
        Ok(())
    }

    async fn mindmap_stages(&mut self, output: &mut PipelineOutput) -> PipelineResult<()> {
        let request = self.request;
        let (title, token) = (request.book.title.as_str(), request.book.token.as_str());

        self.enter(PipelineState::Merge)?;
        let parts: Vec<(&ChapterGroup, &MindMapData)> = output
            .groups
            .iter()
            .filter_map(|result| match &result.artifact {
                GroupArtifact::MindMap(map) => Some((&result.group, map)),
                GroupArtifact::Summary(_) => None,
            })
            .collect();
        self.drop_stale_merge(token, &parts).await;

        let observer = self.observer;
        let sink = move |partial: StagePartial| observer.on_partial(&partial);
        let merged = self
            .runner
            .resolve(
                StageTarget::book(slots::MERGED_MINDMAP, token),
                self.cancel,
                Some(&sink),
                async { Ok(merge_group_mindmaps(title, &parts)) },
            )
            .await?;
        self.advance();

        if !self.settings.generate_mindmap_arrows {
            output.mindmap = Some(merged);
            return Ok(());
        }

        self.enter(PipelineState::Arrows)?;
        let prompt = self.prompts.mindmap_arrows(title, &merged);
        let with_arrows = self
            .generate(StageTarget::book(slots::MINDMAP_ARROWS, token), &prompt, |text| {
                apply_arrows(text, &merged)
            })
            .await?;
        output.mindmap = Some(with_arrows);
        self.advance();
        Ok(())
    }

    /// 分组与缓存的合并图不一致时，删除合并图和关联箭头，让本次运行重新生成
    async fn drop_stale_merge(&self, token: &str, parts: &[(&ChapterGroup, &MindMapData)]) {
        let merged_key = ArtifactKey::book(token, ArtifactKind::MergedMindmap);
        let Some(cached) = self.runner.lookup::<MindMapData>(&merged_key).await else {
            return;
        };
        if merged_matches_groups(&cached, parts) {
            return;
        }

        tracing::warn!(
            book = %token,
            cached = cached.node_data.children.len(),
            groups = parts.len(),
            "合并思维导图与当前分组不一致，重新生成"
        );
        for key in [merged_key, ArtifactKey::book(token, ArtifactKind::MindmapArrows)] {
            if let Err(e) = self.runner.store().remove(&key.encode()).await {
                tracing::warn!(key = %key, error = %e, "删除过期缓存失败");
            }
        }
    }

    async fn whole_book_stage(&mut self, output: &mut PipelineOutput) -> PipelineResult<()> {
        let request = self.request;
        let (title, token) = (request.book.title.as_str(), request.book.token.as_str());

        self.enter(PipelineState::WholeBookMindmap)?;
        let content = request
            .chapters
            .iter()
            .map(|chapter| format!("## {}\n\n{}", chapter.title, chapter.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = self.prompts.whole_book_mindmap(title, &content);
        let map = self
            .generate(StageTarget::book(slots::COMBINED_MINDMAP, token), &prompt, |text| {
                extract_mindmap(text, ArtifactKind::CombinedMindmap)
            })
            .await?;
        output.mindmap = Some(map);
        self.advance();
        Ok(())
    }
}

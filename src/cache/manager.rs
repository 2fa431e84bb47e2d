use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::keys::{ArtifactKey, ArtifactKind};
use super::value::{slots, ArtifactPayload, ArtifactSlot, ValueShape};
use crate::error::StoreError;
use crate::pipeline::ProcessingMode;
use crate::store::ArtifactStore;

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub artifact: ArtifactKey,
    /// 值已无法读取时为 None
    pub shape: Option<ValueShape>,
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub books: usize,
    pub entries: usize,
    /// 无法解码的外部键
    pub foreign_keys: usize,
    pub by_kind: BTreeMap<ArtifactKind, usize>,
}

/// 书籍偏好：选中的章节、章节标签、自定义提示词
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookPreferences {
    pub selected_chapters: Vec<String>,
    pub chapter_tags: BTreeMap<String, String>,
    pub custom_prompt: Option<String>,
    pub use_custom_only: bool,
}

/// 缓存管理
///
/// 所有删除操作都只依赖键的编解码：遍历全部键、解码、过滤后逐个删除。
/// 无法解码的键不属于本系统，一律忽略。
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn ArtifactStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// 解码全部键
    async fn decoded_keys(&self) -> Result<Vec<(String, ArtifactKey)>, StoreError> {
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| ArtifactKey::decode(&key).map(|decoded| (key, decoded)))
            .collect())
    }

    /// 删除满足条件的键，返回删除数量
    async fn remove_where<F>(&self, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&ArtifactKey) -> bool,
    {
        let mut removed = 0;
        for (key, decoded) in self.decoded_keys().await? {
            if predicate(&decoded) && self.store.remove(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 删除单个章节/分组的某种产物
    pub async fn clear_chapter_cache(
        &self,
        book_token: &str,
        entity_id: &str,
        kind: ArtifactKind,
    ) -> Result<bool, StoreError> {
        let key = if kind.is_entity_scoped() {
            ArtifactKey::entity(book_token, kind, entity_id)
        } else {
            ArtifactKey::book(book_token, kind)
        };
        let removed = self.store.remove(&key.encode()).await?;
        tracing::debug!(key = %key, removed, "清除章节缓存");
        Ok(removed)
    }

    /// 删除某本书某种产物的全部条目（包括所有章节/分组）
    pub async fn clear_by_kind(&self, book_token: &str, kind: ArtifactKind) -> Result<usize, StoreError> {
        let removed = self
            .remove_where(|key| key.book_token == book_token && key.kind == kind)
            .await?;
        tracing::info!(book = %book_token, %kind, removed, "按类型清除缓存");
        Ok(removed)
    }

    /// 删除某本书在某个处理模式下产生的全部产物
    ///
    /// 偏好类条目不受影响
    pub async fn clear_by_book_and_mode(&self, book_token: &str, mode: ProcessingMode) -> Result<usize, StoreError> {
        let kinds = mode.artifact_kinds();
        let removed = self
            .remove_where(|key| key.book_token == book_token && kinds.contains(&key.kind))
            .await?;
        tracing::info!(book = %book_token, %mode, removed, "按模式清除缓存");
        Ok(removed)
    }

    /// 删除某本书的全部条目
    pub async fn clear_all_for_book(&self, book_token: &str) -> Result<usize, StoreError> {
        let removed = self.remove_where(|key| key.book_token == book_token).await?;
        tracing::info!(book = %book_token, removed, "清除书籍全部缓存");
        Ok(removed)
    }

    /// 按书籍列出全部条目
    pub async fn list_cache_by_book(&self) -> Result<BTreeMap<String, Vec<CacheEntry>>, StoreError> {
        let mut books: BTreeMap<String, Vec<CacheEntry>> = BTreeMap::new();
        for (key, decoded) in self.decoded_keys().await? {
            let shape = match self.store.get(&key).await {
                Ok(value) => value.map(|v| v.shape()),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "读取缓存条目失败");
                    None
                }
            };
            books.entry(decoded.book_token.clone()).or_default().push(CacheEntry {
                key,
                artifact: decoded,
                shape,
            });
        }
        Ok(books)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let keys = self.store.keys().await?;
        let mut stats = CacheStats::default();
        let mut books = std::collections::BTreeSet::new();

        for key in &keys {
            match ArtifactKey::decode(key) {
                Some(decoded) => {
                    stats.entries += 1;
                    *stats.by_kind.entry(decoded.kind).or_default() += 1;
                    books.insert(decoded.book_token);
                }
                None => stats.foreign_keys += 1,
            }
        }
        stats.books = books.len();
        Ok(stats)
    }

    async fn read<P: ArtifactPayload>(&self, book_token: &str, slot: ArtifactSlot<P>) -> Result<Option<P>, StoreError> {
        let key = ArtifactKey::book(book_token, slot.kind()).encode();
        Ok(self.store.get(&key).await?.and_then(P::from_value))
    }

    /// 写入偏好；`None` 表示删除该键
    async fn write<P: ArtifactPayload>(
        &self,
        book_token: &str,
        slot: ArtifactSlot<P>,
        payload: Option<P>,
    ) -> Result<(), StoreError> {
        let key = ArtifactKey::book(book_token, slot.kind()).encode();
        match payload {
            Some(payload) => self.store.set(&key, &payload.into_value()).await,
            None => self.store.remove(&key).await.map(|_| ()),
        }
    }

    /// 读取书籍偏好，缺失的项取默认值
    pub async fn load_preferences(&self, book_token: &str) -> Result<BookPreferences, StoreError> {
        Ok(BookPreferences {
            selected_chapters: self
                .read(book_token, slots::SELECTED_CHAPTERS)
                .await?
                .unwrap_or_default(),
            chapter_tags: self.read(book_token, slots::CHAPTER_TAGS).await?.unwrap_or_default(),
            custom_prompt: self.read(book_token, slots::CUSTOM_PROMPT).await?,
            use_custom_only: self.read(book_token, slots::USE_CUSTOM_ONLY).await?.unwrap_or(false),
        })
    }

    /// 保存书籍偏好；空列表、空映射、空提示词和 false 会删除对应键
    pub async fn save_preferences(&self, book_token: &str, preferences: &BookPreferences) -> Result<(), StoreError> {
        let selected = Some(preferences.selected_chapters.clone()).filter(|s| !s.is_empty());
        let tags = Some(preferences.chapter_tags.clone()).filter(|t| !t.is_empty());
        let prompt = preferences.custom_prompt.clone().filter(|p| !p.trim().is_empty());
        let custom_only = Some(true).filter(|_| preferences.use_custom_only);

        self.write(book_token, slots::SELECTED_CHAPTERS, selected).await?;
        self.write(book_token, slots::CHAPTER_TAGS, tags).await?;
        self.write(book_token, slots::CUSTOM_PROMPT, prompt).await?;
        self.write(book_token, slots::USE_CUSTOM_ONLY, custom_only).await?;
        tracing::debug!(book = %book_token, "已保存书籍偏好");
        Ok(())
    }
}

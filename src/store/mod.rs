use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::cache::value::ArtifactValue;
use crate::error::StoreError;

pub mod sqlite;

pub use sqlite::SqliteArtifactStore;

/// 产物存储 trait
///
/// 异步键值存储，不支持前缀查询；按书籍查找时需要遍历 `keys()` 并解码
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// 读取键对应的值，不存在时返回 None
    async fn get(&self, key: &str) -> Result<Option<ArtifactValue>, StoreError>;

    /// 写入键值；一次调用就是一次原子写入
    async fn set(&self, key: &str, value: &ArtifactValue) -> Result<(), StoreError>;

    /// 删除键，返回该键原本是否存在
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// 列出所有键
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// 清空存储
    async fn clear(&self) -> Result<(), StoreError>;
}

/// 内存存储
///
/// 用于测试和一次性运行
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<String, ArtifactValue>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前条目数量
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &str) -> Result<Option<ArtifactValue>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &ArtifactValue) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

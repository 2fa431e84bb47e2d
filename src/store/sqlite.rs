use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::ArtifactStore;
use crate::cache::value::ArtifactValue;
use crate::error::StoreError;

/// 初始化产物数据库
pub fn init_db<P: AsRef<Path>>(path: P) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("PRAGMA encoding = 'UTF-8'", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS artifacts (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// SQLite 产物存储
///
/// 值以 JSON 存储；rusqlite 是同步接口，所有操作都在 `spawn_blocking` 中执行
#[derive(Clone)]
pub struct SqliteArtifactStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteArtifactStore {
    /// 打开（或创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = init_db(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 键的最后写入时间
    pub async fn updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT updated_at FROM artifacts WHERE key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }))
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn get(&self, key: &str) -> Result<Option<ArtifactValue>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM artifacts WHERE key = ?1", [&key], |row| {
                    row.get(0)
                })
                .optional()?;
            match raw {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &ArtifactValue) -> Result<(), StoreError> {
        let key = key.to_string();
        let json = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO artifacts (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, json, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute("DELETE FROM artifacts WHERE key = ?1", [&key])?;
            Ok(affected > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM artifacts ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM artifacts", [])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::value::{MindMapData, MindMapNode};

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store
            .set("book:overall-summary", &ArtifactValue::Text("第一版".into()))
            .await
            .unwrap();
        store
            .set("book:overall-summary", &ArtifactValue::Text("第二版".into()))
            .await
            .unwrap();

        assert_eq!(
            store.get("book:overall-summary").await.unwrap(),
            Some(ArtifactValue::Text("第二版".into()))
        );
        assert_eq!(store.keys().await.unwrap().len(), 1);
        assert!(store.updated_at("book:overall-summary").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("artifacts.db");
        let map = MindMapData::new(MindMapNode::new("root", "书名"));

        {
            let store = SqliteArtifactStore::open(&path).unwrap();
            store
                .set("book:merged-mindmap", &ArtifactValue::MindMap(map.clone()))
                .await
                .unwrap();
        }

        let store = SqliteArtifactStore::open(&path).unwrap();
        assert_eq!(
            store.get("book:merged-mindmap").await.unwrap(),
            Some(ArtifactValue::MindMap(map))
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        store.set("a", &ArtifactValue::Flag(true)).await.unwrap();
        store.set("b", &ArtifactValue::Flag(true)).await.unwrap();

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.keys().await.unwrap(), vec!["b".to_string()]);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_error() {
        let store = SqliteArtifactStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO artifacts (key, value, updated_at) VALUES ('k', 'not json', '')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Serialization(_))
        ));
    }
}

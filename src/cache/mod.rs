//! 缓存：键的编解码、值的形态、按书籍/模式/类型的批量管理

pub mod keys;
pub mod manager;
pub mod value;

pub use keys::{book_token, ArtifactKey, ArtifactKind};
pub use manager::{BookPreferences, CacheEntry, CacheManager, CacheStats};
pub use value::{slots, ArtifactPayload, ArtifactSlot, ArtifactValue, MindMapData, MindMapNode, ValueShape};

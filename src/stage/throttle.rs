use std::time::{Duration, Instant};

use crate::generation::GenerationChunk;

/// 默认推送间隔
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// 累积内容快照
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSnapshot {
    pub content: String,
    pub reasoning: String,
}

/// 流式输出合并器
///
/// 在内存中累积分片，按以下规则决定何时推送给观察者：
/// - 第一个分片立即推送
/// - 距上次推送超过 `interval` 时推送
/// - 结束时无条件推送最终结果
///
/// 时间由调用方传入，因此可以用任意时间序列测试
#[derive(Debug)]
pub struct StreamCoalescer {
    interval: Duration,
    content: String,
    reasoning: String,
    last_flush: Option<Instant>,
}

impl StreamCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            content: String::new(),
            reasoning: String::new(),
            last_flush: None,
        }
    }

    /// 追加一个分片；需要推送时返回当前快照
    pub fn push(&mut self, chunk: &GenerationChunk, now: Instant) -> Option<StreamSnapshot> {
        self.content.push_str(&chunk.content_delta);
        self.reasoning.push_str(&chunk.reasoning_delta);

        let due = match self.last_flush {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if due {
            self.last_flush = Some(now);
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// 结束累积，返回最终快照
    pub fn finish(self) -> StreamSnapshot {
        StreamSnapshot {
            content: self.content,
            reasoning: self.reasoning,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
        }
    }
}

/// 对带时间偏移的分片序列应用合并策略，返回所有推送的快照（最后一个为最终值）
pub fn coalesce(chunks: &[(Duration, GenerationChunk)], interval: Duration) -> Vec<StreamSnapshot> {
    let start = Instant::now();
    let mut coalescer = StreamCoalescer::new(interval);
    let mut flushes: Vec<StreamSnapshot> = chunks
        .iter()
        .filter_map(|(offset, chunk)| coalescer.push(chunk, start + *offset))
        .collect();
    flushes.push(coalescer.finish());
    flushes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64, text: &str) -> (Duration, GenerationChunk) {
        (Duration::from_millis(ms), GenerationChunk::content(text))
    }

    fn contents(flushes: &[StreamSnapshot]) -> Vec<&str> {
        flushes.iter().map(|f| f.content.as_str()).collect()
    }

    #[test]
    fn test_first_chunk_flushes_immediately() {
        let flushes = coalesce(&[at(0, "a")], DEFAULT_FLUSH_INTERVAL);
        assert_eq!(contents(&flushes), vec!["a", "a"]);
    }

    #[test]
    fn test_chunks_within_interval_are_coalesced() {
        let chunks = [at(0, "a"), at(100, "b"), at(200, "c"), at(900, "d")];
        let flushes = coalesce(&chunks, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(contents(&flushes), vec!["a", "abcd"]);
    }

    #[test]
    fn test_interval_boundary_flushes() {
        let chunks = [at(0, "a"), at(500, "b"), at(1000, "c"), at(1500, "d"), at(2100, "e")];
        let flushes = coalesce(&chunks, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(contents(&flushes), vec!["a", "abc", "abcde", "abcde"]);
    }

    #[test]
    fn test_final_value_is_exact() {
        let chunks: Vec<_> = (0..50).map(|i| at(i * 10, "字")).collect();
        let flushes = coalesce(&chunks, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(flushes.last().unwrap().content, "字".repeat(50));
        assert_eq!(flushes.len(), 2);
    }

    #[test]
    fn test_reasoning_is_accumulated_separately() {
        let chunks = [
            (Duration::ZERO, GenerationChunk::reasoning("思考")),
            (Duration::from_millis(10), GenerationChunk::content("答案")),
        ];
        let flushes = coalesce(&chunks, DEFAULT_FLUSH_INTERVAL);
        let last = flushes.last().unwrap();
        assert_eq!(last.reasoning, "思考");
        assert_eq!(last.content, "答案");
        assert_eq!(flushes[0].content, "");
    }

    #[test]
    fn test_empty_stream_still_finishes() {
        let flushes = coalesce(&[], DEFAULT_FLUSH_INTERVAL);
        assert_eq!(flushes, vec![StreamSnapshot::default()]);
    }
}

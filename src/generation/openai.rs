use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;

use super::{ChunkStream, GenerationChunk, GenerationProvider, GenerationRequest};
use crate::config::{ConfigHandle, ProviderSettings};
use crate::error::{PipelineError, PipelineResult};

/// OpenAI 兼容的生成服务
///
/// 每次请求都从 `ConfigHandle` 读取当前的地址、密钥和模型
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    config: ConfigHandle,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// SSE 行解析结果
#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// SSE 字节流解码器
///
/// 按字节缓存并以 `\n` 切分，只解码完整的行。多字节字符或 `data:` 行
/// 跨网络分片时，不完整的部分留到下一个分片再处理。
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// 追加一个网络分片，返回其中已完整的事件
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line);

            let Some(payload) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                events.push(SseEvent::Done);
                break;
            }
            if !payload.is_empty() {
                events.push(SseEvent::Data(payload.to_string()));
            }
        }

        events
    }
}

fn parse_stream_payload(payload: &str) -> PipelineResult<GenerationChunk> {
    let response: StreamResponse = serde_json::from_str(payload)
        .map_err(|e| PipelineError::Transport(format!("无法解析流式响应: {}", e)))?;

    let mut chunk = GenerationChunk::default();
    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            chunk.content_delta.push_str(&content);
        }
        if let Some(reasoning) = choice.delta.reasoning_content {
            chunk.reasoning_delta.push_str(&reasoning);
        }
    }
    Ok(chunk)
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request_body(settings: &ProviderSettings, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": settings.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "stream": stream,
        });
        if let Some(temperature) = settings.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    async fn send(&self, request: &GenerationRequest, stream: bool) -> PipelineResult<reqwest::Response> {
        let settings = self.config.snapshot().provider;
        let url = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));

        tracing::debug!(kind = %request.kind, model = %settings.model, stream, "请求生成服务");

        let mut builder = self
            .client
            .post(&url)
            .json(&Self::request_body(&settings, request, stream))
            .timeout(Duration::from_secs(settings.timeout_secs));
        if let Some(key) = &settings.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transport(format!(
                "生成服务返回错误 ({}): {}",
                status, body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    async fn generate(&self, request: &GenerationRequest) -> PipelineResult<String> {
        let response: CompletionResponse = self.send(request, false).await?.json().await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> PipelineResult<ChunkStream> {
        let response = self.send(request, true).await?;

        Ok(Box::pin(stream! {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut finished = false;

            while !finished {
                let Some(next) = bytes.next().await else {
                    break;
                };
                match next {
                    Ok(data) => {
                        for event in decoder.push(&data) {
                            match event {
                                SseEvent::Done => finished = true,
                                SseEvent::Data(payload) => yield parse_stream_payload(&payload),
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(PipelineError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        }))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

//! Streaming model client — OpenAI-compatible Chat Completions over SSE.
//!
//! The conversation layer only sees [`TextSource`]: a system instruction,
//! replayed history and a prompt go in, a stream of text increments (plus
//! any web citations) comes out.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::{error, info};

use crate::config::Config;
use crate::types::{GroundingSource, HistoryEntry, Role};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub system_instruction: String,
    pub history: Vec<HistoryEntry>,
    pub prompt: String,
}

/// One increment of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

impl StreamChunk {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            sources: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.sources.is_empty()
    }
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait TextSource: Send + Sync {
    async fn stream_reply(&self, request: &ChatRequest) -> Result<TextStream>;
}

/// Build the configured source, or `None` when no credential is available.
/// Only the `custom` provider (local servers) may run without a key.
pub fn from_config(config: &Config) -> Option<Arc<dyn TextSource>> {
    if config.api_key.is_none() && config.provider != "custom" {
        info!("No API key for provider '{}', assistant unavailable", config.provider);
        return None;
    }
    match OpenAiCompatSource::new(config) {
        Ok(source) => Some(Arc::new(source)),
        Err(e) => {
            error!("Failed to build model client: {:#}", e);
            None
        }
    }
}

// ── Chat Completions ──

pub struct OpenAiCompatSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    provider: String,
    model: String,
    max_output_tokens: u32,
    web_search: bool,
}

impl OpenAiCompatSource {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            provider: config.provider.clone(),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            web_search: config.web_search,
        })
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_messages(request),
            "max_tokens": self.max_output_tokens,
            "stream": true,
        });
        if self.web_search && self.provider == "openrouter" {
            body["plugins"] = json!([{ "id": "web" }]);
        }
        body
    }
}

/// System instruction, replayed history, then the new prompt.
fn build_messages(request: &ChatRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(json!({"role": "system", "content": request.system_instruction}));
    for entry in &request.history {
        let role = match entry.role {
            Role::User => "user",
            Role::Model => "assistant",
        };
        messages.push(json!({"role": role, "content": entry.text}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));
    messages
}

#[async_trait]
impl TextSource for OpenAiCompatSource {
    async fn stream_reply(&self, request: &ChatRequest) -> Result<TextStream> {
        let body = self.request_body(request);
        info!(
            "stream request: model={} provider={} history={}",
            self.model,
            self.provider,
            request.history.len()
        );

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.context("HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("API HTTP {}: {} | url={}", status, truncate(&text, 500), self.url);
            anyhow::bail!("API call failed: HTTP {} — {}", status, truncate(&text, 200));
        }

        Ok(sse_chunks(Box::pin(response.bytes_stream())))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ── SSE decoding ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental `text/event-stream` line decoder. Bytes may arrive split
/// anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else if data.is_empty() {
        None
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

/// Pull text and citations out of one Chat Completions stream payload.
pub fn parse_stream_payload(payload: &serde_json::Value) -> Result<StreamChunk> {
    if let Some(err) = payload.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| err.to_string());
        anyhow::bail!("{}", message);
    }

    let choice = &payload["choices"][0];
    let delta = choice.get("delta").unwrap_or(&choice["message"]);
    let text = delta
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let sources = delta
        .get("annotations")
        .and_then(|v| v.as_array())
        .map(|annotations| {
            annotations
                .iter()
                .filter(|a| a.get("type").and_then(|v| v.as_str()) == Some("url_citation"))
                .filter_map(|a| {
                    let cite = a.get("url_citation")?;
                    Some(GroundingSource {
                        uri: cite.get("url")?.as_str()?.to_string(),
                        title: cite.get("title").and_then(|v| v.as_str()).map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(StreamChunk { text, sources })
}

struct SseState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamChunk>>,
    finished: bool,
}

impl<S> SseState<S> {
    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                break;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(data) => {
                    let chunk = serde_json::from_str::<serde_json::Value>(&data)
                        .context("Malformed stream payload")
                        .and_then(|v| parse_stream_payload(&v));
                    match chunk {
                        Ok(c) if c.is_empty() => {}
                        Ok(c) => self.pending.push_back(Ok(c)),
                        Err(e) => {
                            self.pending.push_back(Err(e));
                            self.finished = true;
                        }
                    }
                }
            }
        }
    }
}

/// Turn a raw byte stream into a stream of decoded chunks. Ends at
/// `[DONE]`, at end of input, or after the first error.
pub fn sse_chunks<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = SseState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(bytes)) => {
                    let events = st.decoder.push(bytes.as_ref());
                    st.absorb(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(anyhow::Error::new(e).context("Stream read failed")), st));
                }
                None => {
                    let events = st.decoder.finish();
                    st.absorb(events);
                    st.finished = true;
                }
            }
        }
    });
    Box::pin(stream)
}

// ── Test double ──

#[cfg(test)]
pub(crate) mod scripted {
    //! Scripted [`TextSource`] for conversation and session tests.

    use std::sync::Mutex;

    use super::*;

    pub enum Reply {
        /// Yield these chunks, then end.
        Chunks(Vec<StreamChunk>),
        /// Yield these chunks, then never end.
        Hang(Vec<StreamChunk>),
        /// Yield these chunks, then fail.
        Interrupted(Vec<StreamChunk>, String),
        /// Fail before streaming.
        Fail(String),
    }

    impl Reply {
        pub fn text(text: &str) -> Self {
            Reply::Chunks(vec![StreamChunk::text(text)])
        }
    }

    #[derive(Default)]
    pub struct ScriptedSource {
        replies: Mutex<VecDeque<Reply>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedSource {
        pub fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextSource for ScriptedSource {
        async fn stream_reply(&self, request: &ChatRequest) -> Result<TextStream> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Reply::text(""));
            match reply {
                Reply::Chunks(chunks) => Ok(Box::pin(futures::stream::iter(
                    chunks.into_iter().map(Ok),
                ))),
                Reply::Hang(chunks) => Ok(Box::pin(
                    futures::stream::iter(chunks.into_iter().map(Ok))
                        .chain(futures::stream::pending()),
                )),
                Reply::Interrupted(chunks, message) => Ok(Box::pin(
                    futures::stream::iter(chunks.into_iter().map(Ok))
                        .chain(futures::stream::once(async move {
                            Err(anyhow::anyhow!(message))
                        })),
                )),
                Reply::Fail(message) => Err(anyhow::anyhow!(message)),
            }
        }
    }
}

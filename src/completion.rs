use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::mcp::McpToolDefinition;
use crate::session::{ChatMessage, ChatRole};
use crate::settings::{CompletionParams, CompletionSettings};

/// Lazily produced text chunks of one streamed completion. Dropping it closes the
/// underlying connection.
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<String>;
    async fn stream(&self, messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<TokenStream>;
}

#[derive(Clone)]
pub struct OpenAICompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    params: CompletionParams,
}

impl OpenAICompatible {
    pub fn new(settings: CompletionSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url,
            api_key: settings.api_key,
            model: settings.model,
            params: settings.params,
        }
    }

    fn request<'a>(&'a self, messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>, stream: bool) -> OaiChatRequest<'a> {
        OaiChatRequest {
            model: &self.model,
            messages: messages.iter().map(message_json).collect(),
            tools: tools.filter(|t| !t.is_empty()).map(|t| t.iter().map(tool_json).collect()),
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
            stream,
        }
    }

    async fn post(&self, body: &OaiChatRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut rb = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }
        Ok(resp)
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")] tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")] stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

#[derive(Debug, Deserialize)]
struct OaiStreamChunk {
    #[serde(default)]
    choices: Vec<OaiStreamChoice>,
}

/// Final chunks may carry only a `finish_reason` and no delta.
#[derive(Debug, Deserialize)]
struct OaiStreamChoice {
    #[serde(default)]
    delta: OaiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OaiDelta { content: Option<String> }

fn message_json(m: &ChatMessage) -> Value {
    match m.role {
        ChatRole::System => json!({ "role": "system", "content": m.content }),
        ChatRole::User => json!({ "role": "user", "content": m.content }),
        ChatRole::Assistant => json!({ "role": "assistant", "content": m.content }),
        ChatRole::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
            "content": m.content,
        }),
    }
}

fn tool_json(t: &McpToolDefinition) -> Value {
    let mut function = json!({ "name": t.name, "description": t.description });
    match t.input_schema.as_deref().map(serde_json::from_str::<Value>) {
        Some(Ok(schema)) => function["parameters"] = schema,
        Some(Err(err)) => tracing::debug!(tool = %t.name, error = %err, "dropping unparseable input schema"),
        None => {}
    }
    json!({ "type": "function", "function": function })
}

#[async_trait]
impl CompletionBackend for OpenAICompatible {
    async fn complete(&self, messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<String> {
        let resp = self.post(&self.request(messages, tools, false)).await?;
        let v: OaiChatResponse = resp.json().await?;
        Ok(v.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default())
    }

    async fn stream(&self, messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<TokenStream> {
        let resp = self.post(&self.request(messages, tools, true)).await?;
        Ok(sse_tokens(resp.bytes_stream().boxed()))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> anyhow::Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else { return Ok(SseLine::Skip) };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    let chunk: OaiStreamChunk = serde_json::from_str(data)?;
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Ok(SseLine::Token(text)),
        _ => Ok(SseLine::Skip),
    }
}

struct SseState<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl<S> SseState<S> {
    /// Moves every complete line out of the buffer. With `flush`, a trailing
    /// line without a newline is taken too.
    fn drain_lines(&mut self, flush: bool) -> anyhow::Result<()> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.take_line(&line)?;
            if self.done {
                return Ok(());
            }
        }
        if flush && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.take_line(&line)?;
        }
        Ok(())
    }

    fn take_line(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let line = std::str::from_utf8(raw)?.trim_end_matches(['\r', '\n']);
        match parse_sse_line(line)? {
            SseLine::Token(t) => self.pending.push_back(t),
            SseLine::Done => self.done = true,
            SseLine::Skip => {}
        }
        Ok(())
    }
}

/// Turns a chat-completions SSE body into its content deltas, ending at `[DONE]`
/// or at the end of the body.
fn sse_tokens<S, B, E>(body: S) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = SseState { body, buffer: Vec::new(), pending: VecDeque::new(), done: false };
    stream::try_unfold(state, next_token).boxed()
}

async fn next_token<S, B, E>(mut st: SseState<S>) -> anyhow::Result<Option<(String, SseState<S>)>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    loop {
        if let Some(token) = st.pending.pop_front() {
            return Ok(Some((token, st)));
        }
        if st.done {
            return Ok(None);
        }
        match st.body.next().await {
            Some(chunk) => {
                st.buffer.extend_from_slice(chunk?.as_ref());
                st.drain_lines(false)?;
            }
            None => {
                st.drain_lines(true)?;
                st.done = true;
            }
        }
    }
}

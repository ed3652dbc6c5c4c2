use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Options for single-shot summarization calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Options for the main streaming thought request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub frequency_penalty: f32,
    pub repeat_penalty: f32,
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The language-model capability the agent depends on.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Single-shot completion of a bare prompt.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;

    /// Streaming chat completion. Each item is one generated text fragment.
    async fn chat_stream(&self, messages: &[Message], options: &ChatOptions)
        -> Result<FragmentStream>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for a single-shot completion. Streams run as long as the
/// model keeps producing.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(180);

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("HTTP client builder failed ({}), using defaults", e);
            reqwest::Client::new()
        })
}

/// OpenAI-compatible client (Ollama, LM Studio, vLLM, OpenAI, etc.)
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            client: build_http_client(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(
        &self,
        request: &ChatCompletionRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(request);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        // Local models usually run without a key
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let messages = [Message::user(prompt)];
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
            frequency_penalty: None,
            repeat_penalty: None,
            stream: false,
        };

        let completion: ChatCompletionResponse = self
            .post(&request, Some(GENERATE_TIMEOUT))
            .await?
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<FragmentStream> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: Some(options.temperature),
            max_tokens: None,
            frequency_penalty: Some(options.frequency_penalty),
            repeat_penalty: Some(options.repeat_penalty),
            stream: true,
        };

        let response = self.post(&request, None).await?;
        tracing::debug!("Opened thought stream ({} messages)", messages.len());

        let state = SseState {
            response,
            decoder: SseDecoder::default(),
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(fragment) = state.decoder.ready.pop_front() {
                    return Some((Ok(fragment), state));
                }
                if state.decoder.finished {
                    return None;
                }

                match state.response.chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = state.decoder.push(&chunk) {
                            state.decoder.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                    Ok(None) => {
                        state.decoder.finished = true;
                    }
                    Err(e) => {
                        state.decoder.finished = true;
                        return Some((
                            Err(anyhow::Error::new(e).context("Failed reading streaming chunk")),
                            state,
                        ));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

struct SseState {
    response: reqwest::Response,
    decoder: SseDecoder,
}

/// Splits raw server-sent-event bytes into content fragments.
#[derive(Debug, Default)]
struct SseDecoder {
    /// Raw bytes, so multibyte characters split across chunks survive.
    line_buffer: Vec<u8>,
    ready: VecDeque<String>,
    finished: bool,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.line_buffer.extend_from_slice(chunk);

        while let Some(newline_idx) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.line_buffer.drain(..=newline_idx).collect();
            let line = String::from_utf8_lossy(&raw);

            match parse_sse_line(line.trim())? {
                SseLine::Fragment(fragment) => self.ready.push_back(fragment),
                SseLine::Done => {
                    self.finished = true;
                    break;
                }
                SseLine::Skip => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseLine::Skip);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };

    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk_json: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

    let content = chunk_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|choice| choice["delta"]["content"].as_str());

    Ok(match content {
        Some(text) if !text.is_empty() => SseLine::Fragment(text.to_string()),
        _ => SseLine::Skip,
    })
}

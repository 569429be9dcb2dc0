//! Streamed chat completion against an OpenAI-compatible endpoint.
//!
//! ```text
//! PromptBundle + max_tokens
//!   → budget guard (no request when max_tokens <= 0)
//!   → POST {base_url}/chat/completions  (stream=true, stop=["```\n"])
//!   → fold SSE `data:` chunks into one String
//!   → extract_code_block(accumulated)
//! ```
//!
//! The stop sequence is the closing fence, so the server halts as soon as
//! the code block ends instead of spending tokens on trailing prose. Most
//! servers drop the stop sequence from the output, which is why extraction
//! also accepts a fence that opens and never closes.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::errors::GenerationError;
use crate::types::{CompletionResult, Extraction, PromptBundle};

/// Closing fence followed by a newline: generation stops once a block closes.
pub const CLOSING_FENCE_STOP: &str = "```\n";

/// Upper bound on a single streamed request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Error bodies are cut to this many bytes in messages.
const MAX_ERROR_BODY: usize = 512;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[\w+.#-]*[ \t]*\r?\n(.*?)```").expect("FENCED_BLOCK regex should compile")
});

static OPEN_FENCE_TO_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[\w+.#-]*[ \t]*\r?\n(.*)\z")
        .expect("OPEN_FENCE_TO_END regex should compile")
});

// ── Client trait ────────────────────────────────────────────────────────────

/// Sends one prompt and returns the extracted completion.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// `max_tokens <= 0` fails with `BudgetExceeded` before any request.
    async fn complete(
        &self,
        prompt: &PromptBundle,
        max_tokens: i64,
    ) -> Result<CompletionResult, GenerationError>;
}

/// Reject non-positive budgets; otherwise clamp to the wire type.
pub fn ensure_budget(max_tokens: i64) -> Result<u32, GenerationError> {
    if max_tokens <= 0 {
        return Err(GenerationError::BudgetExceeded {
            remaining: max_tokens,
        });
    }
    Ok(u32::try_from(max_tokens).unwrap_or(u32::MAX))
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    stream: bool,
    stop: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

// ── OpenAI-compatible client ────────────────────────────────────────────────

/// Streaming client for `/chat/completions` (vLLM, TGI, llama.cpp, OpenAI).
pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletionClient {
    /// Credentials come from the config value, never from ambient state.
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, GenerationError> {
        let base_url = endpoint
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| GenerationError::Configuration("endpoint base_url missing".into()))?;
        let api_key = endpoint
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GenerationError::Configuration("endpoint api_key missing".into()))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GenerationError::Configuration(format!("http client build failed: {e}")))?;

        Ok(Self {
            http,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: endpoint.model.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn complete(
        &self,
        prompt: &PromptBundle,
        max_tokens: i64,
    ) -> Result<CompletionResult, GenerationError> {
        let max_tokens = ensure_budget(max_tokens)?;

        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens,
            stream: true,
            stop: [CLOSING_FENCE_STOP],
        };

        debug!(url = %self.url, max_tokens, "opening completion stream");
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service(format!(
                "HTTP {status}: {}",
                truncate(&text, MAX_ERROR_BODY)
            )));
        }

        let raw = accumulate_stream(response.bytes_stream()).await?;
        let result = extract_code_block(&raw);
        if result.is_fallback() {
            warn!(chars = raw.len(), "ExtractionFallback: no fenced block, using raw output");
        }
        Ok(result)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Stream folding ──────────────────────────────────────────────────────────

/// Incremental server-sent-events decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; bytes are held
/// until a full line is available.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    pending: Vec<u8>,
    content: String,
    fragments: usize,
    done: bool,
}

impl SseAccumulator {
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), GenerationError> {
        if self.done {
            return Ok(());
        }
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&line)?;
            if self.done {
                self.pending.clear();
                break;
            }
        }
        Ok(())
    }

    /// Flush a trailing unterminated line and return the concatenated text.
    pub fn finish(mut self) -> Result<String, GenerationError> {
        if !self.done && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line)?;
        }
        debug!(fragments = self.fragments, chars = self.content.len(), done = self.done, "stream finished");
        Ok(self.content)
    }

    fn handle_line(&mut self, raw: &[u8]) -> Result<(), GenerationError> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| GenerationError::Service(format!("stream is not UTF-8: {e}")))?
            .trim_end();

        // Blank separators, `event:`, `id:` and `:` comments carry no content.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim_start();
        if data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let chunk: ChatChunk = serde_json::from_str(data)
            .map_err(|e| GenerationError::Service(format!("malformed stream chunk: {e}")))?;
        if let Some(err) = chunk.error {
            return Err(GenerationError::Service(format!("stream error event: {err}")));
        }

        // Role-only and empty deltas are expected, e.g. the first chunk.
        if let Some(text) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
            self.fragments += 1;
            self.content.push_str(&text);
        }
        Ok(())
    }
}

/// Fold a byte stream of SSE chunks into the concatenated delta content.
pub async fn accumulate_stream<S, B, E>(stream: S) -> Result<String, GenerationError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let accumulator = stream
        .map_err(|e| GenerationError::Service(format!("stream read failed: {e}")))
        .try_fold(SseAccumulator::default(), |mut acc, chunk| async move {
            acc.feed(chunk.as_ref()).map(|()| acc)
        })
        .await?;
    accumulator.finish()
}

// ── Extraction ──────────────────────────────────────────────────────────────

/// Interior of the first fenced block, or the raw text when none is found.
///
/// A fence that opens but never closes yields everything after the opening
/// line, since the closing fence is the stop sequence. A trailing fence with
/// nothing after it is a stray closer, not an opener.
pub fn extract_code_block(raw: &str) -> CompletionResult {
    if let Some(body) = FENCED_BLOCK.captures(raw).and_then(|c| c.get(1)) {
        return CompletionResult {
            text: body.as_str().to_string(),
            extraction: Extraction::Fenced,
        };
    }
    if let Some(body) = OPEN_FENCE_TO_END
        .captures(raw)
        .and_then(|c| c.get(1))
        .filter(|m| !m.as_str().trim().is_empty())
    {
        return CompletionResult {
            text: body.as_str().to_string(),
            extraction: Extraction::Unterminated,
        };
    }
    CompletionResult {
        text: raw.to_string(),
        extraction: Extraction::Raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_fenced_block() {
        let raw = "intro text\n```go\nfunc X(){}\n```\ntrailer";
        let result = extract_code_block(raw);
        assert_eq!(result.text, "func X(){}\n");
        assert_eq!(result.extraction, Extraction::Fenced);
    }

    #[test]
    fn no_fence_returns_raw_verbatim() {
        let raw = "package services_test\n\nfunc TestX(t *testing.T) {}\n";
        let result = extract_code_block(raw);
        assert_eq!(result.text, raw);
        assert!(result.is_fallback());
    }

    #[test]
    fn untagged_fence_is_extracted() {
        let result = extract_code_block("```\nfunc A() {}\n```");
        assert_eq!(result.text, "func A() {}\n");
    }

    #[test]
    fn only_first_block_is_used() {
        let raw = "```go\nfirst\n```\nand\n```go\nsecond\n```\n";
        assert_eq!(extract_code_block(raw).text, "first\n");
    }

    #[test]
    fn indented_fence_is_extracted() {
        let raw = " Here are the tests.\n\n     ```go\n     package worker_test\n     ```";
        assert_eq!(extract_code_block(raw).text, "     package worker_test\n     ");
    }

    #[test]
    fn stop_sequence_swallowed_closing_fence() {
        let raw = "Here you go:\n```go\npackage dao_test\n\nfunc TestGet(t *testing.T) {}\n";
        let result = extract_code_block(raw);
        assert_eq!(result.text, "package dao_test\n\nfunc TestGet(t *testing.T) {}\n");
        assert_eq!(result.extraction, Extraction::Unterminated);
    }

    #[test]
    fn stray_trailing_fence_keeps_raw_text() {
        let raw = "package x_test\n\nfunc TestA(t *testing.T) {}\n```\n";
        let result = extract_code_block(raw);
        assert_eq!(result.text, raw);
        assert_eq!(result.extraction, Extraction::Raw);
    }

    #[test]
    fn empty_open_fence_keeps_raw_text() {
        let raw = "Here are the tests:\n```\n";
        let result = extract_code_block(raw);
        assert_eq!(result.text, raw);
        assert!(result.is_fallback());
    }

    #[test]
    fn budget_guard_rejects_non_positive() {
        assert!(matches!(
            ensure_budget(0),
            Err(GenerationError::BudgetExceeded { remaining: 0 })
        ));
        assert!(matches!(
            ensure_budget(-15),
            Err(GenerationError::BudgetExceeded { remaining: -15 })
        ));
        assert_eq!(ensure_budget(6_600).unwrap(), 6_600);
    }

    #[test]
    fn accumulator_concatenates_deltas() {
        let mut acc = SseAccumulator::default();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n")
            .unwrap();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n")
            .unwrap();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n")
            .unwrap();
        acc.feed(b"data: [DONE]\n\n").unwrap();
        assert_eq!(acc.finish().unwrap(), "Hello world");
    }

    #[test]
    fn accumulator_handles_split_lines() {
        let mut acc = SseAccumulator::default();
        acc.feed(b"data: {\"choices\":[{\"del").unwrap();
        acc.feed(b"ta\":{\"content\":\"func\"}}]}\r\n").unwrap();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"content\":null}}]}\n")
            .unwrap();
        acc.feed(b"data: {\"choices\":[]}\n").unwrap();
        acc.feed(b": keep-alive\n").unwrap();
        assert_eq!(acc.finish().unwrap(), "func");
    }

    #[test]
    fn accumulator_ignores_data_after_done() {
        let mut acc = SseAccumulator::default();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n")
            .unwrap();
        assert_eq!(acc.finish().unwrap(), "a");
    }

    #[test]
    fn accumulator_flushes_unterminated_last_line() {
        let mut acc = SseAccumulator::default();
        acc.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
            .unwrap();
        assert_eq!(acc.finish().unwrap(), "tail");
    }

    #[test]
    fn malformed_chunk_is_service_error() {
        let mut acc = SseAccumulator::default();
        let err = acc.feed(b"data: {oops\n").unwrap_err();
        assert!(matches!(err, GenerationError::Service(_)));
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn error_event_is_service_error() {
        let mut acc = SseAccumulator::default();
        let err = acc
            .feed(b"data: {\"error\":\"Input validation error\",\"error_type\":\"validation\"}\n")
            .unwrap_err();
        assert!(err.to_string().contains("Input validation error"));
    }

    #[tokio::test]
    async fn accumulate_stream_folds_chunks() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"```go\\n\"}}]}\n"[..]),
            Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"func X(){}\\n\"}}]}\n"[..]),
            Ok(&b"data: [DONE]\n"[..]),
        ];
        let text = accumulate_stream(futures::stream::iter(chunks)).await.unwrap();
        assert_eq!(text, "```go\nfunc X(){}\n");
    }

    #[tokio::test]
    async fn accumulate_stream_propagates_read_errors() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"[..]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let err = accumulate_stream(futures::stream::iter(chunks)).await.unwrap_err();
        assert!(matches!(err, GenerationError::Service(_)));
    }

    #[test]
    fn client_requires_credentials() {
        let endpoint = EndpointConfig {
            base_url: Some("http://localhost:8080/v1".into()),
            api_key: None,
            model: "tgi".into(),
        };
        let err = OpenAiCompletionClient::new(&endpoint).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn client_joins_chat_path() {
        let endpoint = EndpointConfig {
            base_url: Some("http://localhost:8080/v1/".into()),
            api_key: Some("k".into()),
            model: "tgi".into(),
        };
        let client = OpenAiCompletionClient::new(&endpoint).unwrap();
        assert_eq!(client.url(), "http://localhost:8080/v1/chat/completions");
    }
}

//! Remote inference track over an OpenAI-compatible HTTP API.
//!
//! Each call is an independent request; the controller holds no session
//! state beyond its HTTP client and concurrency semaphore. Transient
//! failures (network, 5xx, rate limit) are retried with exponential
//! backoff and jitter inside the caller's deadline; auth and validation
//! failures are returned immediately.

use crate::config::RemoteModelConfig;
use crate::error::{AssistantError, Result};
use crate::state::{ChatMessage, Role};
use crate::tracks::{
    ChunkStream, GenerationParams, StreamChunk, TrackErrorKind, TrackResponse, TrackSource,
    estimate_quality, time_remaining,
};
use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Per-model pricing in USD per 1K tokens (input, output). Longest
/// matching prefix wins.
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000_15, 0.000_6),
    ("gpt-4o", 0.002_5, 0.01),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5", 0.000_5, 0.001_5),
    ("claude-3-5-haiku", 0.000_8, 0.004),
    ("claude", 0.003, 0.015),
];

/// Fallback pricing for unknown models.
const DEFAULT_PRICE: (f64, f64) = (0.001, 0.002);

/// Drives the remote model with retries, deadlines, and cost estimates.
pub struct RemoteController {
    config: RemoteModelConfig,
    client: reqwest::Client,
    api_key: Option<String>,
    /// Caps outstanding API calls.
    permits: Arc<Semaphore>,
}

impl RemoteController {
    /// Create a controller, reading the API key from the configured
    /// environment variable.
    pub fn new(config: RemoteModelConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "no API key in environment; remote track will fail auth");
        }
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            config,
            client: reqwest::Client::new(),
            api_key,
            permits,
        }
    }

    /// Override the API key (tests and key rotation).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Generate a response, retrying transient failures within `deadline`.
    ///
    /// Recoverable failures become failed [`TrackResponse`]s, never `Err`.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        deadline: Instant,
    ) -> TrackResponse {
        let started = Instant::now();

        let _permit = match self.acquire_permit(deadline).await {
            Ok(p) => p,
            Err(kind) => {
                return TrackResponse::failure(TrackSource::Api, kind, ms_since(started));
            }
        };
        let Some(api_key) = self.api_key.as_deref() else {
            return TrackResponse::failure(
                TrackSource::Api,
                TrackErrorKind::AuthFailed,
                ms_since(started),
            );
        };

        let body = build_request_body(&self.config.model, messages, params, false);
        let mut attempt: u32 = 0;
        loop {
            let Some(remaining) = time_remaining(deadline) else {
                return TrackResponse::failure(
                    TrackSource::Api,
                    TrackErrorKind::Timeout,
                    ms_since(started),
                );
            };

            match self.send_once(api_key, &body, remaining).await {
                Ok(parsed) => {
                    let latency_ms = ms_since(started);
                    let cost = estimate_cost(
                        &self.config.model,
                        parsed.prompt_tokens,
                        parsed.completion_tokens,
                    );
                    let quality = estimate_quality(&parsed.content, &parsed.finish_reason);
                    return TrackResponse {
                        content: parsed.content,
                        success: true,
                        error_kind: None,
                        tokens_used: parsed.prompt_tokens + parsed.completion_tokens,
                        latency_ms,
                        cost_estimate: cost,
                        quality_score: Some(quality),
                        finish_reason: parsed.finish_reason,
                        source: TrackSource::Api,
                    };
                }
                Err(kind) => {
                    if kind.is_transient() && attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt);
                        debug!(?kind, attempt, delay_ms = delay.as_millis() as u64, "retrying remote request");
                        attempt += 1;
                        // Never sleep past the deadline.
                        let capped = time_remaining(deadline)
                            .map(|r| delay.min(r))
                            .unwrap_or(Duration::ZERO);
                        tokio::time::sleep(capped).await;
                        continue;
                    }
                    return TrackResponse::failure(TrackSource::Api, kind, ms_since(started));
                }
            }
        }
    }

    /// Streaming variant: consumes server-sent chunks and yields them
    /// upstream. The terminal chunk carries the finish reason.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        deadline: Instant,
    ) -> Result<ChunkStream> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| AssistantError::RemoteModel("no API key configured".to_owned()))?;
        let remaining = time_remaining(deadline)
            .ok_or_else(|| AssistantError::Timeout("deadline already passed".to_owned()))?;

        let body = build_request_body(&self.config.model, messages, params, true);
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&api_key)
            .json(&body)
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| AssistantError::RemoteModel(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::RemoteModel(format!(
                "HTTP {status} from provider"
            )));
        }

        let stream = async_stream::stream! {
            let mut bytes = response.bytes_stream();
            let mut parser = SseLineParser::default();
            let mut tokens: u32 = 0;
            let mut finished = false;
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(AssistantError::RemoteModel(format!("stream error: {e}")));
                        return;
                    }
                };
                for line in parser.push(&chunk) {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        if !finished {
                            yield Ok(StreamChunk {
                                content: String::new(),
                                tokens_so_far: tokens,
                                finish_reason: Some("stop".to_owned()),
                            });
                        }
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                        continue;
                    };
                    let Some(choice) = event.choices.into_iter().next() else {
                        continue;
                    };
                    let delta = choice.delta.and_then(|d| d.content).unwrap_or_default();
                    if !delta.is_empty() {
                        tokens += 1;
                    }
                    let finish_reason = choice.finish_reason;
                    if finish_reason.is_some() {
                        finished = true;
                    }
                    yield Ok(StreamChunk {
                        content: delta,
                        tokens_so_far: tokens,
                        finish_reason,
                    });
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn acquire_permit(
        &self,
        deadline: Instant,
    ) -> std::result::Result<tokio::sync::OwnedSemaphorePermit, TrackErrorKind> {
        let Some(remaining) = time_remaining(deadline) else {
            return Err(TrackErrorKind::Timeout);
        };
        tokio::time::timeout(remaining, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| TrackErrorKind::Timeout)?
            .map_err(|_| TrackErrorKind::ServiceUnavailable)
    }

    async fn send_once(
        &self,
        api_key: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<ParsedCompletion, TrackErrorKind> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackErrorKind::NetworkTimeout
                } else {
                    TrackErrorKind::ServiceUnavailable
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|_| TrackErrorKind::ResponseMalformed)?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(TrackErrorKind::ResponseMalformed)?;
        let usage = completion.usage.unwrap_or_default();
        Ok(ParsedCompletion {
            content: choice.message.map(|m| m.content).unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_owned()),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff_ms.max(1);
        let exp = base.saturating_mul(1 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        Duration::from_millis(exp + jitter)
    }
}

/// Map an HTTP status to a track failure kind.
fn classify_status(status: u16) -> TrackErrorKind {
    match status {
        401 | 403 => TrackErrorKind::AuthFailed,
        429 => TrackErrorKind::RateLimited,
        400 | 404 | 422 => TrackErrorKind::ValidationError,
        500..=599 => TrackErrorKind::ServiceUnavailable,
        _ => TrackErrorKind::ResponseMalformed,
    }
}

/// Estimated request cost in USD from the per-model price table.
fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let (input, output) = PRICE_TABLE
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICE);
    f64::from(prompt_tokens) / 1_000.0 * input + f64::from(completion_tokens) / 1_000.0 * output
}

/// Build the chat completions request body.
fn build_request_body(
    model: &str,
    messages: &[ChatMessage],
    params: &GenerationParams,
    stream: bool,
) -> serde_json::Value {
    let wire_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                },
                "content": m.content,
            })
        })
        .collect();
    let mut body = serde_json::json!({
        "model": model,
        "messages": wire_messages,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stream": stream,
    });
    if !params.stop_sequences.is_empty()
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("stop".into(), serde_json::json!(params.stop_sequences));
    }
    body
}

struct ParsedCompletion {
    content: String,
    finish_reason: String,
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Buffers raw bytes and yields complete SSE lines.
#[derive(Default)]
struct SseLineParser {
    buffer: String,
}

impl SseLineParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim_end_matches('\r').to_owned();
            self.buffer.drain(..=idx);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

fn ms_since(instant: Instant) -> f64 {
    instant.elapsed().as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), TrackErrorKind::AuthFailed);
        assert_eq!(classify_status(403), TrackErrorKind::AuthFailed);
        assert_eq!(classify_status(429), TrackErrorKind::RateLimited);
        assert_eq!(classify_status(400), TrackErrorKind::ValidationError);
        assert_eq!(classify_status(503), TrackErrorKind::ServiceUnavailable);
    }

    #[test]
    fn cost_uses_longest_known_prefix() {
        let mini = estimate_cost("gpt-4o-mini", 1_000, 1_000);
        let full = estimate_cost("gpt-4o", 1_000, 1_000);
        assert!(mini < full);
        // Unknown models fall back to the default price.
        let unknown = estimate_cost("mystery-model", 1_000, 1_000);
        assert!((unknown - (DEFAULT_PRICE.0 + DEFAULT_PRICE.1)).abs() < 1e-9);
    }

    #[test]
    fn request_body_includes_params() {
        let messages = vec![ChatMessage::user("Hi")];
        let params = GenerationParams {
            max_tokens: 100,
            temperature: 0.5,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            stop_sequences: vec!["END".to_owned()],
        };
        let body = build_request_body("gpt-4o-mini", &messages, &params, false);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn sse_parser_handles_split_lines() {
        let mut parser = SseLineParser::default();
        assert!(parser.push(b"data: {\"a\"").is_empty());
        let lines = parser.push(b": 1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\": 1}", "data: [DONE]"]);
    }
}

//! On-device inference track.
//!
//! [`LocalController`] drives a pluggable [`LocalBackend`] (the concrete
//! quantized runtime lives outside this crate). The backend is loaded
//! lazily on first use and reused until shutdown. Inference is not
//! concurrency-safe in the assumed runtime, so one mutex serializes
//! every load/generate/unload against all others.

use crate::config::LocalModelConfig;
use crate::error::{AssistantError, Result};
use crate::optimizer::resources::process_rss_mb;
use crate::registry::ModelRegistry;
use crate::state::ChatMessage;
use crate::tracks::prompt;
use crate::tracks::{
    ChunkStream, GenerationParams, StreamChunk, TrackErrorKind, TrackResponse, TrackSource,
    estimate_quality, time_remaining,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A backend failure with its track-level kind.
#[derive(Debug, Clone)]
pub struct BackendError {
    /// Track-level failure classification.
    pub kind: TrackErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl BackendError {
    /// Convenience constructor.
    pub fn new(kind: TrackErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A boxed stream of backend chunks.
pub type BackendStream =
    Pin<Box<dyn Stream<Item = std::result::Result<StreamChunk, BackendError>> + Send>>;

/// Runtime tuning applied by the optimizer between turns.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocalTuning {
    /// Inference thread count override.
    pub threads: Option<u32>,
    /// Prompt batch size override.
    pub batch_size: Option<u32>,
    /// Context window override.
    pub context_size: Option<u32>,
    /// GPU layer count override.
    pub gpu_layers: Option<u32>,
    /// Low-VRAM mode override.
    pub low_vram: Option<bool>,
}

/// Cumulative controller statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackendStats {
    /// Whether a model is currently loaded.
    pub loaded: bool,
    /// Completed generate calls.
    pub calls: u64,
    /// First-token latency of the most recent call, in milliseconds.
    pub last_first_token_ms: Option<f64>,
    /// Largest resident-memory growth observed across calls, in MiB.
    pub peak_rss_delta_mb: f64,
}

/// Interface to the concrete on-device inference runtime.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    /// Load the model at `path`, applying config and tuning.
    async fn load(
        &self,
        config: &LocalModelConfig,
        tuning: &LocalTuning,
        path: &Path,
    ) -> std::result::Result<(), BackendError>;

    /// Release the loaded model.
    async fn unload(&self);

    /// Whether a model is loaded.
    fn is_loaded(&self) -> bool;

    /// Run streaming inference over a formatted prompt.
    ///
    /// The stream is finite and non-restartable; the terminal chunk
    /// carries a `finish_reason`.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> std::result::Result<BackendStream, BackendError>;
}

/// Mutable state guarded by the inference mutex.
struct LocalState {
    loaded: bool,
    calls: u64,
    last_first_token_ms: Option<f64>,
    peak_rss_delta_mb: f64,
}

/// Drives the on-device model with deadlines and per-call metrics.
pub struct LocalController {
    config: LocalModelConfig,
    registry: ModelRegistry,
    backend: Box<dyn LocalBackend>,
    /// Serializes load and inference. Only one inference runs at a time.
    state: Mutex<LocalState>,
    /// Tuning applied on the next (re)load.
    tuning: StdMutex<LocalTuning>,
}

impl LocalController {
    /// Create a controller over the given backend and registry.
    pub fn new(
        config: LocalModelConfig,
        registry: ModelRegistry,
        backend: Box<dyn LocalBackend>,
    ) -> Self {
        Self {
            config,
            registry,
            backend,
            state: Mutex::new(LocalState {
                loaded: false,
                calls: 0,
                last_first_token_ms: None,
                peak_rss_delta_mb: 0.0,
            }),
            tuning: StdMutex::new(LocalTuning::default()),
        }
    }

    /// Replace the optimizer-provided tuning. Takes effect on next load.
    pub fn apply_tuning(&self, tuning: LocalTuning) {
        if let Ok(mut current) = self.tuning.lock() {
            if *current != tuning {
                debug!(?tuning, "local tuning updated");
                *current = tuning;
            }
        }
    }

    /// Generation parameters from the configured defaults.
    pub fn default_params(&self) -> GenerationParams {
        GenerationParams::from_local(&self.config)
    }

    /// Current controller statistics.
    pub async fn stats(&self) -> LocalBackendStats {
        let state = self.state.lock().await;
        LocalBackendStats {
            loaded: state.loaded,
            calls: state.calls,
            last_first_token_ms: state.last_first_token_ms,
            peak_rss_delta_mb: state.peak_rss_delta_mb,
        }
    }

    /// Unload the model and reset the lazy-load state.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.loaded {
            self.backend.unload().await;
            state.loaded = false;
            info!("local model unloaded");
        }
    }

    /// Generate a response for the conversation, honoring `deadline`.
    ///
    /// On deadline breach the partial output produced so far is returned
    /// with `success=false` and `error_kind=Timeout`. Never returns an
    /// `Err` for recoverable generation failures — those become failed
    /// [`TrackResponse`]s.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        deadline: Instant,
    ) -> TrackResponse {
        let started = Instant::now();
        let mut state = self.state.lock().await;
        let rss_before = process_rss_mb().unwrap_or(0.0);

        if let Err(err) = self.ensure_loaded(&mut state).await {
            warn!(error = %err.message, "local model unavailable");
            return TrackResponse::failure(
                TrackSource::Local,
                err.kind,
                ms_since(started),
            );
        }

        let prompt = prompt::format_prompt(messages, self.config.architecture);
        let stream = match self.backend.generate_stream(&prompt, params).await {
            Ok(s) => s,
            Err(err) => {
                return TrackResponse::failure(TrackSource::Local, err.kind, ms_since(started));
            }
        };

        let outcome = collect_with_deadline(stream, deadline).await;

        let rss_after = process_rss_mb().unwrap_or(rss_before);
        let rss_delta = (rss_after - rss_before).max(0.0);
        state.calls += 1;
        state.last_first_token_ms = outcome.first_token_ms;
        if rss_delta > state.peak_rss_delta_mb {
            state.peak_rss_delta_mb = rss_delta;
        }
        drop(state);

        let content = prompt::extract_response(&outcome.text, self.config.architecture);
        let latency_ms = ms_since(started);

        match outcome.error {
            None => {
                let finish = outcome.finish_reason.unwrap_or_else(|| "stop".to_owned());
                let quality = estimate_quality(&content, &finish);
                TrackResponse {
                    content,
                    success: true,
                    error_kind: None,
                    tokens_used: outcome.tokens,
                    latency_ms,
                    cost_estimate: 0.0,
                    quality_score: Some(quality),
                    finish_reason: finish,
                    source: TrackSource::Local,
                }
            }
            Some(kind) => TrackResponse {
                content,
                success: false,
                error_kind: Some(kind),
                tokens_used: outcome.tokens,
                latency_ms,
                cost_estimate: 0.0,
                quality_score: None,
                finish_reason: if kind == TrackErrorKind::Timeout {
                    "timeout".to_owned()
                } else {
                    "error".to_owned()
                },
                source: TrackSource::Local,
            },
        }
    }

    /// Streaming variant: yields chunks upstream while enforcing the
    /// deadline. Token counts increase monotonically; the final chunk
    /// carries the finish reason.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        deadline: Instant,
    ) -> Result<ChunkStream> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state)
            .await
            .map_err(|e| AssistantError::LocalModel(e.message))?;
        let prompt = prompt::format_prompt(messages, self.config.architecture);
        let inner = self
            .backend
            .generate_stream(&prompt, params)
            .await
            .map_err(|e| AssistantError::LocalModel(e.message))?;
        drop(state);

        let stream = async_stream::stream! {
            let mut inner = inner;
            loop {
                let Some(remaining) = time_remaining(deadline) else {
                    yield Ok(StreamChunk {
                        content: String::new(),
                        tokens_so_far: 0,
                        finish_reason: Some("timeout".to_owned()),
                    });
                    break;
                };
                match tokio::time::timeout(remaining, inner.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        let done = chunk.finish_reason.is_some();
                        yield Ok(chunk);
                        if done {
                            break;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        yield Err(AssistantError::LocalModel(err.message));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield Ok(StreamChunk {
                            content: String::new(),
                            tokens_so_far: 0,
                            finish_reason: Some("timeout".to_owned()),
                        });
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Resolve the model path and load the backend if not yet loaded.
    async fn ensure_loaded(&self, state: &mut LocalState) -> std::result::Result<(), BackendError> {
        if state.loaded {
            return Ok(());
        }
        let path = self
            .registry
            .resolve(&self.config.model_id)
            .map_err(|e| BackendError::new(TrackErrorKind::ModelNotFound, e.to_string()))?;
        let tuning = self.tuning.lock().map(|t| *t).unwrap_or_default();
        info!(model = %self.config.model_id, path = %path.display(), "loading local model");
        self.backend.load(&self.config, &tuning, &path).await?;
        state.loaded = true;
        Ok(())
    }
}

/// Accumulated result of draining a backend stream under a deadline.
struct CollectedOutput {
    text: String,
    tokens: u32,
    first_token_ms: Option<f64>,
    finish_reason: Option<String>,
    error: Option<TrackErrorKind>,
}

async fn collect_with_deadline(mut stream: BackendStream, deadline: Instant) -> CollectedOutput {
    let started = Instant::now();
    let mut out = CollectedOutput {
        text: String::new(),
        tokens: 0,
        first_token_ms: None,
        finish_reason: None,
        error: None,
    };

    loop {
        let Some(remaining) = time_remaining(deadline) else {
            out.error = Some(TrackErrorKind::Timeout);
            return out;
        };
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                if out.first_token_ms.is_none() && !chunk.content.is_empty() {
                    out.first_token_ms = Some(ms_since(started));
                }
                out.text.push_str(&chunk.content);
                out.tokens = out.tokens.max(chunk.tokens_so_far);
                if chunk.finish_reason.is_some() {
                    out.finish_reason = chunk.finish_reason;
                    return out;
                }
            }
            Ok(Some(Err(err))) => {
                out.error = Some(err.kind);
                return out;
            }
            Ok(None) => return out,
            Err(_) => {
                out.error = Some(TrackErrorKind::Timeout);
                return out;
            }
        }
    }
}

fn ms_since(instant: Instant) -> f64 {
    instant.elapsed().as_secs_f64() * 1_000.0
}

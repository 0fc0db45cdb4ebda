//! Test doubles for the external collaborators.
//!
//! Used by the in-crate unit tests and the integration suites under
//! `tests/`. None of these touch the network or the filesystem.

use crate::config::{LocalModelConfig, VoiceConfig};
use crate::error::{AssistantError, Result};
use crate::memory::{Interaction, MemoryEngine};
use crate::state::{AudioFrame, MemorySnippet, Transcription};
use crate::tracks::local::{BackendError, BackendStream, LocalBackend, LocalTuning};
use crate::tracks::{GenerationParams, StreamChunk, TrackErrorKind};
use crate::voice::{SpeechToText, TextToSpeech, VoiceActivity, WakeWord, WakeWordHit};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A captured frame of synthetic audio.
pub fn test_frame(samples: Vec<f32>) -> AudioFrame {
    AudioFrame {
        samples,
        sample_rate: 16_000,
        captured_time: Utc::now(),
    }
}

/// What a [`ScriptedLocalBackend`] does when asked to generate.
enum Script {
    /// Emit the text word by word, then finish with "stop".
    Complete { text: String, tokens: u32 },
    /// Emit the text, then hang until the caller's deadline fires.
    Stall { text: String, tokens: u32 },
    /// Fail immediately with the given kind.
    Fail(TrackErrorKind),
}

/// Scripted on-device backend.
pub struct ScriptedLocalBackend {
    script: Script,
    loaded: AtomicBool,
    load_count: AtomicU64,
}

impl ScriptedLocalBackend {
    /// A backend that produces `text` and reports `tokens` used.
    pub fn completing(text: &str, tokens: u32) -> Self {
        Self {
            script: Script::Complete {
                text: text.to_owned(),
                tokens,
            },
            loaded: AtomicBool::new(false),
            load_count: AtomicU64::new(0),
        }
    }

    /// A backend that emits `text` and then never finishes.
    pub fn stalling_after(text: &str, tokens: u32) -> Self {
        Self {
            script: Script::Stall {
                text: text.to_owned(),
                tokens,
            },
            loaded: AtomicBool::new(false),
            load_count: AtomicU64::new(0),
        }
    }

    /// A backend whose generation fails with `kind`.
    pub fn failing(kind: TrackErrorKind) -> Self {
        Self {
            script: Script::Fail(kind),
            loaded: AtomicBool::new(false),
            load_count: AtomicU64::new(0),
        }
    }

    /// How many times `load` ran (lazy-load assertions).
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalBackend for ScriptedLocalBackend {
    async fn load(
        &self,
        _config: &LocalModelConfig,
        _tuning: &LocalTuning,
        _path: &Path,
    ) -> std::result::Result<(), BackendError> {
        self.loaded.store(true, Ordering::SeqCst);
        self.load_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> std::result::Result<BackendStream, BackendError> {
        match &self.script {
            Script::Complete { text, tokens } => {
                let text = text.clone();
                let tokens = *tokens;
                let stream = async_stream::stream! {
                    let words: Vec<String> =
                        text.split_inclusive(' ').map(str::to_owned).collect();
                    let total = words.len().max(1) as u32;
                    for (i, word) in words.into_iter().enumerate() {
                        yield Ok(StreamChunk {
                            content: word,
                            tokens_so_far: (i as u32 + 1) * tokens / total,
                            finish_reason: None,
                        });
                    }
                    yield Ok(StreamChunk {
                        content: String::new(),
                        tokens_so_far: tokens,
                        finish_reason: Some("stop".to_owned()),
                    });
                };
                Ok(Box::pin(stream))
            }
            Script::Stall { text, tokens } => {
                let text = text.clone();
                let tokens = *tokens;
                let stream = async_stream::stream! {
                    yield Ok(StreamChunk {
                        content: text,
                        tokens_so_far: tokens,
                        finish_reason: None,
                    });
                    futures_util::future::pending::<()>().await;
                };
                Ok(Box::pin(stream))
            }
            Script::Fail(kind) => {
                let kind = *kind;
                let stream = async_stream::stream! {
                    yield Err(BackendError::new(kind, "scripted failure"));
                };
                Ok(Box::pin(stream))
            }
        }
    }
}

/// In-memory engine with switchable failures.
#[derive(Default)]
pub struct InMemoryEngine {
    interactions: Mutex<Vec<Interaction>>,
    pub fail_retrieval: AtomicBool,
    pub fail_storage: AtomicBool,
    pub fail_summary: AtomicBool,
}

impl InMemoryEngine {
    /// An engine that succeeds at everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored interactions so far.
    pub fn stored(&self) -> Vec<Interaction> {
        self.interactions
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MemoryEngine for InMemoryEngine {
    async fn retrieve_context(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<MemorySnippet>> {
        if self.fail_retrieval.load(Ordering::SeqCst) {
            return Err(AssistantError::Memory("vector store offline".to_owned()));
        }
        let needle = query.to_lowercase();
        let interactions = self.stored();
        Ok(interactions
            .iter()
            .filter(|i| i.user_message.to_lowercase().contains(&needle))
            .take(max_results)
            .enumerate()
            .map(|(idx, i)| MemorySnippet {
                id: format!("sem-{idx}"),
                content: format!("{} / {}", i.user_message, i.assistant_message),
                score: 0.8,
                metadata: Map::new(),
            })
            .collect())
    }

    async fn retrieve_conversations(
        &self,
        _query: &str,
        max_results: usize,
    ) -> Result<Vec<MemorySnippet>> {
        if self.fail_retrieval.load(Ordering::SeqCst) {
            return Err(AssistantError::Memory("conversation store offline".to_owned()));
        }
        let interactions = self.stored();
        Ok(interactions
            .iter()
            .rev()
            .take(max_results)
            .enumerate()
            .map(|(idx, i)| MemorySnippet {
                id: format!("conv-{idx}"),
                content: format!("User said: {}", i.user_message),
                score: 0.6,
                metadata: Map::new(),
            })
            .collect())
    }

    async fn store_interaction(&self, interaction: &Interaction) -> Result<()> {
        if self.fail_storage.load(Ordering::SeqCst) {
            return Err(AssistantError::Memory("storage offline".to_owned()));
        }
        if let Ok(mut interactions) = self.interactions.lock() {
            interactions.push(interaction.clone());
        }
        Ok(())
    }

    async fn update_embeddings(&self, _text: &str, _metadata: &Map<String, Value>) -> Result<()> {
        if self.fail_storage.load(Ordering::SeqCst) {
            return Err(AssistantError::Memory("embedding store offline".to_owned()));
        }
        Ok(())
    }

    async fn generate_summary(
        &self,
        history: &[crate::state::ExchangePair],
    ) -> Result<String> {
        if self.fail_summary.load(Ordering::SeqCst) {
            return Err(AssistantError::Memory("summarizer offline".to_owned()));
        }
        Ok(format!("{} earlier exchanges about assorted topics", history.len()))
    }

    async fn archive_conversations(&self, _conversation_ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// STT double returning a fixed transcription.
pub struct StaticStt {
    text: String,
}

impl StaticStt {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_owned(),
        }
    }
}

#[async_trait]
impl SpeechToText for StaticStt {
    async fn transcribe(&self, _frame: &AudioFrame) -> Result<Transcription> {
        Ok(Transcription {
            text: self.text.clone(),
            confidence: 0.93,
            language: Some("en".to_owned()),
        })
    }
}

/// STT double that always fails.
pub struct FailingStt;

#[async_trait]
impl SpeechToText for FailingStt {
    async fn transcribe(&self, _frame: &AudioFrame) -> Result<Transcription> {
        Err(AssistantError::Voice("recognizer crashed".to_owned()))
    }
}

/// TTS double returning sequential audio handles.
#[derive(Default)]
pub struct StaticTts {
    count: AtomicU64,
}

#[async_trait]
impl TextToSpeech for StaticTts {
    async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> Result<String> {
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("audio-{n}"))
    }
}

/// TTS double that always fails.
pub struct FailingTts;

#[async_trait]
impl TextToSpeech for FailingTts {
    async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> Result<String> {
        Err(AssistantError::Voice("synthesizer unavailable".to_owned()))
    }
}

/// VAD double with a fixed answer.
pub struct FixedVad(pub bool);

impl VoiceActivity for FixedVad {
    fn is_speech(&self, _frame: &AudioFrame) -> bool {
        self.0
    }
}

/// Wake-word double with a fixed answer.
pub struct FixedWake(pub bool);

impl WakeWord for FixedWake {
    fn detect(&self, _frame: &AudioFrame) -> WakeWordHit {
        WakeWordHit {
            hit: self.0,
            confidence: if self.0 { 0.95 } else { 0.0 },
            timestamp_ms: 0,
        }
    }
}

//! Typed turn state shared by all workflow graph nodes.
//!
//! [`TurnState`] is the single record every node reads from and writes
//! to. Nodes never mutate state directly; they return a [`StateUpdate`]
//! and the graph applies it through the field reducers:
//!
//! - `messages`: append (completion order within a step)
//! - `audio`, `memory`, `config`, `activation`: shallow merge
//! - `processing`: deep merge — the only field written concurrently,
//!   by the local and API track nodes, on disjoint sub-keys
//!
//! The whole record serializes to JSON for checkpointing; the round
//! trip is stable and tolerant of forward-compatible additions.

use crate::config::{ActivationMode, AssistantConfig};
use crate::integration::IntegrationResult;
use crate::routing::{ProcessingPath, RoutingDecision};
use crate::tracks::TrackResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

mod update;

pub use update::{
    ActivationUpdate, AudioUpdate, MemoryUpdate, ProcessingUpdate, StateUpdate,
};

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The speaking user.
    User,
    /// The assistant's reply.
    Assistant,
    /// Injected context (summaries, instructions).
    System,
}

/// One message in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message author.
    #[serde(rename = "type")]
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Free-form metadata, preserved verbatim across serialization.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    /// A user message with no metadata.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// An assistant message with no metadata.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// A system message with no metadata.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            metadata: Map::new(),
        }
    }
}

/// Where the activation state machine currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    /// Not engaged with the user.
    #[default]
    Inactive,
    /// Capturing audio, waiting for an utterance.
    Listening,
    /// Running a turn through the graph.
    Processing,
    /// Playing back the synthesized reply.
    Speaking,
}

impl ActivationStatus {
    /// Whether the forward transition `self -> next` is allowed within a
    /// turn. Any state may fall back to `Inactive` on error, and
    /// `Processing` returns to `Listening` when no utterance was
    /// recognized (STT failure or empty transcription).
    pub fn allows(self, next: Self) -> bool {
        use ActivationStatus::*;
        matches!(
            (self, next),
            (Inactive, Listening)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Processing, Listening)
                | (Speaking, Inactive)
                | (_, Inactive)
        )
    }
}

/// Activation gating state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationState {
    /// Current position in the turn lifecycle.
    pub status: ActivationStatus,
    /// Configured activation mode.
    pub mode: ActivationMode,
    /// When the system last activated.
    pub last_activation_time: Option<DateTime<Utc>>,
    /// Whether the wake word was heard in the pending audio.
    pub wake_word_detected: bool,
}

/// A captured audio frame handed to STT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    /// Mono PCM samples in [-1, 1].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Capture timestamp.
    pub captured_time: DateTime<Utc>,
}

/// A completed transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in [0, 1].
    pub confidence: f32,
    /// Detected language code.
    pub language: Option<String>,
}

/// Audio-side state for the current turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioState {
    /// Captured frame waiting for STT.
    pub pending_frame: Option<AudioFrame>,
    /// Most recent transcription.
    pub last_transcription: Option<Transcription>,
    /// Handle of the most recently synthesized utterance.
    pub last_synthesis: Option<String>,
    /// Current input level (RMS).
    pub level: f32,
    /// Last voice I/O error, if any.
    pub error: Option<String>,
}

/// A snippet retrieved from the memory engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnippet {
    /// Engine-assigned identifier.
    pub id: String,
    /// Snippet text.
    pub content: String,
    /// Relevance score in [0, 1].
    pub score: f32,
    /// Engine metadata, preserved verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Context attached to a turn by the retrieval node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievedContext {
    /// Snippets from prior conversations.
    pub conversation_snippets: Vec<MemorySnippet>,
    /// Semantically similar snippets.
    pub semantic_snippets: Vec<MemorySnippet>,
    /// Known user preferences.
    pub user_preferences: Map<String, Value>,
    /// Recently discussed topics.
    pub recent_topics: Vec<String>,
    /// Estimated token cost of attaching this context.
    pub token_estimate: usize,
}

/// One completed user/assistant exchange in rolling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePair {
    /// The user's utterance.
    pub user: String,
    /// The assistant's reply.
    pub assistant: String,
    /// When the exchange completed.
    pub exchange_time: DateTime<Utc>,
}

/// Memory-side state for the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryState {
    /// Context retrieved for the current turn.
    pub retrieved_context: Option<RetrievedContext>,
    /// Bounded rolling history of completed exchanges.
    pub conversation_history: Vec<ExchangePair>,
    /// Most recent summary text, if summarization has run.
    pub last_summary: Option<String>,
    /// Message count at the last successful store.
    pub last_stored_message_count: usize,
    /// Status of the last retrieval attempt.
    pub retrieval_status: Option<String>,
    /// Status of the last store attempt.
    pub storage_status: Option<String>,
    /// Status of the last summarization attempt.
    pub summarization_status: Option<String>,
}

/// The per-turn snapshot of config toggles the graph consults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    /// Activation mode at turn start.
    pub activation_mode: ActivationMode,
    /// Whether assistant replies are synthesized.
    pub tts_enabled: bool,
    /// Whether memory nodes run.
    pub memory_enabled: bool,
    /// History length beyond which summarization triggers.
    pub summarization_threshold: usize,
    /// Number of oldest entries replaced per summarization.
    pub summarize_batch: usize,
    /// Hard cap on rolling history length.
    pub max_conversation_history: usize,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            activation_mode: ActivationMode::WakeWord,
            tts_enabled: true,
            memory_enabled: true,
            summarization_threshold: 20,
            summarize_batch: 10,
            max_conversation_history: 50,
        }
    }
}

impl ConfigSnapshot {
    /// Snapshot the graph-relevant toggles from the full config.
    pub fn from_config(config: &AssistantConfig) -> Self {
        Self {
            activation_mode: config.activation.mode,
            tts_enabled: config.voice.tts_enabled,
            memory_enabled: config.memory.enabled,
            summarization_threshold: config.memory.summarization_threshold,
            summarize_batch: config.memory.summarize_batch,
            max_conversation_history: config.memory.max_conversation_history,
        }
    }
}

/// Dual-track processing state. The only field two nodes write
/// concurrently: the local and API nodes touch disjoint `local_*` /
/// `api_*` sub-keys and the deep-merge reducer combines them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingState {
    /// Chosen path for this turn.
    pub path: Option<ProcessingPath>,
    /// Full routing decision. Immutable once written.
    pub decision: Option<RoutingDecision>,
    /// When track processing began.
    pub start_time: Option<DateTime<Utc>>,
    /// Turn-level guard timeout in milliseconds.
    pub guard_timeout_ms: Option<u64>,
    /// Whether the local track has finished (monotone within a turn).
    pub local_completed: bool,
    /// Whether the API track has finished (monotone within a turn).
    pub api_completed: bool,
    /// Local track result.
    pub local_response: Option<TrackResponse>,
    /// API track result.
    pub api_response: Option<TrackResponse>,
    /// Final integrated response text.
    pub final_response: Option<String>,
    /// Full integration result.
    pub integration: Option<IntegrationResult>,
    /// Per-node error strings, keyed by node name.
    pub errors: BTreeMap<String, String>,
    /// Free-form processing metadata, deep-merged.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// The complete typed state of one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnState {
    /// Ordered conversation log.
    pub messages: Vec<ChatMessage>,
    /// Audio capture/synthesis state.
    pub audio: AudioState,
    /// Memory retrieval and rolling history state.
    pub memory: MemoryState,
    /// Graph-relevant config toggles.
    pub config: ConfigSnapshot,
    /// Activation gating state.
    pub activation: ActivationState,
    /// Dual-track processing state.
    pub processing: ProcessingState,
}

impl TurnState {
    /// Fresh state for a new conversation under the given config.
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            config: ConfigSnapshot::from_config(config),
            activation: ActivationState {
                mode: config.activation.mode,
                ..ActivationState::default()
            },
            ..Self::default()
        }
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant_message(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    /// Reset per-turn fields, keeping conversation-scoped data
    /// (messages, history, config). Used between turns and after
    /// cancellation.
    pub fn begin_turn(&mut self) {
        self.processing = ProcessingState::default();
        self.audio.error = None;
        self.memory.retrieved_context = None;
        self.memory.retrieval_status = None;
        self.memory.storage_status = None;
        self.memory.summarization_status = None;
    }

    /// Serialize for checkpointing.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from a checkpoint. Unknown fields are ignored for
    /// forward compatibility.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

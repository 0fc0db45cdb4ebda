//! Partial state updates and the reducers that apply them.
//!
//! Every graph node returns a [`StateUpdate`]. The graph applies updates
//! in node completion order; parallel track nodes write disjoint
//! `local_*` / `api_*` sub-keys of `processing`, so order between them
//! never loses data.

use super::{
    ActivationState, ActivationStatus, AudioFrame, AudioState, ChatMessage, ConfigSnapshot,
    ExchangePair, MemoryState, ProcessingState, RetrievedContext, Transcription, TurnState,
};
use crate::config::ActivationMode;
use crate::integration::IntegrationResult;
use crate::routing::{ProcessingPath, RoutingDecision};
use crate::tracks::TrackResponse;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Shallow-merge update for [`AudioState`].
#[derive(Debug, Clone, Default)]
pub struct AudioUpdate {
    /// New captured frame.
    pub pending_frame: Option<AudioFrame>,
    /// Drop the pending frame (set by the STT node after consuming it).
    pub clear_pending_frame: bool,
    /// New transcription.
    pub last_transcription: Option<Transcription>,
    /// Handle of a newly synthesized utterance.
    pub last_synthesis: Option<String>,
    /// New input level.
    pub level: Option<f32>,
    /// Voice I/O error to record.
    pub error: Option<String>,
}

/// Shallow-merge update for [`MemoryState`].
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    /// Context retrieved for this turn.
    pub retrieved_context: Option<RetrievedContext>,
    /// Exchanges appended to rolling history.
    pub append_history: Vec<ExchangePair>,
    /// Atomic replacement of rolling history (summarization/pruning only).
    pub replace_history: Option<Vec<ExchangePair>>,
    /// New summary text.
    pub last_summary: Option<String>,
    /// Message count after a successful store.
    pub last_stored_message_count: Option<usize>,
    /// Retrieval status string.
    pub retrieval_status: Option<String>,
    /// Storage status string.
    pub storage_status: Option<String>,
    /// Summarization status string.
    pub summarization_status: Option<String>,
}

/// Shallow-merge update for [`ActivationState`].
#[derive(Debug, Clone, Default)]
pub struct ActivationUpdate {
    /// Status transition request; rejected if the lifecycle forbids it.
    pub status: Option<ActivationStatus>,
    /// Mode change.
    pub mode: Option<ActivationMode>,
    /// New activation timestamp.
    pub last_activation_time: Option<DateTime<Utc>>,
    /// Wake-word detection flag.
    pub wake_word_detected: Option<bool>,
}

/// Deep-merge update for [`ProcessingState`].
#[derive(Debug, Clone, Default)]
pub struct ProcessingUpdate {
    /// Path decision (written once by the router node).
    pub path: Option<ProcessingPath>,
    /// Routing decision (immutable once written).
    pub decision: Option<RoutingDecision>,
    /// Track processing start timestamp.
    pub start_time: Option<DateTime<Utc>>,
    /// Turn-level guard timeout.
    pub guard_timeout_ms: Option<u64>,
    /// Local completion flag (monotone: only `true` takes effect).
    pub local_completed: Option<bool>,
    /// API completion flag (monotone: only `true` takes effect).
    pub api_completed: Option<bool>,
    /// Local track result.
    pub local_response: Option<TrackResponse>,
    /// API track result.
    pub api_response: Option<TrackResponse>,
    /// Final integrated text.
    pub final_response: Option<String>,
    /// Integration result.
    pub integration: Option<IntegrationResult>,
    /// Node errors to record, keyed by node name.
    pub errors: BTreeMap<String, String>,
    /// Metadata entries, deep-merged into existing metadata.
    pub metadata: Map<String, Value>,
}

impl ProcessingUpdate {
    /// An update that records one node error.
    pub fn error(node: &str, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(node.to_owned(), message.into());
        Self {
            errors,
            ..Self::default()
        }
    }
}

/// A partial update emitted by one graph node.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Atomic replacement of the conversation log. Only the memory
    /// summarization node may set this; every other node appends.
    pub compact_messages: Option<Vec<ChatMessage>>,
    /// Messages to append to the conversation log.
    pub messages: Vec<ChatMessage>,
    /// Audio field update.
    pub audio: Option<AudioUpdate>,
    /// Memory field update.
    pub memory: Option<MemoryUpdate>,
    /// Config snapshot replacement.
    pub config: Option<ConfigSnapshot>,
    /// Activation field update.
    pub activation: Option<ActivationUpdate>,
    /// Processing field update.
    pub processing: Option<ProcessingUpdate>,
}

impl StateUpdate {
    /// An update that only appends one message.
    pub fn message(message: ChatMessage) -> Self {
        Self {
            messages: vec![message],
            ..Self::default()
        }
    }

    /// An update that only touches processing.
    pub fn processing(update: ProcessingUpdate) -> Self {
        Self {
            processing: Some(update),
            ..Self::default()
        }
    }

    /// An update that only touches activation.
    pub fn activation(update: ActivationUpdate) -> Self {
        Self {
            activation: Some(update),
            ..Self::default()
        }
    }

    /// Whether this update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.compact_messages.is_none()
            && self.messages.is_empty()
            && self.audio.is_none()
            && self.memory.is_none()
            && self.config.is_none()
            && self.activation.is_none()
            && self.processing.is_none()
    }

    /// Apply this update to `state` through the field reducers.
    pub fn apply(self, state: &mut TurnState) {
        if let Some(compacted) = self.compact_messages {
            state.messages = compacted;
        }
        state.messages.extend(self.messages);
        if let Some(update) = self.audio {
            apply_audio(&mut state.audio, update);
        }
        if let Some(update) = self.memory {
            apply_memory(&mut state.memory, update);
        }
        if let Some(snapshot) = self.config {
            state.config = snapshot;
        }
        if let Some(update) = self.activation {
            apply_activation(&mut state.activation, update);
        }
        if let Some(update) = self.processing {
            apply_processing(&mut state.processing, update);
        }
    }
}

fn apply_audio(state: &mut AudioState, update: AudioUpdate) {
    if update.clear_pending_frame {
        state.pending_frame = None;
    }
    if let Some(frame) = update.pending_frame {
        state.pending_frame = Some(frame);
    }
    if let Some(t) = update.last_transcription {
        state.last_transcription = Some(t);
    }
    if let Some(s) = update.last_synthesis {
        state.last_synthesis = Some(s);
    }
    if let Some(level) = update.level {
        state.level = level;
    }
    if let Some(error) = update.error {
        state.error = Some(error);
    }
}

fn apply_memory(state: &mut MemoryState, update: MemoryUpdate) {
    if let Some(history) = update.replace_history {
        state.conversation_history = history;
    }
    state.conversation_history.extend(update.append_history);
    if let Some(ctx) = update.retrieved_context {
        state.retrieved_context = Some(ctx);
    }
    if let Some(summary) = update.last_summary {
        state.last_summary = Some(summary);
    }
    if let Some(count) = update.last_stored_message_count {
        state.last_stored_message_count = count;
    }
    if let Some(s) = update.retrieval_status {
        state.retrieval_status = Some(s);
    }
    if let Some(s) = update.storage_status {
        state.storage_status = Some(s);
    }
    if let Some(s) = update.summarization_status {
        state.summarization_status = Some(s);
    }
}

fn apply_activation(state: &mut ActivationState, update: ActivationUpdate) {
    if let Some(next) = update.status {
        if state.status.allows(next) || state.status == next {
            state.status = next;
        } else {
            warn!(from = ?state.status, to = ?next, "rejected activation transition");
        }
    }
    if let Some(mode) = update.mode {
        state.mode = mode;
    }
    if let Some(t) = update.last_activation_time {
        state.last_activation_time = Some(t);
    }
    if let Some(w) = update.wake_word_detected {
        state.wake_word_detected = w;
    }
}

fn apply_processing(state: &mut ProcessingState, update: ProcessingUpdate) {
    if let Some(path) = update.path {
        state.path = Some(path);
    }
    if let Some(decision) = update.decision {
        if state.decision.is_some() {
            warn!("routing decision already written this turn; keeping the original");
        } else {
            state.decision = Some(decision);
        }
    }
    if let Some(t) = update.start_time {
        state.start_time = Some(t);
    }
    if let Some(t) = update.guard_timeout_ms {
        state.guard_timeout_ms = Some(t);
    }
    // Completion flags are monotone within a turn.
    if update.local_completed == Some(true) {
        state.local_completed = true;
    }
    if update.api_completed == Some(true) {
        state.api_completed = true;
    }
    if let Some(r) = update.local_response {
        state.local_response = Some(r);
    }
    if let Some(r) = update.api_response {
        state.api_response = Some(r);
    }
    if let Some(r) = update.final_response {
        state.final_response = Some(r);
    }
    if let Some(r) = update.integration {
        state.integration = Some(r);
    }
    state.errors.extend(update.errors);
    deep_merge_map(&mut state.metadata, update.metadata);
}

/// Recursive merge: if both sides hold objects, recurse; otherwise the
/// incoming value wins.
fn deep_merge_map(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(new)) => {
                deep_merge_map(existing, new);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{TrackErrorKind, TrackSource};

    #[test]
    fn messages_append_in_order() {
        let mut state = TurnState::default();
        StateUpdate::message(ChatMessage::user("one")).apply(&mut state);
        StateUpdate::message(ChatMessage::assistant("two")).apply(&mut state);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].content, "one");
        assert_eq!(state.messages[1].content, "two");
    }

    #[test]
    fn completion_flags_are_monotone() {
        let mut state = TurnState::default();
        StateUpdate::processing(ProcessingUpdate {
            local_completed: Some(true),
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);
        assert!(state.processing.local_completed);

        // A later false write must not regress the flag.
        StateUpdate::processing(ProcessingUpdate {
            local_completed: Some(false),
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);
        assert!(state.processing.local_completed);
    }

    #[test]
    fn disjoint_track_writes_both_survive() {
        let mut state = TurnState::default();
        let local = ProcessingUpdate {
            local_completed: Some(true),
            local_response: Some(TrackResponse::failure(
                TrackSource::Local,
                TrackErrorKind::Timeout,
                10.0,
            )),
            ..ProcessingUpdate::default()
        };
        let api = ProcessingUpdate {
            api_completed: Some(true),
            api_response: Some(TrackResponse::failure(
                TrackSource::Api,
                TrackErrorKind::RateLimited,
                20.0,
            )),
            ..ProcessingUpdate::default()
        };
        // Either completion order yields the same combined state.
        StateUpdate::processing(api).apply(&mut state);
        StateUpdate::processing(local).apply(&mut state);
        assert!(state.processing.local_completed);
        assert!(state.processing.api_completed);
        assert!(state.processing.local_response.is_some());
        assert!(state.processing.api_response.is_some());
    }

    #[test]
    fn routing_decision_is_write_once() {
        use crate::routing::{ProcessingPath, RoutingDecision};
        let mut state = TurnState::default();
        let first = RoutingDecision {
            path: ProcessingPath::Local,
            confidence: 0.9,
            reasoning: "simple_query".to_owned(),
            features: BTreeMap::new(),
            estimated_local_ms: 1.0,
            estimated_api_ms: 2.0,
        };
        let second = RoutingDecision {
            path: ProcessingPath::Api,
            confidence: 0.7,
            reasoning: "late".to_owned(),
            ..first.clone()
        };
        StateUpdate::processing(ProcessingUpdate {
            decision: Some(first),
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);
        StateUpdate::processing(ProcessingUpdate {
            decision: Some(second),
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);
        assert_eq!(
            state.processing.decision.as_ref().unwrap().reasoning,
            "simple_query"
        );
    }

    #[test]
    fn metadata_deep_merges() {
        let mut state = TurnState::default();
        let mut first = Map::new();
        first.insert(
            "timings".to_owned(),
            serde_json::json!({"local_ms": 10, "shared": 1}),
        );
        StateUpdate::processing(ProcessingUpdate {
            metadata: first,
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);

        let mut second = Map::new();
        second.insert(
            "timings".to_owned(),
            serde_json::json!({"api_ms": 20, "shared": 2}),
        );
        StateUpdate::processing(ProcessingUpdate {
            metadata: second,
            ..ProcessingUpdate::default()
        })
        .apply(&mut state);

        let timings = &state.processing.metadata["timings"];
        assert_eq!(timings["local_ms"], 10);
        assert_eq!(timings["api_ms"], 20);
        assert_eq!(timings["shared"], 2);
    }

    #[test]
    fn illegal_activation_transition_rejected() {
        let mut state = TurnState::default();
        state.activation.status = ActivationStatus::Speaking;
        StateUpdate::activation(ActivationUpdate {
            status: Some(ActivationStatus::Processing),
            ..ActivationUpdate::default()
        })
        .apply(&mut state);
        assert_eq!(state.activation.status, ActivationStatus::Speaking);

        // Error fallback to inactive is always allowed.
        StateUpdate::activation(ActivationUpdate {
            status: Some(ActivationStatus::Inactive),
            ..ActivationUpdate::default()
        })
        .apply(&mut state);
        assert_eq!(state.activation.status, ActivationStatus::Inactive);
    }

    #[test]
    fn history_replacement_is_atomic_then_append() {
        let mut state = TurnState::default();
        let pair = |u: &str| ExchangePair {
            user: u.to_owned(),
            assistant: "r".to_owned(),
            exchange_time: Utc::now(),
        };
        state.memory.conversation_history = vec![pair("a"), pair("b"), pair("c")];
        StateUpdate {
            memory: Some(MemoryUpdate {
                replace_history: Some(vec![pair("summary")]),
                append_history: vec![pair("d")],
                ..MemoryUpdate::default()
            }),
            ..StateUpdate::default()
        }
        .apply(&mut state);
        let users: Vec<&str> = state
            .memory
            .conversation_history
            .iter()
            .map(|p| p.user.as_str())
            .collect();
        assert_eq!(users, vec!["summary", "d"]);
    }
}

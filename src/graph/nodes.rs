//! Workflow graph node implementations.
//!
//! Each node is a function of the current [`TurnState`] producing a
//! [`StateUpdate`]. Nodes that talk to external collaborators (tracks,
//! memory engine, voice engines) fail soft: recoverable trouble is
//! written into the state, never raised to the graph.

use crate::config::AssistantConfig;
use crate::error::Result;
use crate::integration::Integrator;
use crate::memory::{Interaction, MemoryEngine, build_context};
use crate::optimizer::DualTrackOptimizer;
use crate::routing::{ProcessingPath, Router, RouterContext};
use crate::state::{
    ActivationStatus, ActivationUpdate, AudioUpdate, ChatMessage, ExchangePair, MemoryUpdate,
    ProcessingUpdate, Role, StateUpdate, TurnState,
};
use crate::tracks::{LocalController, RemoteController, TrackResponse};
use crate::voice::{
    ActivationManager, PlaybackEvent, SpeechToText, TextToSpeech, VoiceActivity, WakeWord,
};
use chrono::Utc;
use serde_json::Map;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Conversation messages included in a model prompt (newest kept).
const PROMPT_MESSAGE_WINDOW: usize = 24;

/// All components the graph nodes touch, assembled once at boot.
pub struct TurnNodes {
    pub(crate) config: AssistantConfig,
    pub(crate) router: Router,
    pub(crate) integrator: Integrator,
    pub(crate) local: Arc<LocalController>,
    pub(crate) remote: Arc<RemoteController>,
    pub(crate) optimizer: Arc<DualTrackOptimizer>,
    pub(crate) memory_engine: Arc<dyn MemoryEngine>,
    pub(crate) stt: Arc<dyn SpeechToText>,
    pub(crate) tts: Arc<dyn TextToSpeech>,
    pub(crate) vad: Arc<dyn VoiceActivity>,
    pub(crate) wake: Arc<dyn WakeWord>,
    pub(crate) activation: Arc<ActivationManager>,
}

impl TurnNodes {
    /// Assemble the node set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AssistantConfig,
        local: Arc<LocalController>,
        remote: Arc<RemoteController>,
        optimizer: Arc<DualTrackOptimizer>,
        memory_engine: Arc<dyn MemoryEngine>,
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        vad: Arc<dyn VoiceActivity>,
        wake: Arc<dyn WakeWord>,
        activation: Arc<ActivationManager>,
    ) -> Self {
        Self {
            router: Router::new(config.router.clone()),
            integrator: Integrator::new(config.integration.clone()),
            config,
            local,
            remote,
            optimizer,
            memory_engine,
            stt,
            tts,
            vad,
            wake,
            activation,
        }
    }

    /// `check_activation`: run the pending frame through the activation
    /// manager's mode-aware gate and move LISTENING -> PROCESSING when
    /// an utterance is ready.
    pub async fn check_activation(&self, state: &TurnState) -> Result<StateUpdate> {
        let mut activation = ActivationUpdate::default();
        let mut audio = AudioUpdate::default();

        if let Some(frame) = &state.audio.pending_frame {
            let level = rms(&frame.samples);
            audio.level = Some(level);

            let is_speech = self.vad.is_speech(frame);
            let wake_hit = self.wake.detect(frame);
            if wake_hit.hit {
                activation.wake_word_detected = Some(true);
            }

            // The manager owns the gate: continuous listens always,
            // wake-word opens on detection, scheduled/manual only within
            // an explicitly activated window, off never.
            let window_open = self.activation.process_frame(is_speech, wake_hit);
            if !window_open {
                activation.status = Some(ActivationStatus::Inactive);
            } else if is_speech && state.activation.status != ActivationStatus::Inactive {
                self.activation.set_processing();
                activation.status = Some(ActivationStatus::Processing);
                activation.last_activation_time = Some(Utc::now());
            } else {
                // The window is open (possibly just opened by the wake
                // word) but no utterance is in hand yet.
                activation.status = Some(ActivationStatus::Listening);
                if state.activation.status == ActivationStatus::Inactive {
                    activation.last_activation_time = Some(Utc::now());
                }
            }
        } else if state.activation.status == ActivationStatus::Listening {
            // Text-injected turns carry no frame; proceed directly.
            self.activation.set_processing();
            activation.status = Some(ActivationStatus::Processing);
            activation.last_activation_time = Some(Utc::now());
        }

        Ok(StateUpdate {
            audio: Some(audio),
            activation: Some(activation),
            ..StateUpdate::default()
        })
    }

    /// `stt`: transcribe the pending frame and append the user message.
    ///
    /// On failure no user message is appended; activation falls back to
    /// LISTENING and the error is recorded in the audio state.
    pub async fn stt(&self, state: &TurnState) -> Result<StateUpdate> {
        let Some(frame) = &state.audio.pending_frame else {
            return Ok(StateUpdate::default());
        };
        if state.activation.status != ActivationStatus::Processing {
            // The gate is open but no utterance was ready (silence, or a
            // frame that only woke the assistant).
            return Ok(StateUpdate::default());
        }

        match self.stt.transcribe(frame).await {
            Ok(transcription) if !transcription.text.trim().is_empty() => {
                // A recognized utterance extends the engagement window.
                self.activation
                    .extend_timeout(Duration::from_secs(self.config.activation.timeout_s));
                let mut metadata = Map::new();
                metadata.insert("confidence".to_owned(), transcription.confidence.into());
                metadata.insert("input".to_owned(), "voice".into());
                let message = ChatMessage {
                    role: Role::User,
                    content: transcription.text.clone(),
                    metadata,
                };
                Ok(StateUpdate {
                    messages: vec![message],
                    audio: Some(AudioUpdate {
                        clear_pending_frame: true,
                        last_transcription: Some(transcription),
                        ..AudioUpdate::default()
                    }),
                    ..StateUpdate::default()
                })
            }
            Ok(_) => {
                debug!("transcription empty, returning to listening");
                self.activation.activate();
                Ok(StateUpdate {
                    audio: Some(AudioUpdate {
                        clear_pending_frame: true,
                        ..AudioUpdate::default()
                    }),
                    activation: Some(ActivationUpdate {
                        status: Some(ActivationStatus::Listening),
                        ..ActivationUpdate::default()
                    }),
                    ..StateUpdate::default()
                })
            }
            Err(e) => {
                warn!(error = %e, "transcription failed, returning to listening");
                self.activation.activate();
                Ok(StateUpdate {
                    audio: Some(AudioUpdate {
                        clear_pending_frame: true,
                        error: Some(format!("stt_error: {e}")),
                        ..AudioUpdate::default()
                    }),
                    activation: Some(ActivationUpdate {
                        status: Some(ActivationStatus::Listening),
                        ..ActivationUpdate::default()
                    }),
                    ..StateUpdate::default()
                })
            }
        }
    }

    /// `retrieve_memory`: attach engine context for the current query.
    /// Fails soft.
    pub async fn retrieve_memory(&self, state: &TurnState) -> Result<StateUpdate> {
        if !state.config.memory_enabled {
            return Ok(StateUpdate::default());
        }
        let Some(query) = state.last_user_message().map(|m| m.content.clone()) else {
            return Ok(StateUpdate::default());
        };
        let max_results = self.config.memory.max_relevant_memories;

        let conversations = self
            .memory_engine
            .retrieve_conversations(&query, max_results)
            .await;
        let semantic = self.memory_engine.retrieve_context(&query, max_results).await;

        let memory = match (conversations, semantic) {
            (Ok(conversations), Ok(semantic)) => {
                let context = build_context(
                    conversations,
                    semantic,
                    self.config.memory.working_memory_token_cap,
                );
                MemoryUpdate {
                    retrieved_context: Some(context),
                    retrieval_status: Some("ok".to_owned()),
                    ..MemoryUpdate::default()
                }
            }
            (first, second) => {
                let error = first.err().or(second.err()).map(|e| e.to_string());
                warn!(error = ?error, "memory retrieval failed, continuing without context");
                MemoryUpdate {
                    retrieval_status: Some("retrieval_error".to_owned()),
                    ..MemoryUpdate::default()
                }
            }
        };
        Ok(StateUpdate {
            memory: Some(memory),
            ..StateUpdate::default()
        })
    }

    /// `router`: classify the query and write the path decision.
    pub async fn route(&self, state: &TurnState) -> Result<StateUpdate> {
        let query = state
            .last_user_message()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let recommendations = self.optimizer.get_optimization_recommendations();
        let context = RouterContext {
            activation_mode: state.activation.mode,
            has_history: !state.memory.conversation_history.is_empty()
                || state.messages.len() > 1,
            allow_parallel: recommendations.resource_status.allow_parallel,
            preferences: recommendations.routing_preferences,
            latency: self.optimizer.latency_estimates(),
        };
        let decision = self.router.determine_path(&query, &context);
        info!(
            path = ?decision.path,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "route decided"
        );

        let request_id = Uuid::new_v4().to_string();
        self.optimizer
            .record_request_start(&request_id, &query, Map::new());

        let guard_ms = recommendations
            .timeouts
            .local_ms
            .max(recommendations.timeouts.api_ms)
            .saturating_mul(2);
        let mut metadata = Map::new();
        metadata.insert("request_id".to_owned(), request_id.into());

        Ok(StateUpdate::processing(ProcessingUpdate {
            path: Some(decision.path),
            decision: Some(decision),
            start_time: Some(Utc::now()),
            guard_timeout_ms: Some(guard_ms),
            metadata,
            ..ProcessingUpdate::default()
        }))
    }

    /// `local_processing`: run the on-device track.
    pub async fn local_processing(&self, state: &TurnState) -> Result<StateUpdate> {
        let recommendations = self.optimizer.get_optimization_recommendations();
        self.local.apply_tuning(self.optimizer.local_tuning());

        let deadline_ms = match state.processing.path {
            Some(ProcessingPath::Parallel) => recommendations.timeouts.parallel_ms,
            _ => recommendations.timeouts.local_ms,
        };
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let messages = build_model_messages(state);
        let params = self.local.default_params();

        let response = self.local.generate(&messages, &params, deadline).await;
        self.record_track(state, ProcessingPath::Local, &response);

        Ok(StateUpdate::processing(ProcessingUpdate {
            local_completed: Some(true),
            local_response: Some(response),
            ..ProcessingUpdate::default()
        }))
    }

    /// `api_processing`: run the remote track.
    pub async fn api_processing(&self, state: &TurnState) -> Result<StateUpdate> {
        let recommendations = self.optimizer.get_optimization_recommendations();
        let deadline_ms = match state.processing.path {
            Some(ProcessingPath::Parallel) => recommendations.timeouts.parallel_ms,
            _ => recommendations.timeouts.api_ms,
        };
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let messages = build_model_messages(state);
        let mut params = self.local.default_params();
        // Remote models ignore the local-only sampling knobs.
        params.stop_sequences.clear();

        let response = self.remote.generate(&messages, &params, deadline).await;
        self.record_track(state, ProcessingPath::Api, &response);

        Ok(StateUpdate::processing(ProcessingUpdate {
            api_completed: Some(true),
            api_response: Some(response),
            ..ProcessingUpdate::default()
        }))
    }

    /// `integration`: merge track results, append the assistant message,
    /// and transition to SPEAKING.
    pub async fn integration(&self, state: &TurnState) -> Result<StateUpdate> {
        let path = state.processing.path.unwrap_or(ProcessingPath::Parallel);
        let result = self.integrator.integrate(
            state.processing.local_response.as_ref(),
            state.processing.api_response.as_ref(),
            path,
        );
        info!(
            source = ?result.source,
            strategy = ?result.strategy,
            similarity = ?result.similarity_score,
            "integration complete"
        );

        let mut metadata = Map::new();
        metadata.insert(
            "source".to_owned(),
            serde_json::to_value(result.source).unwrap_or_default(),
        );
        metadata.insert(
            "strategy".to_owned(),
            serde_json::to_value(result.strategy).unwrap_or_default(),
        );
        if let Some(similarity) = result.similarity_score {
            metadata.insert("similarity".to_owned(), similarity.into());
        }
        let message = ChatMessage {
            role: Role::Assistant,
            content: result.content.clone(),
            metadata,
        };
        self.activation.set_speaking();

        Ok(StateUpdate {
            messages: vec![message],
            activation: Some(ActivationUpdate {
                status: Some(ActivationStatus::Speaking),
                ..ActivationUpdate::default()
            }),
            processing: Some(ProcessingUpdate {
                final_response: Some(result.content.clone()),
                integration: Some(result),
                ..ProcessingUpdate::default()
            }),
            ..StateUpdate::default()
        })
    }

    /// `tts`: synthesize the assistant reply and return to INACTIVE.
    ///
    /// On failure the assistant message is kept; only the audio error is
    /// recorded. Playback events go to the activation manager's
    /// listeners (the core treats synthesis + playback as synchronous).
    pub async fn tts(&self, state: &TurnState) -> Result<StateUpdate> {
        let Some(message) = state.last_assistant_message() else {
            return Ok(StateUpdate::default());
        };
        let audio = match self
            .tts
            .synthesize(&message.content, &self.config.voice)
            .await
        {
            Ok(handle) => {
                self.activation.notify_playback(PlaybackEvent::Started);
                self.activation.notify_playback(PlaybackEvent::Completed);
                AudioUpdate {
                    last_synthesis: Some(handle),
                    ..AudioUpdate::default()
                }
            }
            Err(e) => {
                warn!(error = %e, "speech synthesis failed");
                AudioUpdate {
                    error: Some(format!("tts_error: {e}")),
                    ..AudioUpdate::default()
                }
            }
        };
        Ok(StateUpdate {
            audio: Some(audio),
            activation: Some(ActivationUpdate {
                status: Some(ActivationStatus::Inactive),
                ..ActivationUpdate::default()
            }),
            ..StateUpdate::default()
        })
    }

    /// `store_memory`: persist the completed exchange and extend rolling
    /// history. Fails soft.
    pub async fn store_memory(&self, state: &TurnState) -> Result<StateUpdate> {
        let (Some(user), Some(assistant)) =
            (state.last_user_message(), state.last_assistant_message())
        else {
            return Ok(StateUpdate::default());
        };
        let interaction = Interaction {
            user_message: user.content.clone(),
            assistant_message: assistant.content.clone(),
            metadata: Map::new(),
        };

        let stored = self.memory_engine.store_interaction(&interaction).await;
        let embedded = match &stored {
            Ok(()) => {
                self.memory_engine
                    .update_embeddings(&interaction.user_message, &Map::new())
                    .await
            }
            Err(_) => Ok(()),
        };

        let pair = ExchangePair {
            user: interaction.user_message,
            assistant: interaction.assistant_message,
            exchange_time: Utc::now(),
        };
        let status = match (&stored, &embedded) {
            (Ok(()), Ok(())) => "ok".to_owned(),
            _ => {
                warn!("memory storage failed, keeping exchange in rolling history only");
                "storage_error".to_owned()
            }
        };

        Ok(StateUpdate {
            memory: Some(MemoryUpdate {
                append_history: vec![pair],
                last_stored_message_count: Some(state.messages.len()),
                storage_status: Some(status),
                ..MemoryUpdate::default()
            }),
            ..StateUpdate::default()
        })
    }

    /// `summarize_memory`: replace the oldest history entries with one
    /// engine-produced summary, appending it to the message log as a
    /// system message. Fails soft.
    pub async fn summarize_memory(&self, state: &TurnState) -> Result<StateUpdate> {
        let history = &state.memory.conversation_history;
        let batch = self.config.memory.summarize_batch.min(history.len());
        if batch == 0 {
            return Ok(StateUpdate::default());
        }
        let (oldest, rest) = history.split_at(batch);

        match self.memory_engine.generate_summary(oldest).await {
            Ok(summary) => {
                info!(compacted = batch, "conversation history summarized");
                let summary_message =
                    ChatMessage::system(format!("Conversation summary: {summary}"));
                // Compact the message log alongside history: keep any
                // prior system messages plus the recent window.
                let mut compacted: Vec<ChatMessage> = state
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .cloned()
                    .collect();
                compacted.push(summary_message);
                let recent = state
                    .messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .rev()
                    .take(PROMPT_MESSAGE_WINDOW)
                    .cloned()
                    .collect::<Vec<_>>();
                compacted.extend(recent.into_iter().rev());

                Ok(StateUpdate {
                    compact_messages: Some(compacted),
                    memory: Some(MemoryUpdate {
                        replace_history: Some(rest.to_vec()),
                        last_summary: Some(summary),
                        summarization_status: Some("ok".to_owned()),
                        ..MemoryUpdate::default()
                    }),
                    ..StateUpdate::default()
                })
            }
            Err(e) => {
                warn!(error = %e, "summarization failed, keeping full history");
                Ok(StateUpdate {
                    memory: Some(MemoryUpdate {
                        summarization_status: Some("summarization_error".to_owned()),
                        ..MemoryUpdate::default()
                    }),
                    ..StateUpdate::default()
                })
            }
        }
    }

    /// `prune_memory`: hard-cap the rolling history length.
    pub async fn prune_memory(&self, state: &TurnState) -> Result<StateUpdate> {
        let cap = self.config.memory.max_conversation_history;
        let history = &state.memory.conversation_history;
        if history.len() <= cap {
            return Ok(StateUpdate::default());
        }
        let trimmed = history[history.len() - cap..].to_vec();
        debug!(dropped = history.len() - cap, "rolling history pruned");
        Ok(StateUpdate {
            memory: Some(MemoryUpdate {
                replace_history: Some(trimmed),
                ..MemoryUpdate::default()
            }),
            ..StateUpdate::default()
        })
    }

    /// Report a finished track to the optimizer under the turn's request ID.
    fn record_track(&self, state: &TurnState, path: ProcessingPath, response: &TrackResponse) {
        let request_id = state
            .processing
            .metadata
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        self.optimizer
            .record_request_completion(request_id, path, response);
    }
}

/// Messages handed to either model: retrieved context as a system
/// message, then the recent conversation window.
fn build_model_messages(state: &TurnState) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(context) = &state.memory.retrieved_context {
        let mut lines = Vec::new();
        for snippet in context
            .conversation_snippets
            .iter()
            .chain(context.semantic_snippets.iter())
        {
            lines.push(format!("- {}", snippet.content));
        }
        if !lines.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Relevant context from memory:\n{}",
                lines.join("\n")
            )));
        }
    }

    let window = state
        .messages
        .iter()
        .rev()
        .take(PROMPT_MESSAGE_WINDOW)
        .cloned()
        .collect::<Vec<_>>();
    messages.extend(window.into_iter().rev());
    messages
}

/// Root-mean-square level of a frame.
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0, 0.0]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn model_messages_include_context_first() {
        let mut state = TurnState::default();
        state.messages.push(ChatMessage::user("what about paris?"));
        state.memory.retrieved_context = Some(crate::state::RetrievedContext {
            conversation_snippets: vec![crate::state::MemorySnippet {
                id: "1".to_owned(),
                content: "User previously asked about France.".to_owned(),
                score: 0.9,
                metadata: Map::new(),
            }],
            ..crate::state::RetrievedContext::default()
        });
        let messages = build_model_messages(&state);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("France"));
        assert_eq!(messages[1].content, "what about paris?");
    }

    #[test]
    fn model_messages_window_is_bounded() {
        let mut state = TurnState::default();
        for i in 0..100 {
            state.messages.push(ChatMessage::user(format!("m{i}")));
        }
        let messages = build_model_messages(&state);
        assert_eq!(messages.len(), PROMPT_MESSAGE_WINDOW);
        assert_eq!(messages.last().unwrap().content, "m99");
    }
}

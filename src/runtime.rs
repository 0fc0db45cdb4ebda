//! Assistant runtime: boots the components, drives turns, and shuts
//! everything down in order.
//!
//! Boot order: memory engine, registry, controllers, resource monitor,
//! adaptive optimizer, workflow graph. Shutdown reverses it: stop the
//! optimizer loops, cancel any in-flight turn, flush the checkpoint,
//! unload the local model, close the memory engine.

use crate::config::AssistantConfig;
use crate::error::Result;
use crate::graph::{TurnNodes, TurnOutcome, WorkflowGraph};
use crate::memory::MemoryEngine;
use crate::optimizer::{DualTrackOptimizer, ResourceMonitor, ResourceReader};
use crate::persistence::{Checkpointer, FsCheckpointer};
use crate::registry::ModelRegistry;
use crate::routing::{LatencyEstimates, RoutingPreferences};
use crate::state::{ActivationStatus, AudioFrame, ChatMessage, TurnState};
use crate::tracks::local::LocalBackend;
use crate::tracks::{LocalController, RemoteController};
use crate::voice::{ActivationManager, SpeechToText, TextToSpeech, VoiceActivity, WakeWord};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// External collaborators handed to the runtime at boot.
pub struct Collaborators {
    /// Memory engine (vector + conversation stores).
    pub memory_engine: Arc<dyn MemoryEngine>,
    /// On-device inference runtime.
    pub local_backend: Box<dyn LocalBackend>,
    /// Speech-to-text engine.
    pub stt: Arc<dyn SpeechToText>,
    /// Text-to-speech engine.
    pub tts: Arc<dyn TextToSpeech>,
    /// Voice activity detector.
    pub vad: Arc<dyn VoiceActivity>,
    /// Wake-word detector.
    pub wake: Arc<dyn WakeWord>,
}

/// The assembled assistant.
pub struct Assistant {
    config: AssistantConfig,
    graph: WorkflowGraph,
    checkpointer: Arc<dyn Checkpointer>,
    activation: Arc<ActivationManager>,
    optimizer: Arc<DualTrackOptimizer>,
    local: Arc<LocalController>,
    memory_engine: Arc<dyn MemoryEngine>,
    state: TurnState,
    conversation_id: String,
    thread_id: String,
    turn_index: u64,
    shutdown: CancellationToken,
    current_turn: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Assistant {
    /// Boot the assistant with the given collaborators.
    pub async fn boot(config: AssistantConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        collaborators.memory_engine.initialize().await?;

        let registry = match &config.local.registry_path {
            Some(path) => match ModelRegistry::load(path) {
                Ok(registry) => registry,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "model registry unavailable");
                    ModelRegistry::empty()
                }
            },
            None => ModelRegistry::single(&config.local.model_id),
        };

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();

        let resources = if config.optimizer.monitoring_enabled {
            let monitor = ResourceMonitor::new(
                Duration::from_secs(config.optimizer.monitor_interval_s.max(1)),
                shutdown.child_token(),
            );
            let reader = monitor.reader();
            background.push(tokio::spawn(monitor.run()));
            reader
        } else {
            ResourceReader::disabled()
        };

        let optimizer = Arc::new(
            DualTrackOptimizer::new(
                config.optimizer.clone(),
                config.local.timeout_ms,
                config.remote.timeout_ms,
                LatencyEstimates {
                    local_ms: config.router.prior_local_latency_ms,
                    api_ms: config.router.prior_api_latency_ms,
                },
                resources,
            )
            .with_initial_preferences(RoutingPreferences {
                parallel_threshold: config.router.parallel_threshold,
                ..RoutingPreferences::default()
            }),
        );
        background.push(tokio::spawn(
            Arc::clone(&optimizer).run(shutdown.child_token()),
        ));

        let local = Arc::new(LocalController::new(
            config.local.clone(),
            registry,
            collaborators.local_backend,
        ));
        let remote = Arc::new(RemoteController::new(config.remote.clone()));

        let activation = Arc::new(ActivationManager::new(
            config.activation.mode,
            Duration::from_secs(config.activation.timeout_s),
        ));

        let checkpointer: Arc<dyn Checkpointer> = Arc::new(FsCheckpointer::new(
            config.data_dir(),
            config.persistence.checkpoint_keep,
        ));

        let nodes = TurnNodes::new(
            config.clone(),
            Arc::clone(&local),
            remote,
            Arc::clone(&optimizer),
            Arc::clone(&collaborators.memory_engine),
            collaborators.stt,
            collaborators.tts,
            collaborators.vad,
            collaborators.wake,
            Arc::clone(&activation),
        );

        let state = TurnState::new(&config);
        info!(mode = ?config.activation.mode, "assistant booted");
        Ok(Self {
            graph: WorkflowGraph::new(nodes),
            checkpointer,
            activation,
            optimizer,
            local,
            memory_engine: collaborators.memory_engine,
            state,
            conversation_id: Uuid::new_v4().to_string(),
            thread_id: "main".to_owned(),
            turn_index: 0,
            current_turn: shutdown.child_token(),
            shutdown,
            background,
            config,
        })
    }

    /// Resume a stored conversation. Returns whether a checkpoint was
    /// found.
    pub async fn resume(&mut self, conversation_id: &str) -> Result<bool> {
        match self.checkpointer.get_latest(conversation_id).await? {
            Some(record) => {
                info!(
                    conversation_id,
                    turn_index = record.turn_index,
                    "resuming from checkpoint"
                );
                self.conversation_id = conversation_id.to_owned();
                self.thread_id = record.thread_id;
                self.turn_index = record.turn_index + 1;
                self.state = record.state;
                self.state.begin_turn();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The active conversation ID.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// The current turn state (observability, tests).
    pub fn state(&self) -> &TurnState {
        &self.state
    }

    /// The activation gate (capture layer integration).
    pub fn activation(&self) -> &Arc<ActivationManager> {
        &self.activation
    }

    /// The optimizer (status surfaces).
    pub fn optimizer(&self) -> &Arc<DualTrackOptimizer> {
        &self.optimizer
    }

    /// Token that aborts the current turn when cancelled (barge-in).
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.current_turn.clone()
    }

    /// Run one turn from a captured audio frame.
    ///
    /// The activation manager's gate decides whether the frame opens or
    /// continues a listening window; a lapsed inactivity window
    /// deactivates first.
    pub async fn process_frame(&mut self, frame: AudioFrame) -> Result<TurnOutcome> {
        if self.activation.check_timeout() {
            info!("activation window lapsed");
        }
        let pre_turn = self.state.clone();
        self.state.begin_turn();
        self.state.audio.pending_frame = Some(frame);
        self.state.activation.status = self.activation.status();
        self.run_turn(pre_turn).await
    }

    /// Run one turn from injected text (no STT involved). Injected text
    /// counts as an explicit activation trigger in every mode but Off.
    pub async fn process_text(&mut self, text: &str) -> Result<TurnOutcome> {
        let pre_turn = self.state.clone();
        self.state.begin_turn();
        self.state.audio.pending_frame = None;
        self.state.messages.push(ChatMessage::user(text));
        if self.activation.activate() {
            self.state.activation.status = self.activation.status();
        }
        self.run_turn(pre_turn).await
    }

    async fn run_turn(&mut self, pre_turn: TurnState) -> Result<TurnOutcome> {
        let outcome = self
            .graph
            .execute_turn(&mut self.state, &self.current_turn)
            .await?;

        match &outcome {
            TurnOutcome::Completed { .. } => {
                // The turn is not complete until its checkpoint is durable.
                self.checkpointer
                    .put(
                        &self.conversation_id,
                        &self.thread_id,
                        self.turn_index,
                        &self.state,
                    )
                    .await?;
                self.turn_index += 1;
                // Playback events already settled the manager when TTS
                // ran; clean up only when synthesis was skipped or failed.
                if matches!(
                    self.activation.status(),
                    ActivationStatus::Processing | ActivationStatus::Speaking
                ) {
                    self.activation.deactivate();
                }
            }
            TurnOutcome::Cancelled => {
                // Discard the partial turn entirely and go back to
                // listening; memory and checkpoints are untouched.
                info!("turn cancelled, restoring pre-turn state");
                self.state = pre_turn;
                self.state.begin_turn();
                self.state.activation.status = ActivationStatus::Listening;
                self.activation.activate();
            }
            TurnOutcome::Skipped => {
                // The manager already reflects the gate's decision (still
                // listening after an STT failure, inactive when the gate
                // was closed).
            }
        }
        // Fresh token for the next turn; handles given out for this one
        // are spent.
        self.current_turn = self.shutdown.child_token();
        Ok(outcome)
    }

    /// Graceful shutdown: stop background loops, flush the checkpoint,
    /// unload the local model, close the memory engine.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("assistant shutting down");
        self.current_turn.cancel();
        self.shutdown.cancel();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }

        if !self.state.messages.is_empty() {
            if let Err(e) = self
                .checkpointer
                .put(
                    &self.conversation_id,
                    &self.thread_id,
                    self.turn_index,
                    &self.state,
                )
                .await
            {
                warn!(error = %e, "final checkpoint flush failed");
            }
        }

        self.local.shutdown().await;
        self.memory_engine.shutdown().await?;
        info!("assistant shutdown complete");
        Ok(())
    }

    /// The loaded configuration.
    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }
}

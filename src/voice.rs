//! Voice I/O contracts and the activation gating state machine.
//!
//! Concrete STT/TTS/VAD/wake-word engines live outside this crate; the
//! core drives them through the traits here, treats them as synchronous
//! calls with deadlines, and catches every failure into the turn state
//! rather than aborting.

use crate::config::{ActivationMode, VoiceConfig};
use crate::error::Result;
use crate::state::{ActivationStatus, AudioFrame, Transcription};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Speech-to-text engine boundary.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one captured frame.
    async fn transcribe(&self, frame: &AudioFrame) -> Result<Transcription>;
}

/// Text-to-speech engine boundary. Returns an opaque handle to the
/// synthesized utterance (playback is the platform layer's concern).
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` with the given voice settings.
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<String>;
}

/// Voice activity detection boundary.
pub trait VoiceActivity: Send + Sync {
    /// Whether the frame contains speech.
    fn is_speech(&self, frame: &AudioFrame) -> bool;
}

/// The result of scanning a frame for the wake word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeWordHit {
    /// Whether the wake word was detected.
    pub hit: bool,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Offset of the hit within the frame, in milliseconds.
    pub timestamp_ms: u32,
}

/// Wake-word detector boundary.
pub trait WakeWord: Send + Sync {
    /// Scan a frame for the configured wake phrase.
    fn detect(&self, frame: &AudioFrame) -> WakeWordHit;
}

/// Playback lifecycle events delivered to registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Synthesized audio started playing.
    Started,
    /// Playback finished normally.
    Completed,
    /// Playback was cut short (barge-in).
    Interrupted,
    /// The playback queue drained.
    QueueEmpty,
}

/// Listener invoked on activation status changes: `(previous, next)`.
pub type StateChangeListener = Box<dyn Fn(ActivationStatus, ActivationStatus) + Send + Sync>;

/// Listener invoked on playback events.
pub type PlaybackListener = Box<dyn Fn(PlaybackEvent) + Send + Sync>;

struct ManagerState {
    status: ActivationStatus,
    mode: ActivationMode,
    /// When the current activation expires (None while inactive or in
    /// continuous mode).
    deadline: Option<Instant>,
}

/// The gating state machine deciding when the assistant listens.
///
/// Tracks its own status mirror for capture-side gating; the workflow
/// graph holds the authoritative per-turn copy in `TurnState`.
pub struct ActivationManager {
    state: Mutex<ManagerState>,
    timeout: Duration,
    state_listeners: Mutex<Vec<StateChangeListener>>,
    playback_listeners: Mutex<Vec<PlaybackListener>>,
}

impl ActivationManager {
    /// Create a manager in the given mode with an inactivity timeout.
    pub fn new(mode: ActivationMode, timeout: Duration) -> Self {
        let status = match mode {
            ActivationMode::Continuous => ActivationStatus::Listening,
            _ => ActivationStatus::Inactive,
        };
        Self {
            state: Mutex::new(ManagerState {
                status,
                mode,
                deadline: None,
            }),
            timeout,
            state_listeners: Mutex::new(Vec::new()),
            playback_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> ActivationStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(ActivationStatus::Inactive)
    }

    /// Current mode.
    pub fn mode(&self) -> ActivationMode {
        self.state
            .lock()
            .map(|s| s.mode)
            .unwrap_or(ActivationMode::Off)
    }

    /// Change mode. Off deactivates immediately; continuous starts
    /// listening immediately.
    pub fn set_mode(&self, mode: ActivationMode) {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.mode = mode;
            match mode {
                ActivationMode::Off => Some(self.transition(&mut state, ActivationStatus::Inactive)),
                ActivationMode::Continuous => {
                    Some(self.transition(&mut state, ActivationStatus::Listening))
                }
                _ => None,
            }
        };
        if let Some(Some((prev, next))) = transition {
            self.notify_state(prev, next);
        }
    }

    /// Decide whether a captured frame activates the assistant.
    ///
    /// Consumes VAD and wake-word evidence per the current mode. Returns
    /// `true` when the frame should open (or continue) a listening
    /// window.
    pub fn process_frame(&self, is_speech: bool, wake: WakeWordHit) -> bool {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            match state.mode {
                ActivationMode::Off => return false,
                ActivationMode::Continuous => {
                    if state.status == ActivationStatus::Inactive {
                        self.transition(&mut state, ActivationStatus::Listening)
                    } else {
                        None
                    }
                }
                ActivationMode::WakeWord => {
                    if wake.hit && state.status == ActivationStatus::Inactive {
                        debug!(confidence = wake.confidence, "wake word detected");
                        state.deadline = Some(Instant::now() + self.timeout);
                        self.transition(&mut state, ActivationStatus::Listening)
                    } else if is_speech && state.status == ActivationStatus::Listening {
                        // Speech extends the window.
                        state.deadline = Some(Instant::now() + self.timeout);
                        None
                    } else {
                        None
                    }
                }
                // Scheduled and manual activation are driven by explicit
                // `activate()` calls; frames only extend an open window.
                ActivationMode::Scheduled | ActivationMode::Manual => {
                    if is_speech && state.status == ActivationStatus::Listening {
                        state.deadline = Some(Instant::now() + self.timeout);
                    }
                    None
                }
            }
        };
        if let Some((prev, next)) = transition {
            self.notify_state(prev, next);
        }
        self.status() == ActivationStatus::Listening
    }

    /// Explicitly open a listening window (manual/scheduled modes).
    /// Returns false when the mode is Off.
    pub fn activate(&self) -> bool {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if state.mode == ActivationMode::Off {
                warn!("cannot activate while mode is off");
                return false;
            }
            state.deadline = Some(Instant::now() + self.timeout);
            self.transition(&mut state, ActivationStatus::Listening)
        };
        if let Some((prev, next)) = transition {
            self.notify_state(prev, next);
        }
        true
    }

    /// Return to inactive.
    pub fn deactivate(&self) {
        self.force_status(ActivationStatus::Inactive);
    }

    /// Mark the turn as processing.
    pub fn set_processing(&self) {
        self.force_status(ActivationStatus::Processing);
    }

    /// Mark the turn as speaking.
    pub fn set_speaking(&self) {
        self.force_status(ActivationStatus::Speaking);
    }

    /// Extend the current activation window.
    pub fn extend_timeout(&self, extra: Duration) {
        if let Ok(mut state) = self.state.lock() {
            let base = state.deadline.unwrap_or_else(Instant::now);
            state.deadline = Some(base + extra);
        }
    }

    /// Deactivate if the inactivity window has lapsed. Returns true when
    /// a timeout fired.
    pub fn check_timeout(&self) -> bool {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            let lapsed = state.mode != ActivationMode::Continuous
                && state.status == ActivationStatus::Listening
                && state.deadline.is_some_and(|d| Instant::now() >= d);
            if lapsed {
                state.deadline = None;
                self.transition(&mut state, ActivationStatus::Inactive)
            } else {
                None
            }
        };
        match transition {
            Some((prev, next)) => {
                self.notify_state(prev, next);
                true
            }
            None => false,
        }
    }

    /// Register a status-change listener.
    pub fn add_state_listener(&self, listener: StateChangeListener) {
        if let Ok(mut listeners) = self.state_listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Register a playback-event listener.
    pub fn add_playback_listener(&self, listener: PlaybackListener) {
        if let Ok(mut listeners) = self.playback_listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Deliver a playback event to all listeners. An interruption also
    /// reopens the listening window (barge-in).
    pub fn notify_playback(&self, event: PlaybackEvent) {
        if let Ok(listeners) = self.playback_listeners.lock() {
            for listener in listeners.iter() {
                listener(event);
            }
        }
        match event {
            PlaybackEvent::Interrupted => self.force_status(ActivationStatus::Listening),
            PlaybackEvent::Completed | PlaybackEvent::QueueEmpty => {
                if self.mode() == ActivationMode::Continuous {
                    self.force_status(ActivationStatus::Listening);
                } else {
                    self.force_status(ActivationStatus::Inactive);
                }
            }
            PlaybackEvent::Started => {}
        }
    }

    fn force_status(&self, next: ActivationStatus) {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            self.transition(&mut state, next)
        };
        if let Some((prev, next)) = transition {
            self.notify_state(prev, next);
        }
    }

    /// Apply a transition, returning `(previous, next)` when the status
    /// actually changed.
    fn transition(
        &self,
        state: &mut ManagerState,
        next: ActivationStatus,
    ) -> Option<(ActivationStatus, ActivationStatus)> {
        if state.status == next {
            return None;
        }
        let prev = state.status;
        state.status = next;
        Some((prev, next))
    }

    fn notify_state(&self, prev: ActivationStatus, next: ActivationStatus) {
        debug!(?prev, ?next, "activation state changed");
        if let Ok(listeners) = self.state_listeners.lock() {
            for listener in listeners.iter() {
                listener(prev, next);
            }
        }
    }
}

//! Assistant entry point.
//!
//! Runs the core as a line-based console loop: each stdin line is
//! injected as a user utterance and the integrated response is printed.
//! Voice engines, the local model runtime, and the memory engine are
//! external collaborators; this binary wires no-op stand-ins so the
//! scheduling core runs standalone (remote track + fallbacks).
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 fatal runtime
//! error. SIGINT/SIGTERM trigger a graceful shutdown.

use sona::config::{AssistantConfig, LocalModelConfig, VoiceConfig};
use sona::error::AssistantError;
use sona::memory::{Interaction, MemoryEngine};
use sona::runtime::{Assistant, Collaborators};
use sona::state::{AudioFrame, MemorySnippet, Transcription};
use sona::tracks::local::{BackendError, BackendStream, LocalBackend, LocalTuning};
use sona::tracks::{GenerationParams, TrackErrorKind};
use sona::voice::{SpeechToText, TextToSpeech, VoiceActivity, WakeWord, WakeWordHit};
use sona::TurnOutcome;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = match parse_args() {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(1);
        }
    };

    let config = match AssistantConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let _log_guard = init_logging(&config);

    let assistant = match Assistant::boot(config, offline_collaborators()).await {
        Ok(assistant) => assistant,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };
    assistant
        .activation()
        .add_state_listener(Box::new(|previous, next| {
            tracing::debug!(?previous, ?next, "activation state changed");
        }));

    match run_console(assistant).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

/// Accepts `--config PATH` and nothing else.
fn parse_args() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| "usage: sona [--config PATH]".to_owned())?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                return Err("usage: sona [--config PATH]".to_owned());
            }
            other => {
                return Err(format!("unknown argument '{other}'\nusage: sona [--config PATH]"));
            }
        }
    }
    Ok(config)
}

/// Stderr logging with the configured filter; optional file appender.
fn init_logging(config: &AssistantConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let appender = tracing_appender::rolling::never(
                directory,
                file_name.unwrap_or_else(|| "sona.log".to_owned()),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Read stdin lines as utterances until EOF or a shutdown signal.
async fn run_console(mut assistant: Assistant) -> sona::Result<()> {
    info!(conversation = %assistant.conversation_id(), "console session started");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            signal = shutdown_signal() => {
                info!(signal, "shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        match assistant.process_text(text).await {
                            Ok(TurnOutcome::Completed { response }) => {
                                println!("{response}");
                            }
                            Ok(TurnOutcome::Skipped) => {}
                            Ok(TurnOutcome::Cancelled) => {
                                info!("turn cancelled");
                            }
                            Err(e @ AssistantError::Persistence(_)) => {
                                // Unrecoverable: checkpoints can no longer be trusted.
                                assistant.shutdown().await.ok();
                                return Err(e);
                            }
                            Err(e) => {
                                error!(error = %e, "turn failed");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        }
    }

    assistant.shutdown().await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Stand-in collaborators for running the core without external engines.
fn offline_collaborators() -> Collaborators {
    Collaborators {
        memory_engine: std::sync::Arc::new(NoopMemory),
        local_backend: Box::new(UnavailableBackend),
        stt: std::sync::Arc::new(NoopStt),
        tts: std::sync::Arc::new(NoopTts),
        vad: std::sync::Arc::new(AlwaysSpeech),
        wake: std::sync::Arc::new(NeverWake),
    }
}

/// Memory engine stand-in: remembers nothing, fails nothing.
struct NoopMemory;

#[async_trait]
impl MemoryEngine for NoopMemory {
    async fn retrieve_context(&self, _: &str, _: usize) -> sona::Result<Vec<MemorySnippet>> {
        Ok(Vec::new())
    }
    async fn retrieve_conversations(&self, _: &str, _: usize) -> sona::Result<Vec<MemorySnippet>> {
        Ok(Vec::new())
    }
    async fn store_interaction(&self, _: &Interaction) -> sona::Result<()> {
        Ok(())
    }
    async fn update_embeddings(&self, _: &str, _: &Map<String, Value>) -> sona::Result<()> {
        Ok(())
    }
    async fn generate_summary(&self, history: &[sona::state::ExchangePair]) -> sona::Result<String> {
        Ok(format!("{} earlier exchanges", history.len()))
    }
    async fn archive_conversations(&self, _: &[String]) -> sona::Result<()> {
        Ok(())
    }
}

/// Local backend stand-in: reports that no runtime is linked, pushing
/// every turn onto the remote track or the integrator's fallback.
struct UnavailableBackend;

#[async_trait]
impl LocalBackend for UnavailableBackend {
    async fn load(
        &self,
        _: &LocalModelConfig,
        _: &LocalTuning,
        _: &Path,
    ) -> Result<(), BackendError> {
        Err(BackendError::new(
            TrackErrorKind::NotInitialized,
            "no local inference runtime linked",
        ))
    }
    async fn unload(&self) {}
    fn is_loaded(&self) -> bool {
        false
    }
    async fn generate_stream(
        &self,
        _: &str,
        _: &GenerationParams,
    ) -> Result<BackendStream, BackendError> {
        Err(BackendError::new(
            TrackErrorKind::NotInitialized,
            "no local inference runtime linked",
        ))
    }
}

struct NoopStt;

#[async_trait]
impl SpeechToText for NoopStt {
    async fn transcribe(&self, _: &AudioFrame) -> sona::Result<Transcription> {
        Err(AssistantError::Voice("no STT engine linked".to_owned()))
    }
}

struct NoopTts;

#[async_trait]
impl TextToSpeech for NoopTts {
    async fn synthesize(&self, _: &str, _: &VoiceConfig) -> sona::Result<String> {
        Err(AssistantError::Voice("no TTS engine linked".to_owned()))
    }
}

struct AlwaysSpeech;

impl VoiceActivity for AlwaysSpeech {
    fn is_speech(&self, _: &AudioFrame) -> bool {
        true
    }
}

struct NeverWake;

impl WakeWord for NeverWake {
    fn detect(&self, _: &AudioFrame) -> WakeWordHit {
        WakeWordHit::default()
    }
}

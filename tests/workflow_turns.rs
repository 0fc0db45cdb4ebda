//! End-to-end turn tests over the workflow graph with mock
//! collaborators and a mock remote provider.

use sona::config::{ActivationMode, AssistantConfig};
use sona::integration::ResponseSource;
use sona::runtime::{Assistant, Collaborators};
use sona::state::Role;
use sona::testing::{
    FailingStt, FailingTts, FixedVad, FixedWake, InMemoryEngine, ScriptedLocalBackend, StaticStt,
    StaticTts, test_frame,
};
use sona::tracks::TrackErrorKind;
use sona::TurnOutcome;
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY_ENV: &str = "SONA_WORKFLOW_TEST_KEY";

/// Routes to PARALLEL under the lowered parallel threshold below.
const PARALLEL_QUERY: &str =
    "Compare solar and wind power, then explain which is cheaper, and evaluate why";

fn test_config(server: &MockServer, data_dir: &Path) -> AssistantConfig {
    // SAFETY: tests only set a fixed key/value pair, racing writers
    // agree on the value.
    unsafe {
        std::env::set_var(API_KEY_ENV, "test-key");
    }
    let mut config = AssistantConfig::default();
    config.activation.mode = ActivationMode::Continuous;
    config.remote.api_url = format!("{}/v1/chat/completions", server.uri());
    config.remote.api_key_env = API_KEY_ENV.to_owned();
    config.remote.max_retries = 1;
    config.remote.base_backoff_ms = 5;
    config.remote.timeout_ms = 2_000;
    config.local.timeout_ms = 2_000;
    config.router.parallel_threshold = 0.3;
    config.persistence.data_dir = Some(data_dir.to_path_buf());
    config.memory.summarization_threshold = 3;
    config.memory.summarize_batch = 2;
    config.memory.max_conversation_history = 6;
    config.optimizer.monitoring_enabled = false;
    config
}

struct Setup {
    engine: Arc<InMemoryEngine>,
    backend: ScriptedLocalBackend,
    stt: Arc<dyn sona::voice::SpeechToText>,
    tts: Arc<dyn sona::voice::TextToSpeech>,
    wake: Arc<dyn sona::voice::WakeWord>,
}

impl Setup {
    fn new(backend: ScriptedLocalBackend) -> Self {
        Self {
            engine: Arc::new(InMemoryEngine::new()),
            backend,
            stt: Arc::new(StaticStt::new("hello there")),
            tts: Arc::new(StaticTts::default()),
            wake: Arc::new(FixedWake(false)),
        }
    }

    async fn boot(self, config: AssistantConfig) -> Assistant {
        Assistant::boot(
            config,
            Collaborators {
                memory_engine: self.engine,
                local_backend: Box::new(self.backend),
                stt: self.stt,
                tts: self.tts,
                vad: Arc::new(FixedVad(true)),
                wake: self.wake,
            },
        )
        .await
        .expect("boot should succeed")
    }
}

async fn mock_api(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 18}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn simple_local_turn_completes_and_checkpoints() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "The answer is 4, as always.",
        16,
    ));
    let mut assistant = setup.boot(config).await;
    let conversation = assistant.conversation_id().to_owned();

    let outcome = assistant.process_text("What is 2+2?").await.unwrap();
    let TurnOutcome::Completed { response } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(response, "The answer is 4, as always.");

    let state = assistant.state();
    assert_eq!(
        state.messages.iter().filter(|m| m.role == Role::Assistant).count(),
        1
    );
    assert!(state.processing.local_completed);
    assert_eq!(
        state.activation.status,
        sona::state::ActivationStatus::Inactive
    );
    // TTS ran and produced a handle.
    assert!(state.audio.last_synthesis.is_some());
    // The checkpoint is durable before the turn reports complete.
    let checkpoint = dir
        .path()
        .join(&conversation)
        .join("checkpoints")
        .join("0.json");
    assert!(checkpoint.exists());
}

#[tokio::test]
async fn parallel_turn_runs_both_tracks_and_merges() {
    let server = MockServer::start().await;
    mock_api(&server, "Paris is France's capital city").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "Paris is the capital of France",
        12,
    ));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text(PARALLEL_QUERY).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));

    let processing = &assistant.state().processing;
    assert_eq!(
        processing.path,
        Some(sona::routing::ProcessingPath::Parallel)
    );
    assert!(processing.local_completed && processing.api_completed);
    assert!(processing.local_response.is_some());
    assert!(processing.api_response.is_some());
    let integration = processing.integration.as_ref().unwrap();
    assert!(integration.similarity_score.unwrap() >= 0.5);
}

#[tokio::test]
async fn local_failure_api_rescues_the_turn() {
    let server = MockServer::start().await;
    mock_api(&server, "A reliable remote answer.").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::failing(
        TrackErrorKind::GenerationFailed,
    ));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text(PARALLEL_QUERY).await.unwrap();
    let TurnOutcome::Completed { response } = outcome else {
        panic!("turn should complete");
    };
    assert_eq!(response, "A reliable remote answer.");
    let integration = assistant.state().processing.integration.as_ref().unwrap();
    assert_eq!(integration.source, ResponseSource::Api);
}

#[tokio::test]
async fn both_tracks_failing_yields_canned_apology() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::failing(
        TrackErrorKind::GenerationFailed,
    ));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text(PARALLEL_QUERY).await.unwrap();
    let TurnOutcome::Completed { response } = outcome else {
        panic!("turn should still complete");
    };
    let lowered = response.to_lowercase();
    assert!(
        lowered.contains("trouble") || lowered.contains("apolog"),
        "unexpected fallback text: {response}"
    );
    assert_eq!(
        assistant.state().processing.integration.as_ref().unwrap().source,
        ResponseSource::Fallback
    );
}

#[tokio::test]
async fn staged_path_escalates_on_thin_local_answer() {
    let server = MockServer::start().await;
    mock_api(&server, "A much fuller remote explanation of tides.").await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    // Keep the parallel threshold high so the medium query stays STAGED.
    config.router.parallel_threshold = 0.9;
    let setup = Setup::new(ScriptedLocalBackend::completing("ok", 1));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant
        .process_text("Explain how ocean tides work and why they differ between coastal regions")
        .await
        .unwrap();
    let TurnOutcome::Completed { response } = outcome else {
        panic!("turn should complete");
    };

    let processing = &assistant.state().processing;
    assert_eq!(processing.path, Some(sona::routing::ProcessingPath::Staged));
    assert!(processing.api_completed, "staged turn should have escalated");
    assert_eq!(response, "A much fuller remote explanation of tides.");
}

#[tokio::test]
async fn memory_outage_degrades_softly() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "Photosynthesis converts light into sugar.",
        14,
    ));
    setup
        .engine
        .fail_retrieval
        .store(true, std::sync::atomic::Ordering::SeqCst);
    setup
        .engine
        .fail_storage
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text("What is 2+2?").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    let memory = &assistant.state().memory;
    assert_eq!(memory.retrieval_status.as_deref(), Some("retrieval_error"));
    assert_eq!(memory.storage_status.as_deref(), Some("storage_error"));
    // The exchange still lands in rolling history.
    assert_eq!(memory.conversation_history.len(), 1);
}

#[tokio::test]
async fn summarization_compacts_history_past_threshold() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "Sure, noted and answered.",
        12,
    ));
    let mut assistant = setup.boot(config).await;

    for i in 0..4 {
        let outcome = assistant
            .process_text(&format!("Question number {i} here?"))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }), "turn {i}");
    }

    let state = assistant.state();
    // Threshold 3, batch 2: four stored exchanges collapse to two.
    assert_eq!(state.memory.conversation_history.len(), 2);
    assert!(state.memory.last_summary.is_some());
    assert_eq!(state.memory.summarization_status.as_deref(), Some("ok"));
    assert!(
        state
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("Conversation summary")),
        "summary system message missing"
    );
}

#[tokio::test]
async fn stt_failure_appends_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let mut setup = Setup::new(ScriptedLocalBackend::completing("irrelevant", 10));
    setup.stt = Arc::new(FailingStt);
    let mut assistant = setup.boot(config).await;

    let outcome = assistant
        .process_frame(test_frame(vec![0.2; 1600]))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Skipped);
    assert!(assistant.state().messages.is_empty());
    assert!(
        assistant
            .state()
            .audio
            .error
            .as_deref()
            .is_some_and(|e| e.contains("stt_error"))
    );
    // A failed transcription returns the turn to listening, never inactive.
    assert_eq!(
        assistant.state().activation.status,
        sona::state::ActivationStatus::Listening
    );
}

#[tokio::test]
async fn voice_turn_flows_through_stt() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "Hello! How can I help?",
        12,
    ));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant
        .process_frame(test_frame(vec![0.3; 1600]))
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    let state = assistant.state();
    // The transcribed text became the user message.
    assert_eq!(state.messages[0].content, "hello there");
    assert_eq!(state.messages[0].role, Role::User);
    assert!(state.audio.pending_frame.is_none(), "frame must be consumed");
    assert!(state.audio.last_transcription.is_some());
}

#[tokio::test]
async fn tts_failure_keeps_the_assistant_message() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let mut setup = Setup::new(ScriptedLocalBackend::completing(
        "Here's your answer anyway.",
        12,
    ));
    setup.tts = Arc::new(FailingTts);
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text("What is 2+2?").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    let state = assistant.state();
    assert!(state.last_assistant_message().is_some());
    assert!(state.audio.last_synthesis.is_none());
    assert!(
        state
            .audio
            .error
            .as_deref()
            .is_some_and(|e| e.contains("tts_error"))
    );
}

#[tokio::test]
async fn checkpoint_resume_continues_without_duplicates() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let conversation_id;
    {
        let config = test_config(&server, dir.path());
        let setup = Setup::new(ScriptedLocalBackend::completing(
            "First answer, stored durably.",
            12,
        ));
        let mut assistant = setup.boot(config).await;
        conversation_id = assistant.conversation_id().to_owned();
        let outcome = assistant.process_text("What is 2+2?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assistant.shutdown().await.unwrap();
    }

    let config = test_config(&server, dir.path());
    let setup = Setup::new(ScriptedLocalBackend::completing(
        "Second answer after restart.",
        12,
    ));
    let mut assistant = setup.boot(config).await;
    assert!(assistant.resume(&conversation_id).await.unwrap());

    // The restored state carries the first exchange exactly once.
    let assistant_messages = |a: &Assistant| {
        a.state()
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    };
    assert_eq!(assistant_messages(&assistant), 1);

    let outcome = assistant.process_text("And what is 3+3?").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(assistant_messages(&assistant), 2);
}

#[tokio::test]
async fn cancellation_discards_the_partial_turn() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.local.timeout_ms = 10_000;
    let setup = Setup::new(ScriptedLocalBackend::stalling_after("partial", 3));
    let mut assistant = setup.boot(config).await;

    let interrupt = assistant.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        interrupt.cancel();
    });

    let outcome = assistant.process_text("What is 2+2?").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Cancelled);
    // Partial work discarded entirely; back to listening.
    let state = assistant.state();
    assert!(state.messages.is_empty());
    assert!(state.memory.conversation_history.is_empty());
    assert_eq!(
        state.activation.status,
        sona::state::ActivationStatus::Listening
    );
}

#[tokio::test]
async fn wake_word_mode_ignores_speech_without_the_wake_word() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.activation.mode = ActivationMode::WakeWord;
    let setup = Setup::new(ScriptedLocalBackend::completing("never heard", 10));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant
        .process_frame(test_frame(vec![0.3; 1600]))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Skipped);
    assert!(assistant.state().messages.is_empty());
    assert_eq!(
        assistant.state().activation.status,
        sona::state::ActivationStatus::Inactive
    );
}

#[tokio::test]
async fn wake_word_opens_a_window_then_hears_the_utterance() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.activation.mode = ActivationMode::WakeWord;
    let mut setup = Setup::new(ScriptedLocalBackend::completing(
        "Yes, I'm listening.",
        12,
    ));
    setup.wake = Arc::new(FixedWake(true));
    let mut assistant = setup.boot(config).await;

    // The first frame only wakes the assistant.
    let first = assistant
        .process_frame(test_frame(vec![0.3; 1600]))
        .await
        .unwrap();
    assert_eq!(first, TurnOutcome::Skipped);
    assert!(assistant.state().messages.is_empty());
    assert_eq!(
        assistant.state().activation.status,
        sona::state::ActivationStatus::Listening
    );
    assert!(assistant.state().activation.wake_word_detected);

    // The next frame carries the utterance and completes a turn.
    let second = assistant
        .process_frame(test_frame(vec![0.3; 1600]))
        .await
        .unwrap();
    assert!(matches!(second, TurnOutcome::Completed { .. }));
    assert_eq!(assistant.state().messages[0].content, "hello there");
}

#[tokio::test]
async fn off_mode_processes_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.activation.mode = ActivationMode::Off;
    let setup = Setup::new(ScriptedLocalBackend::completing("never", 10));
    let mut assistant = setup.boot(config).await;

    let outcome = assistant.process_text("Anyone home?").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Skipped);
    assert!(assistant.state().last_assistant_message().is_none());
}

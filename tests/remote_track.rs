//! Remote controller integration tests against a mock provider.

use sona::config::RemoteModelConfig;
use sona::state::ChatMessage;
use sona::tracks::{GenerationParams, RemoteController, TrackErrorKind, TrackSource};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn params() -> GenerationParams {
    GenerationParams {
        max_tokens: 128,
        temperature: 0.7,
        top_p: 0.95,
        top_k: 40,
        repeat_penalty: 1.1,
        stop_sequences: Vec::new(),
    }
}

fn controller(server: &MockServer, max_retries: u32) -> RemoteController {
    RemoteController::new(RemoteModelConfig {
        api_url: format!("{}/v1/chat/completions", server.uri()),
        api_key_env: "SONA_TEST_KEY_UNSET".to_owned(),
        max_retries,
        base_backoff_ms: 10,
        timeout_ms: 5_000,
        ..RemoteModelConfig::default()
    })
    .with_api_key("test-key")
}

fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 20}
    })
}

fn deadline(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

#[tokio::test]
async fn successful_completion_parses_content_and_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Paris.")))
        .expect(1)
        .mount(&server)
        .await;

    let response = controller(&server, 3)
        .generate(&[ChatMessage::user("Capital of France?")], &params(), deadline(5_000))
        .await;

    assert!(response.success);
    assert_eq!(response.content, "Paris.");
    assert_eq!(response.source, TrackSource::Api);
    assert_eq!(response.tokens_used, 32);
    assert!(response.cost_estimate > 0.0);
    assert_eq!(response.finish_reason, "stop");
}

#[tokio::test]
async fn transient_failure_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Recovered.")))
        .mount(&server)
        .await;

    let response = controller(&server, 3)
        .generate(&[ChatMessage::user("hi")], &params(), deadline(5_000))
        .await;

    assert!(response.success, "expected retry to recover: {:?}", response.error_kind);
    assert_eq!(response.content, "Recovered.");
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let response = controller(&server, 3)
        .generate(&[ChatMessage::user("hi")], &params(), deadline(5_000))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(TrackErrorKind::AuthFailed));
}

#[tokio::test]
async fn rate_limit_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let response = controller(&server, 2)
        .generate(&[ChatMessage::user("hi")], &params(), deadline(5_000))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(TrackErrorKind::RateLimited));
}

#[tokio::test]
async fn malformed_body_reports_response_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let response = controller(&server, 1)
        .generate(&[ChatMessage::user("hi")], &params(), deadline(5_000))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(TrackErrorKind::ResponseMalformed));
}

#[tokio::test]
async fn deadline_covers_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let started = Instant::now();
    let response = controller(&server, 10)
        .generate(&[ChatMessage::user("hi")], &params(), deadline(400))
        .await;

    assert!(!response.success);
    assert!(
        matches!(
            response.error_kind,
            Some(TrackErrorKind::Timeout)
                | Some(TrackErrorKind::NetworkTimeout)
                | Some(TrackErrorKind::ServiceUnavailable)
        ),
        "got {:?}",
        response.error_kind
    );
    // Total wall time stays near the deadline despite the retry budget.
    assert!(started.elapsed() < Duration::from_millis(2_000));
}

#[tokio::test]
async fn missing_api_key_fails_auth_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("x")))
        .expect(0)
        .mount(&server)
        .await;

    let controller = RemoteController::new(RemoteModelConfig {
        api_url: format!("{}/v1/chat/completions", server.uri()),
        api_key_env: "SONA_TEST_KEY_DEFINITELY_UNSET".to_owned(),
        ..RemoteModelConfig::default()
    });
    let response = controller
        .generate(&[ChatMessage::user("hi")], &params(), deadline(1_000))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(TrackErrorKind::AuthFailed));
}

#[tokio::test]
async fn streaming_yields_chunks_with_terminal_finish() {
    use futures_util::StreamExt;

    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Pa\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ris\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let mut stream = controller(&server, 1)
        .generate_stream(&[ChatMessage::user("Capital?")], &params(), deadline(5_000))
        .await
        .expect("stream should open");

    let mut text = String::new();
    let mut last_tokens = 0;
    let mut finish = None;
    while let Some(item) = stream.next().await {
        let chunk = item.expect("chunk should parse");
        text.push_str(&chunk.content);
        assert!(chunk.tokens_so_far >= last_tokens, "token counts must be monotone");
        last_tokens = chunk.tokens_so_far;
        if let Some(reason) = chunk.finish_reason {
            finish = Some(reason);
            break;
        }
    }
    assert_eq!(text, "Paris");
    assert_eq!(finish.as_deref(), Some("stop"));
}

//! Streaming transport tests against a mock inference service.
//!
//! These drive `InferenceClient::open_stream` over real HTTP and check how the
//! record stream decodes, how pre-stream failures map to errors, and that an
//! abort closes the stream.

use std::time::Duration;

use drover_engine::drover_providers::{ApiError, EventStream, InferenceRequest, PromptInput, build_request};
use drover_engine::drover_types::{ConversationMessage, CreativeMode, ModelId, StreamEvent};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{
    INFERENCE_PATH, client_for, display_record, error_record, final_record, mount_once,
    mount_status, partial_record, request_bodies, start_inference_mock,
};

fn request() -> InferenceRequest {
    let messages = vec![ConversationMessage::user_text("hello")];
    build_request(&PromptInput {
        model: ModelId::Claude35Sonnet,
        creative_mode: CreativeMode::Normal,
        system_prompt: "You are Drover.",
        custom_instructions: None,
        messages: &messages,
        environment_details: None,
    })
}

async fn drain(mut stream: EventStream) -> Vec<Result<StreamEvent, ApiError>> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn decodes_records_in_order() {
    let server = start_inference_mock().await;
    let mut body = partial_record();
    body.push_str(&display_record("Hel"));
    body.push_str(&display_record("lo"));
    body.push_str(&error_record(529, "Overloaded"));
    body.push_str(&final_record("Hello"));
    mount_once(&server, body).await;

    let client = client_for(&server);
    let stream = client
        .open_stream(&request(), CancellationToken::new())
        .await
        .unwrap();
    let events = drain(stream).await;

    assert_eq!(events.len(), 5);
    assert!(matches!(events[0], Ok(StreamEvent::Partial)));
    assert!(matches!(&events[1], Ok(StreamEvent::Display(t)) if t == "Hel"));
    assert!(matches!(&events[2], Ok(StreamEvent::Display(t)) if t == "lo"));
    assert!(
        matches!(&events[3], Ok(StreamEvent::Error(e)) if e.status == Some(529) && e.message == "Overloaded")
    );
    let Ok(StreamEvent::Final(response)) = &events[4] else {
        panic!("expected final event, got {:?}", events[4]);
    };
    assert_eq!(response.message.text(), "Hello");
    assert_eq!(response.usage.input_tokens, 12);
    assert_eq!(response.usage.cost, Some(0.004));
    assert_eq!(response.usage.credits_remaining, Some(9.5));
}

#[tokio::test]
async fn sends_model_and_cache_markers() {
    let server = start_inference_mock().await;
    mount_once(&server, final_record("ok")).await;

    let client = client_for(&server);
    let stream = client
        .open_stream(&request(), CancellationToken::new())
        .await
        .unwrap();
    drain(stream).await;

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["model"], "claude-3-5-sonnet-20240620");
    assert_eq!(bodies[0]["system"][0]["cache_control"]["type"], "ephemeral");
    assert_eq!(bodies[0]["messages"][0]["role"], "user");
}

#[tokio::test]
async fn stream_ending_without_final_is_a_network_error() {
    let server = start_inference_mock().await;
    mount_once(&server, display_record("half an ans")).await;

    let client = client_for(&server);
    let stream = client
        .open_stream(&request(), CancellationToken::new())
        .await
        .unwrap();
    let events = drain(stream).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], Err(ApiError::Network)));
}

#[tokio::test]
async fn malformed_record_is_a_protocol_error() {
    let server = start_inference_mock().await;
    let mut body = display_record("fine");
    body.push_str("data: {not json}\n\n");
    body.push_str(&final_record("never seen"));
    mount_once(&server, body).await;

    let client = client_for(&server);
    let stream = client
        .open_stream(&request(), CancellationToken::new())
        .await
        .unwrap();
    let events = drain(stream).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], Err(ApiError::StreamProtocol(_))));
    assert!(events[1].as_ref().unwrap_err().is_fatal());
}

#[tokio::test]
async fn error_statuses_map_before_streaming() {
    let server = start_inference_mock().await;
    mount_status(&server, 401, "bad key").await;
    mount_status(&server, 429, "").await;
    mount_status(&server, 500, "upstream exploded").await;

    let client = client_for(&server);
    let unauthorized = client.open_stream(&request(), CancellationToken::new()).await;
    assert!(matches!(unauthorized, Err(ApiError::Unauthorized)));

    let limited = client.open_stream(&request(), CancellationToken::new()).await;
    assert!(matches!(limited, Err(ApiError::RateLimited)));

    let refused = client.open_stream(&request(), CancellationToken::new()).await;
    let Err(ApiError::ConnectionRefused(detail)) = refused else {
        panic!("expected connection refused");
    };
    assert!(detail.contains("500"));
    assert!(detail.contains("upstream exploded"));
}

#[tokio::test]
async fn abort_closes_an_open_stream() {
    let server = start_inference_mock().await;
    Mock::given(method("POST"))
        .and(path(INFERENCE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(display_record("slow"))
                .insert_header("content-type", "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = client.open_stream(&request(), cancel).await;
    assert!(matches!(result, Err(ApiError::Aborted)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests: a mock inference service that
//! speaks the `data: {"code": ..}` record stream.

#![allow(dead_code)]

use std::time::Duration;

use drover_engine::drover_providers::ClientConfig;
use drover_engine::drover_types::ApiKey;
use drover_engine::InferenceClient;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const INFERENCE_PATH: &str = "/api/inference-stream";
pub const TEST_API_KEY: &str = "test-key";

/// Start a mock server that simulates the inference service
pub async fn start_inference_mock() -> MockServer {
    MockServer::start().await
}

pub fn client_for(server: &MockServer) -> InferenceClient {
    let base_url = Url::parse(&server.uri()).expect("mock uri is a valid url");
    let api_key = ApiKey::new(TEST_API_KEY).expect("non-empty key");
    let mut config = ClientConfig::new(base_url, api_key);
    config.request_timeout = Duration::from_secs(5);
    config.stream_idle_timeout = Duration::from_secs(5);
    InferenceClient::new(config).expect("client builds")
}

fn record(value: &serde_json::Value) -> String {
    format!("data: {value}\n\n")
}

pub fn display_record(text: &str) -> String {
    record(&serde_json::json!({"code": 2, "body": {"text": text}}))
}

pub fn partial_record() -> String {
    record(&serde_json::json!({"code": 0}))
}

pub fn error_record(status: u16, msg: &str) -> String {
    record(&serde_json::json!({"code": -1, "body": {"status": status, "msg": msg}}))
}

pub fn final_record(text: &str) -> String {
    record(&serde_json::json!({
        "code": 1,
        "body": {
            "anthropic": {
                "role": "assistant",
                "content": [{"type": "text", "text": text}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 7}
            },
            "internal": {"cost": 0.004, "userCredits": 9.5}
        }
    }))
}

/// A complete reply: the text as two display records, then the final record.
pub fn reply_body(text: &str) -> String {
    let split = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map_or(text.len(), |(i, _)| i);
    let mut body = partial_record();
    body.push_str(&display_record(&text[..split]));
    body.push_str(&display_record(&text[split..]));
    body.push_str(&final_record(text));
    body
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "text/event-stream")
}

/// Mount a streamed response that answers exactly one request. Responses
/// mounted earlier answer first.
pub async fn mount_once(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path(INFERENCE_PATH))
        .and(header("x-api-key", TEST_API_KEY))
        .respond_with(sse(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

pub async fn mount_reply(server: &MockServer, text: &str) {
    mount_once(server, reply_body(text)).await;
}

pub async fn mount_status(server: &MockServer, status: u16, body: &str) {
    Mock::given(method("POST"))
        .and(path(INFERENCE_PATH))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Bodies of every request the server received, as JSON.
pub async fn request_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|req| serde_json::from_slice(&req.body).expect("request body is json"))
        .collect()
}

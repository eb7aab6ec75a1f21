//! Inference service client with incremental SSE decoding.
//!
//! # Architecture
//!
//! - [`cache`] - Builds the outbound request and places prompt-cache markers
//! - [`EventStream`] - Frames a chunked byte stream into records and decodes each
//!   record into a [`StreamEvent`] as soon as its boundary arrives
//! - [`sse_types`] - Wire record shapes and [`decode_record`]
//! - [`InferenceClient`] - HTTP transport; implements [`InferenceTransport`], the
//!   seam the tool loop consumes
//! - [`auxiliary`] - Side endpoints sharing auth, timeout, and cancellation
//!
//! # Streaming Contract
//!
//! [`EventStream::next`] is a lazy, single-pass sequence. It yields
//! `Some(Ok(event))` per decoded record, at most one `Some(Err(_))` for a
//! terminal failure, then `None` forever. After `Final` the byte source is
//! dropped, which closes the connection. A source that ends without `Final`
//! yields [`ApiError::Network`].
//!
//! Mid-stream provider errors arrive as `StreamEvent::Error` and do not end the
//! stream; the caller decides what to do with them.

pub mod auxiliary;
pub mod cache;
pub mod error;
pub mod retry;
pub mod sse_types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use cache::{InferenceRequest, PromptInput, build_request};
pub use drover_types;
pub use drover_types::{ApiKey, StreamEvent};
pub use error::{ApiError, ErrorKind, StreamProtocolError};
pub use sse_types::decode_record;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

const INFERENCE_PATH: &str = "api/inference-stream";

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ApiError>>;

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

/// Byte buffer that splits on record boundaries.
///
/// Records are UTF-8 decoded only once complete, so a multi-byte character
/// split across chunks decodes the same as an unsplit one.
#[derive(Debug, Default)]
struct RecordFramer {
    buffer: Vec<u8>,
}

impl RecordFramer {
    fn push(&mut self, chunk: &[u8]) -> Result<(), StreamProtocolError> {
        self.buffer.extend_from_slice(chunk);
        // A single record may not exceed the cap; completed records drain first.
        if self.buffer.len() > MAX_SSE_BUFFER_BYTES
            && find_sse_event_boundary(&self.buffer).is_none()
        {
            return Err(StreamProtocolError::BufferOverflow {
                limit: MAX_SSE_BUFFER_BYTES,
            });
        }
        Ok(())
    }

    /// Next record payload, skipping records without a `data:` line.
    fn next_payload(&mut self) -> Option<Result<String, StreamProtocolError>> {
        while let Some(record) = drain_next_sse_event(&mut self.buffer) {
            if record.is_empty() {
                continue;
            }
            let Ok(record) = std::str::from_utf8(&record) else {
                return Some(Err(StreamProtocolError::InvalidUtf8));
            };
            if let Some(data) = extract_sse_data(record) {
                return Some(Ok(data));
            }
        }
        None
    }
}

/// Lazy, single-pass sequence of decoded stream events.
pub struct EventStream {
    source: Option<ByteStream>,
    framer: RecordFramer,
    cancel: CancellationToken,
    idle_timeout: Duration,
    finished: bool,
}

enum Pull {
    Cancelled,
    IdleTimeout,
    Chunk(Option<Result<Vec<u8>, ApiError>>),
}

impl EventStream {
    #[must_use]
    pub fn new(source: ByteStream, cancel: CancellationToken, idle_timeout: Duration) -> Self {
        Self {
            source: Some(source),
            framer: RecordFramer::default(),
            cancel,
            idle_timeout,
            finished: false,
        }
    }

    /// Drop the byte source, closing the underlying connection.
    fn close(&mut self) {
        self.source = None;
        self.finished = true;
    }

    fn fail(&mut self, error: ApiError) -> Option<Result<StreamEvent, ApiError>> {
        self.close();
        Some(Err(error))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent, ApiError>> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                return self.fail(ApiError::Aborted);
            }

            if let Some(payload) = self.framer.next_payload() {
                return match payload.and_then(|data| decode_record(&data)) {
                    Ok(event) => {
                        if event.is_final() {
                            self.close();
                        }
                        Some(Ok(event))
                    }
                    Err(e) => self.fail(e.into()),
                };
            }

            let Some(source) = self.source.as_mut() else {
                return self.fail(ApiError::Network);
            };
            let pull = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Pull::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, source.next()) => match next {
                    Ok(chunk) => Pull::Chunk(chunk),
                    Err(_) => Pull::IdleTimeout,
                },
            };

            match pull {
                Pull::Cancelled => return self.fail(ApiError::Aborted),
                Pull::IdleTimeout => {
                    tracing::warn!(timeout = ?self.idle_timeout, "Stream idle timeout");
                    return self.fail(ApiError::Timeout);
                }
                Pull::Chunk(None) => return self.fail(ApiError::Network),
                Pull::Chunk(Some(Err(e))) => return self.fail(e),
                Pull::Chunk(Some(Ok(chunk))) => {
                    if let Err(e) = self.framer.push(&chunk) {
                        return self.fail(e.into());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("open", &self.source.is_some())
            .field("buffered_bytes", &self.framer.buffer.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

pub type OpenStreamFut<'a> = Pin<Box<dyn Future<Output = Result<EventStream, ApiError>> + Send + 'a>>;

/// Opens one streamed inference call.
pub trait InferenceTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        request: &'a InferenceRequest,
        cancel: CancellationToken,
    ) -> OpenStreamFut<'a>;
}

/// Connection settings for [`InferenceClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub api_key: ApiKey,
    /// Bound on receiving response headers.
    pub request_timeout: Duration,
    /// Bound on the gap between two body chunks.
    pub stream_idle_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: Url, api_key: ApiKey) -> Self {
        Self {
            base_url,
            api_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }
}

/// Whether `url` names the local machine.
#[must_use]
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn base_client_builder(base_url: &Url) -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert("X-Drover-OS", HeaderValue::from_static(std::env::consts::OS));
    default_headers.insert(
        "X-Drover-Arch",
        HeaderValue::from_static(std::env::consts::ARCH),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        // Plain HTTP only for a local service.
        .https_only(!is_loopback(base_url))
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// HTTP client for the inference service.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl InferenceClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = base_client_builder(&config.base_url).build()?;
        Ok(Self { http, config })
    }

    /// Use a caller-provided HTTP client (tests, shared pools).
    #[must_use]
    pub fn with_http_client(http: reqwest::Client, config: ClientConfig) -> Self {
        Self { http, config }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ApiError::ConnectionRefused(format!(
                    "base URL cannot carry a path: {}",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }

    /// Send a prepared request and wait for the response head, bounded by the
    /// request timeout and the cancellation token.
    pub(crate) async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ApiError> {
        let request = request
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("content-type", "application/json");

        // One deadline covers the response head and any error body.
        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ApiError::Aborted),
            outcome = tokio::time::timeout_at(deadline, request.send()) => outcome,
        };

        let response = match outcome {
            Err(_) => return Err(ApiError::Timeout),
            Ok(Err(e)) if e.is_timeout() => return Err(ApiError::Timeout),
            Ok(Err(e)) => return Err(ApiError::ConnectionRefused(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ApiError::Aborted),
                body = tokio::time::timeout_at(deadline, read_capped_error_body(response)) => {
                    body.map_err(|_| ApiError::Timeout)?
                }
            };
            tracing::warn!(status = status.as_u16(), "Inference service returned error status");
            return Err(ApiError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }

    pub async fn open_stream(
        &self,
        request: &InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ApiError> {
        let url = self.endpoint(INFERENCE_PATH)?;
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Opening inference stream"
        );

        let response = self.send(self.http.post(url).json(request), &cancel).await?;
        let source = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from))
            .boxed();
        Ok(EventStream::new(
            source,
            cancel,
            self.config.stream_idle_timeout,
        ))
    }
}

impl InferenceTransport for InferenceClient {
    fn open_stream<'a>(
        &'a self,
        request: &'a InferenceRequest,
        cancel: CancellationToken,
    ) -> OpenStreamFut<'a> {
        Box::pin(InferenceClient::open_stream(self, request, cancel))
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use drover_types::{CreativeMode, ModelId};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> InferenceClient {
        let mut config = ClientConfig::new(
            Url::parse(&server.uri()).unwrap(),
            ApiKey::new("test-key").unwrap(),
        );
        config.request_timeout = Duration::from_millis(500);
        InferenceClient::with_http_client(reqwest::Client::new(), config)
    }

    fn request() -> InferenceRequest {
        let messages = vec![drover_types::ConversationMessage::user_text("hi")];
        build_request(&PromptInput {
            model: ModelId::default(),
            creative_mode: CreativeMode::Normal,
            system_prompt: "You are an assistant",
            custom_instructions: None,
            messages: &messages,
            environment_details: None,
        })
    }

    #[tokio::test]
    async fn streams_events_from_server() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"code\":2,\"body\":{\"text\":\"Hi\"}}\n\n",
            "data: {\"code\":1,\"body\":{\"anthropic\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi\"}]}}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/inference-stream"))
            .and(header("x-api-key", "test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut stream = client
            .open_stream(&request(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamEvent::Display("Hi".to_string())
        );
        assert!(stream.next().await.unwrap().unwrap().is_final());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sends_cache_marked_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference-stream"))
            .and(wiremock::matchers::body_partial_json(serde_json::json!({
                "model": "claude-3-5-sonnet-20240620",
                "system": [{"type": "text", "text": "You are an assistant", "cache_control": {"type": "ephemeral"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"code\":1,\"body\":{\"anthropic\":{\"content\":[]}}}\n\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut stream = client
            .open_stream(&request(), CancellationToken::new())
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_final());
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        for (status, expected) in [
            (401, ErrorKind::Unauthorized),
            (402, ErrorKind::PaymentRequired),
            (429, ErrorKind::RateLimited),
            (504, ErrorKind::Timeout),
            (500, ErrorKind::ConnectionRefused),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/inference-stream"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let err = client_for(&server)
                .open_stream(&request(), CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), expected, "status {status}");
        }
    }

    /// Serve one connection: a 500 head promising 100 body bytes, then silence.
    async fn stalled_error_body_server() -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\npartial";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    fn stalled_client(base_url: Url, request_timeout: Duration) -> InferenceClient {
        let mut config = ClientConfig::new(base_url, ApiKey::new("test-key").unwrap());
        config.request_timeout = request_timeout;
        InferenceClient::with_http_client(reqwest::Client::new(), config)
    }

    #[tokio::test]
    async fn stalled_error_body_times_out() {
        let client = stalled_client(
            stalled_error_body_server().await,
            Duration::from_millis(300),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.open_stream(&request(), CancellationToken::new()),
        )
        .await
        .expect("open_stream must not hang on a stalled error body");
        assert!(matches!(result, Err(ApiError::Timeout)));
    }

    #[tokio::test]
    async fn cancel_interrupts_stalled_error_body() {
        let client = stalled_client(stalled_error_body_server().await, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.open_stream(&request(), cancel),
        )
        .await
        .expect("cancellation must end a stalled error body read");
        assert!(matches!(result, Err(ApiError::Aborted)));
    }

    #[tokio::test]
    async fn slow_response_head_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference-stream"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .open_stream(&request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout));
    }

    #[tokio::test]
    async fn cancelled_before_send_is_aborted() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client_for(&server)
            .open_stream(&request(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Aborted));
    }

    #[test]
    fn endpoint_appends_to_base_path() {
        let config = ClientConfig::new(
            Url::parse("https://example.test/v1/").unwrap(),
            ApiKey::new("k").unwrap(),
        );
        let client = InferenceClient::with_http_client(reqwest::Client::new(), config);
        assert_eq!(
            client.endpoint(INFERENCE_PATH).unwrap().as_str(),
            "https://example.test/v1/api/inference-stream"
        );
    }
}

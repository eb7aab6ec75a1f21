//! Side endpoints of the inference service.
//!
//! All of them share the `x-api-key` header, the request timeout, the status
//! table of [`ApiError::from_status`], and a cancellation token supplied by
//! the caller.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use drover_types::ContentBlock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{ApiError, InferenceClient};

const WEB_SEARCH_PATH: &str = "api/tools/web-search";
const SCREENSHOT_PATH: &str = "api/tools/screenshot";
const CONSULTANT_PATH: &str = "api/tools/consultant";
const SUMMARIZE_PATH: &str = "api/tools/summarize";
const BUG_REPORT_PATH: &str = "api/bug-report";

const SCREENSHOT_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebSearchResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsultantResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SummaryResponse {
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BugReport {
    pub description: String,
    pub reproduction: String,
    pub api_history: String,
    pub claude_message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebSearchRequest<'a> {
    search_query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_link: Option<&'a str>,
}

#[derive(Serialize)]
struct ScreenshotRequest<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ConsultantRequest<'a> {
    query: &'a str,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    output: &'a str,
    command: &'a str,
}

impl InferenceClient {
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.endpoint(path)?;
        let timeout = self.config().request_timeout;
        self.send(self.http.post(url).timeout(timeout).json(body), cancel)
            .await
    }

    async fn read_body(
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ApiError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ApiError::Aborted),
            bytes = response.bytes() => bytes.map(|b| b.to_vec()).map_err(ApiError::from),
        }
    }

    async fn post_for<B, R>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self.post_json(path, body, cancel).await?;
        let bytes = Self::read_body(response, cancel).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ApiError::ConnectionRefused(format!("unexpected response from {path}: {e}"))
        })
    }

    pub async fn web_search(
        &self,
        query: &str,
        base_link: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WebSearchResponse, ApiError> {
        let body = WebSearchRequest {
            search_query: query,
            base_link,
        };
        self.post_for(WEB_SEARCH_PATH, &body, cancel).await
    }

    /// Capture a page screenshot as an image content block.
    pub async fn url_screenshot(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ContentBlock, ApiError> {
        let response = self
            .post_json(SCREENSHOT_PATH, &ScreenshotRequest { url }, cancel)
            .await?;
        let bytes = Self::read_body(response, cancel).await?;
        Ok(ContentBlock::image(SCREENSHOT_MEDIA_TYPE, STANDARD.encode(bytes)))
    }

    pub async fn ask_consultant(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<ConsultantResponse, ApiError> {
        self.post_for(CONSULTANT_PATH, &ConsultantRequest { query }, cancel)
            .await
    }

    pub async fn summarize(
        &self,
        output: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<SummaryResponse, ApiError> {
        self.post_for(SUMMARIZE_PATH, &SummarizeRequest { output, command }, cancel)
            .await
    }

    pub async fn bug_report(
        &self,
        report: &BugReport,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        self.post_json(BUG_REPORT_PATH, report, cancel).await?;
        Ok(())
    }
}

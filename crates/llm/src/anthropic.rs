//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use pipeline::reasoning::ReasoningUsage;
use pipeline::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse, TokenCount};

use crate::pricing::Pricing;
use crate::secret::ApiKey;

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Upper bound for one completion call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Settings for [`AnthropicProvider`].
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: ApiKey,
    pub model: String,
    pub base_url: String,
    pub pricing: Pricing,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: ANTHROPIC_API_URL.to_string(),
            pricing: Pricing::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Implements [`ReasoningProvider`] for Anthropic models.
#[derive(Debug)]
pub struct AnthropicProvider {
    http: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: UsageInfo,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[async_trait]
impl ReasoningProvider for AnthropicProvider {
    #[instrument(skip(self, request), fields(model = %self.config.model, trace_id = %request.trace_id))]
    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: [ApiMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(&self.config.base_url)
            .header("x-api-key", self.config.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasoningError::Timeout(self.config.request_timeout)
                } else {
                    ReasoningError::Provider(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::InvalidOutput(e.without_url().to_string()))?;
        self.into_reasoning_response(parsed)
    }
}

impl AnthropicProvider {
    fn into_reasoning_response(&self, parsed: MessagesResponse) -> Result<ReasoningResponse, ReasoningError> {
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            warn!("Completion stopped at the output token limit");
        }
        let usage = ReasoningUsage {
            input_tokens: TokenCount::new(parsed.usage.input_tokens),
            output_tokens: TokenCount::new(parsed.usage.output_tokens),
        };
        let cost = self.config.pricing.cost(usage);
        debug!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            cost = %cost,
            "Token usage"
        );
        Ok(ReasoningResponse { text, usage, cost })
    }
}

/// Reads `retry-after` as whole seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ReasoningError {
    // 529 is Anthropic's "overloaded".
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529 {
        return ReasoningError::RateLimited { retry_after };
    }
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());
    ReasoningError::Provider(format!("HTTP {}: {message}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn provider(base_url: &str) -> AnthropicProvider {
        AnthropicProvider::new(
            AnthropicConfig::new(ApiKey::new("sk-test-secret")).with_base_url(base_url),
        )
    }

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            system: Some("Be brief.".into()),
            prompt: "Say hi.".into(),
            max_tokens: 64,
            trace_id: "t-1".into(),
        }
    }

    /// Answers one HTTP request with `response` and returns what it received.
    async fn one_shot(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v1/messages", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut received = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if received.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn completion_text_usage_and_cost() {
        let body = r#"{"content":[{"type":"text","text":"hi"},{"type":"thinking","thinking":"x"},{"type":"text","text":" there"}],"usage":{"input_tokens":1000000,"output_tokens":0},"stop_reason":"end_turn"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let (url, server) = one_shot(response).await;

        let reply = provider(&url).complete(request()).await.unwrap();
        assert_eq!(reply.text, "hi there");
        assert_eq!(reply.usage.input_tokens.as_u64(), 1_000_000);
        assert!((reply.cost.as_f64() - Pricing::default().input_per_mtok).abs() < 1e-9);

        let received = server.await.unwrap();
        assert!(received.contains("x-api-key: sk-test-secret"));
        assert!(received.contains("anthropic-version: 2023-06-01"));
        assert!(received.contains("\"system\":\"Be brief.\""));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let (url, _server) = one_shot(
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 30\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let err = provider(&url).complete(request()).await.unwrap_err();
        assert_eq!(
            err,
            ReasoningError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }

    #[test]
    fn provider_errors_use_the_api_message() {
        let err = status_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#,
        );
        assert_eq!(err, ReasoningError::Provider("HTTP 400: max_tokens too large".into()));
        assert!(matches!(
            status_error(StatusCode::from_u16(529).unwrap(), None, ""),
            ReasoningError::RateLimited { retry_after: None }
        ));
    }

    #[test]
    fn retry_after_must_be_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn debug_output_hides_the_key() {
        let rendered = format!("{:?}", provider("http://127.0.0.1:1/"));
        assert!(!rendered.contains("sk-test-secret"));
    }
}

//! Thin REST client: authentication, error mapping, pagination.

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use pipeline::StoreError;

use crate::token::GithubToken;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;

/// Authenticated access to one GitHub API host.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base: reqwest::Url,
    token: GithubToken,
}

impl GithubClient {
    /// A client for `api_url` (`https://api.github.com` or a GHES `/api/v3` root).
    pub fn new(api_url: &str, token: GithubToken) -> Result<Self, StoreError> {
        let mut base = reqwest::Url::parse(api_url)
            .map_err(|e| StoreError::Transport(format!("invalid API url '{api_url}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    /// Builds `base/segments...`, escaping each segment.
    pub fn url(&self, segments: &[&str]) -> Result<reqwest::Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Transport("API url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: reqwest::Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response, StoreError> {
        debug!(method = %method, path = url.path(), "GitHub request");
        let mut request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.token.bearer())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(USER_AGENT, "cogworks");
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        Err(status_error(status, &headers, &text))
    }

    pub async fn get<T: DeserializeOwned>(&self, url: reqwest::Url) -> Result<T, StoreError> {
        let response = self.send::<()>(Method::GET, url, None).await?;
        decode(response).await
    }

    /// GETs every page of a list endpoint.
    pub async fn get_all<T: DeserializeOwned>(&self, url: reqwest::Url) -> Result<Vec<T>, StoreError> {
        let mut items = Vec::new();
        for page in 1.. {
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let batch: Vec<T> = self.get(page_url).await?;
            let done = batch.len() < PAGE_SIZE;
            items.extend(batch);
            if done {
                break;
            }
        }
        Ok(items)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: reqwest::Url,
        body: &B,
    ) -> Result<T, StoreError> {
        let response = self.send(Method::POST, url, Some(body)).await?;
        decode(response).await
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: reqwest::Url,
        body: &B,
    ) -> Result<T, StoreError> {
        let response = self.send(Method::PATCH, url, Some(body)).await?;
        decode(response).await
    }

    /// DELETE; a missing resource counts as deleted.
    pub async fn delete(&self, url: reqwest::Url) -> Result<(), StoreError> {
        match self.send::<()>(Method::DELETE, url, None).await {
            Ok(_) | Err(StoreError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| StoreError::Transport(e.without_url().to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Maps a non-success reply, recognising both primary and secondary rate limits.
fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> StoreError {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let retry_after = header(RETRY_AFTER.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let exhausted = header("x-ratelimit-remaining") == Some("0");

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (exhausted || retry_after.is_some()))
    {
        let retry_after = retry_after.or_else(|| {
            let reset = header("x-ratelimit-reset")?.parse::<i64>().ok()?;
            let wait = reset - chrono::Utc::now().timestamp();
            u64::try_from(wait).ok().map(Duration::from_secs)
        });
        return StoreError::RateLimited { retry_after };
    }
    if status == StatusCode::NOT_FOUND {
        return StoreError::Api {
            status: 404,
            message: "not found".to_string(),
        };
    }
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    StoreError::Api {
        status: status.as_u16(),
        message,
    }
}

//! The reasoning-model port.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RetryPolicy, TokenCost, TokenCount};

/// Default output token limit for a reasoning call.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    /// Correlates provider calls with the invocation's trace.
    pub trace_id: String,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningUsage {
    pub input_tokens: TokenCount,
    pub output_tokens: TokenCount,
}

/// One completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningResponse {
    pub text: String,
    pub usage: ReasoningUsage,
    pub cost: TokenCost,
}

/// Failures of a reasoning call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReasoningError {
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider asked us to back off. Defers the wave; not a node failure.
    #[error("reasoning provider rate limit; retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("reasoning provider error: {0}")]
    Provider(String),

    #[error("reasoning provider returned unusable output: {0}")]
    InvalidOutput(String),
}

impl ReasoningError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Timeout(_) | Self::Provider(_) => RetryPolicy::Retryable { after: None },
            Self::InvalidOutput(_) => RetryPolicy::NonRetryable,
        }
    }
}

/// A reasoning model.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError>;
}

/// Reads a yes/no answer from the first word of `text`.
pub fn parse_yes_no(text: &str) -> Option<bool> {
    let word: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

//! The Extension API: the protocol between the engine and domain services.
//!
//! A domain service is an external process offering toolchain-specific
//! operations (validate, build, test ...). Every exchange is one request
//! envelope and one response envelope. Responses are untrusted input: they
//! are parsed against a fixed schema before anything reads them, and their
//! diagnostics are treated as opaque data from then on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::FailureKind;
use crate::{
    ApiVersion, Diagnostic, DomainServiceName, OperationName, RetryPolicy, SchemaValidationError,
};

/// Name of the health-check operation every service must implement.
pub const HEALTH_CHECK_OPERATION: &str = "health_check";

/// Fixed timeout for health checks.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// The repository a request operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryContext {
    /// Working-directory path of the checkout.
    pub path: String,
    /// Git ref being worked on.
    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// One operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRequest {
    pub repository: RepositoryContext,
    pub domain: DomainServiceName,
    pub operation: OperationName,
    #[serde(default)]
    pub payload: Value,
    pub trace_id: String,
}

impl ExtensionRequest {
    /// A health-check request for `domain`.
    pub fn health_check(repository: RepositoryContext, domain: DomainServiceName, trace_id: String) -> Self {
        Self {
            repository,
            domain,
            operation: OperationName::health_check(),
            payload: Value::Null,
            trace_id,
        }
    }
}

/// Outcome reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// One operation response, after schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Opaque structured artefacts produced by the operation.
    #[serde(default)]
    pub artifacts: Vec<Value>,
    /// Protocol version, reported by health checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<ApiVersion>,
}

impl ExtensionResponse {
    /// Validates a raw response document.
    ///
    /// Unknown top-level fields are tolerated so that additive protocol
    /// changes stay compatible; everything the engine reads is checked.
    pub fn from_value(value: Value) -> Result<Self, SchemaValidationError> {
        let object = value
            .as_object()
            .ok_or_else(|| SchemaValidationError::new("$", "response must be a JSON object"))?;
        if !object.contains_key("status") {
            return Err(SchemaValidationError::new("$.status", "required field is missing"));
        }
        for field in ["diagnostics", "artifacts"] {
            if let Some(v) = object.get(field) {
                if !v.is_array() {
                    return Err(SchemaValidationError::new(format!("$.{field}"), "expected an array"));
                }
            }
        }
        if let Some(Value::Array(diagnostics)) = object.get("diagnostics") {
            for (i, d) in diagnostics.iter().enumerate() {
                if !d.get("message").is_some_and(Value::is_string) {
                    return Err(SchemaValidationError::new(
                        format!("$.diagnostics[{i}].message"),
                        "expected a string",
                    ));
                }
            }
        }
        serde_json::from_value(value).map_err(|e| SchemaValidationError::new("$", e.to_string()))
    }

    /// Parses and validates a raw response body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaValidationError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| SchemaValidationError::new("$", format!("not valid JSON: {e}")))?;
        Self::from_value(value)
    }
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy { api_version: ApiVersion },
    Unhealthy { reason: String },
}

impl HealthStatus {
    /// Interprets a health-check response.
    pub fn from_response(response: &ExtensionResponse) -> Self {
        match (response.status, response.api_version) {
            (ResponseStatus::Error, _) => Self::Unhealthy {
                reason: response
                    .diagnostics
                    .first()
                    .map_or_else(|| "service reported an error".to_string(), |d| d.message.clone()),
            },
            (ResponseStatus::Ok, None) => Self::Unhealthy {
                reason: "health check did not report an api_version".to_string(),
            },
            (ResponseStatus::Ok, Some(version)) if !ApiVersion::CURRENT.is_compatible_with(version) => {
                Self::Unhealthy {
                    reason: format!(
                        "incompatible api_version {version} (engine speaks {})",
                        ApiVersion::CURRENT
                    ),
                }
            }
            (ResponseStatus::Ok, Some(api_version)) => Self::Healthy { api_version },
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Failures of a domain-service call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainServiceError {
    #[error("domain service '{0}' is not configured")]
    UnknownDomain(DomainServiceName),

    #[error("domain service '{domain}' is unavailable: {reason}")]
    Unavailable {
        domain: DomainServiceName,
        reason: String,
    },

    #[error("domain service '{domain}' did not respond within {after:?}")]
    Timeout {
        domain: DomainServiceName,
        after: Duration,
    },

    #[error("transport to domain service '{domain}' failed: {message}")]
    Transport {
        domain: DomainServiceName,
        message: String,
    },

    #[error("domain service '{domain}' sent a non-conforming response: {source}")]
    Fault {
        domain: DomainServiceName,
        #[source]
        source: SchemaValidationError,
    },
}

impl DomainServiceError {
    /// How the failure is recorded on the node.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnknownDomain(_) | Self::Unavailable { .. } | Self::Transport { .. } => {
                FailureKind::DomainServiceUnavailable
            }
            Self::Timeout { .. } => FailureKind::DomainServiceTimeout,
            Self::Fault { .. } => FailureKind::DomainServiceFault,
        }
    }

    /// Domain failures end the node; a later trigger reruns it only through
    /// an edge.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NonRetryable
    }
}

/// Client for the configured domain services.
#[async_trait]
pub trait DomainServiceClient: Send + Sync {
    /// Runs the `health_check` operation with [`HEALTH_CHECK_TIMEOUT`].
    async fn health_check(
        &self,
        domain: &DomainServiceName,
        repository: &RepositoryContext,
    ) -> HealthStatus;

    /// Invokes one operation. The response is schema-validated.
    async fn invoke(
        &self,
        request: &ExtensionRequest,
        timeout: Duration,
    ) -> Result<ExtensionResponse, DomainServiceError>;
}

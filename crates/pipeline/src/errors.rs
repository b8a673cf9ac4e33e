//! Top-level error and retry-policy types for the CogWorks pipeline domain.
//!
//! [`CogWorksError`] covers conditions that abort an invocation of the step
//! function or halt the run itself. Component-level errors (store failures,
//! domain service failures, reasoning failures) are defined next to the port
//! traits that produce them and convert into [`CogWorksError`] where they cross
//! the engine boundary.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`]. "Retry" always
//! means the next external trigger; nothing loops inside an invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtifactType, CostBudget, EdgeId, NodeId, PipelineName, StoreError, TokenCost};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: API timeouts, transient rate-limit responses, a busy lock.
/// - `NonRetryable` errors: budget exceeded, invalid configuration, schema
///   violations by a domain service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried by a later invocation.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from `Retry-After` or `x-ratelimit-reset` response headers).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry
        /// immediately or apply the caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried; escalation or pipeline halt is required.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// A single structural defect found while loading a pipeline configuration.
///
/// Validation collects every defect it can find before failing, so one
/// configuration edit can fix all of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("configuration could not be parsed: {0}")]
    Parse(String),

    #[error("unsupported configuration version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("pipeline '{0}' is declared more than once")]
    DuplicatePipeline(PipelineName),

    #[error("pipeline '{0}' is not declared")]
    UnknownPipeline(PipelineName),

    #[error("pipeline '{0}' declares no nodes")]
    EmptyPipeline(PipelineName),

    #[error("node '{0}' is declared more than once")]
    DuplicateNode(NodeId),

    #[error("edge '{0}' is declared more than once")]
    DuplicateEdge(EdgeId),

    #[error("edge '{edge}' references undeclared node '{node}'")]
    DanglingEdge { edge: EdgeId, node: NodeId },

    #[error("cycle without a rework bound through nodes [{}]", join(.nodes))]
    UnboundedCycle { nodes: Vec<NodeId> },

    #[error("rework edge '{0}' must allow at least one traversal")]
    InvalidReworkBound(EdgeId),

    #[error("rework edge '{0}' does not lead back to an upstream node")]
    ReworkNotALoop(EdgeId),

    #[error("artifact type '{artifact_type}' has several producers [{}] and no selection rule", join(.producers))]
    AmbiguousProducer {
        artifact_type: ArtifactType,
        producers: Vec<NodeId>,
    },

    #[error("node '{node}' requires artifact type '{artifact_type}' which no node produces")]
    MissingProducer {
        node: NodeId,
        artifact_type: ArtifactType,
    },

    #[error("pipeline has no entry node (every node has an incoming edge)")]
    NoEntryNode,

    #[error("node '{node}' is misconfigured: {reason}")]
    InvalidNode { node: NodeId, reason: String },

    #[error("edge '{edge}' has an invalid condition: {reason}")]
    InvalidCondition { edge: EdgeId, reason: String },
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

/// Output from a reasoning call or a domain service that does not match the
/// schema it is required to follow. The producing node fails; run state is
/// unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation at '{path}': {reason}")]
pub struct SchemaValidationError {
    /// JSON path of the offending value (`$` for the document root).
    pub path: String,
    pub reason: String,
}

impl SchemaValidationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Checks that `value` is a JSON object containing every field in `required`.
pub fn require_fields(
    value: &serde_json::Value,
    required: &[String],
) -> Result<(), SchemaValidationError> {
    let object = value
        .as_object()
        .ok_or_else(|| SchemaValidationError::new("$", "expected a JSON object"))?;
    match required.iter().find(|f| !object.contains_key(f.as_str())) {
        Some(missing) => Err(SchemaValidationError::new(
            format!("$.{missing}"),
            "required field is missing",
        )),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Pipeline-level errors
// ---------------------------------------------------------------------------

/// Errors that abort the current invocation or halt the pipeline run.
///
/// These are distinct from node-local failures (a domain service reporting
/// an error, a reasoning output that fails its schema) which are recorded as
/// artefacts and drive edge evaluation instead of aborting the invocation.
#[derive(Debug, Error)]
pub enum CogWorksError {
    /// The pipeline configuration is malformed. Fatal; no run starts.
    #[error("Structural configuration error: {}", join(.errors))]
    StructuralConfig {
        /// Every defect found during validation.
        errors: Vec<StructuralError>,
    },

    /// The pipeline has been halted by an explicit decision (not a transient failure).
    #[error("Pipeline halted: {reason}")]
    PipelineHalt {
        /// Human-readable description of why the pipeline was halted.
        reason: String,
    },

    /// Accumulated cost would exceed the configured budget.
    #[error("Cost budget exceeded: accumulated {accumulated}, limit {limit}")]
    BudgetExceeded {
        /// Total cost accumulated (including in-flight reservations).
        accumulated: TokenCost,
        /// Configured budget that was exceeded.
        limit: CostBudget,
    },

    /// The run's rework retries exceeded the configured limit.
    #[error("Retry limit exceeded: {retries} retries, limit {limit}")]
    RetryLimitExceeded {
        /// Rework retries consumed so far.
        retries: u32,
        /// Configured retry limit.
        limit: u32,
    },

    /// The reasoning provider asked us to back off. Transient.
    #[error("Rate limited; retry after {retry_after:?}")]
    RateLimitBackoff {
        /// Provider-supplied back-off hint.
        retry_after: Option<Duration>,
    },

    /// The work item reference could not be resolved.
    #[error("Invalid work item reference: {0}")]
    InvalidReference(String),

    /// The external artefact store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A run record could not be serialised.
    #[error("Run record encoding failed: {0}")]
    RecordEncoding(#[from] serde_json::Error),
}

impl CogWorksError {
    /// Builds a structural error from a single defect.
    pub fn structural(error: StructuralError) -> Self {
        Self::StructuralConfig {
            errors: vec![error],
        }
    }

    /// Whether a later invocation could succeed without human intervention.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimitBackoff { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Store(e) => e.retry_policy(),
            Self::StructuralConfig { .. }
            | Self::PipelineHalt { .. }
            | Self::BudgetExceeded { .. }
            | Self::RetryLimitExceeded { .. }
            | Self::InvalidReference(_)
            | Self::RecordEncoding(_) => RetryPolicy::NonRetryable,
        }
    }
}

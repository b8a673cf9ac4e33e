//! Core orchestration domain for CogWorks.
//!
//! This crate contains every domain concept, newtype identifier, shared primitive
//! type, and cross-cutting error type used throughout the pipeline, together
//! with the pure rules of the engine: graph validation, run-state
//! reconstruction, readiness, budgets and locking. Infrastructure crates
//! implement the port traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no I/O of its own.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`WorkItemId`, `NodeId`, etc.) |
//! | [`types`] | Shared value types (`TokenCost`, `CostBudget`, `Diagnostic`, etc.) |
//! | [`errors`] | Top-level error and retry-policy types |
//! | [`work_item`] | Work items, references and signal labels |
//! | [`artifact`] | Artefacts and the per-run artefact set |
//! | [`graph`] | Pipeline definitions, validation, conditions, readiness |
//! | [`config`] | `.cogworks/pipeline.toml` schema and pipeline selection |
//! | [`record`] | Run records and human commands |
//! | [`state`] | Run-state reconstruction |
//! | [`budget`] | Cost and retry budgets |
//! | [`lock`] | The processing lock |
//! | [`store`] | Artefact store port |
//! | [`extension`] | Extension API envelopes and the domain-service port |
//! | [`reasoning`] | Reasoning-model port |
//! | [`step`] | Step-function results |
//! | [`testing`] | In-memory port implementations for tests |

pub mod artifact;
pub mod budget;
pub mod config;
pub mod errors;
pub mod extension;
pub mod graph;
pub mod identifiers;
pub mod lock;
pub mod reasoning;
pub mod record;
pub mod state;
pub mod step;
pub mod store;
pub mod testing;
pub mod types;
pub mod work_item;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use artifact::{Artifact, ArtifactLocation, ArtifactSet};
pub use budget::{BudgetTracker, Reservation};
pub use config::{PipelineConfig, Settings};
pub use errors::{require_fields, CogWorksError, RetryPolicy, SchemaValidationError, StructuralError};
pub use extension::{
    DomainServiceClient, DomainServiceError, ExtensionRequest, ExtensionResponse, HealthStatus,
    RepositoryContext, ResponseStatus,
};
pub use graph::{
    Edge, EdgeCondition, GateMode, Node, NodeAction, NodeKind, PipelineDefinition, PipelineGraph,
    SafetyOverride,
};
pub use identifiers::{
    ArtifactPath, ArtifactType, CommentId, DomainServiceName, EdgeId, InvocationId,
    NodeId, OperationName, PipelineName, PipelineRunId, PullRequestId, RepositoryId,
    SubWorkItemId, WorkItemId,
};
pub use lock::{Clock, LockManager, LockMarker, LockOutcome, SystemClock};
pub use reasoning::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse};
pub use record::{
    EscalationReason, FailureKind, GateStatus, NodeCompletion, NodeFailure, NodeOutcome, RunRecord,
};
pub use state::{NodeStatus, RunState, RunStatus};
pub use step::StepResult;
pub use store::{ArtifactStore, NewSubWorkItem, StoreError, StoredComment};
pub use types::{
    ApiVersion, CostBudget, Diagnostic, DiagnosticSeverity, Timestamp, TokenCost, TokenCount,
};
pub use work_item::{SubWorkItem, SubWorkItemLink, SubWorkItemSpec, WorkItem, WorkItemRef};

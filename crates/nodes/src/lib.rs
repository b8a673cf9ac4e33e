//! CogWorks orchestration: the step function and node execution.
//!
//! This crate provides [`PipelineExecutor`], whose `advance` call is one
//! invocation of the engine for one work item, together with the per-kind
//! node implementations (tool execution, reasoning call, gate, spawn), the
//! prompt assembly used for reasoning calls and edge predicates, and the
//! health-checking domain-service gateway.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Nodes sequence calls between business logic in the
//! [`pipeline`] crate and infrastructure traits (artefact store, reasoning
//! provider, domain services). They contain no domain rules of their own:
//! readiness, reconstruction, budgets and locking all live in [`pipeline`].

pub mod context;
pub mod executor;
pub mod gateway;
pub mod kinds;
pub mod prompt;

pub use context::NodeContext;
pub use executor::PipelineExecutor;
pub use gateway::DomainGateway;
pub use kinds::{NodeResult, NodeRun, NodeServices};

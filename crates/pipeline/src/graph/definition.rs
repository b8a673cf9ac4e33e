//! Pipeline definitions as declared in configuration.
//!
//! These types are the serialised form of a pipeline graph. They are loaded
//! from `.cogworks/pipeline.toml`, validated into a
//! [`PipelineGraph`](super::PipelineGraph), and embedded verbatim in the
//! `RunStarted` record so that a run keeps the graph it started with.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    ArtifactType, DomainServiceName, EdgeId, NodeId, OperationName, PipelineName, TokenCost,
};

/// Maximum traversals of a rework edge when the configuration does not say.
pub const DEFAULT_MAX_TRAVERSALS: u32 = 5;

/// A named directed graph of nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: PipelineName,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// How consumers pick among several artefacts of a type with more than
    /// one producer. Types with several producers must appear here.
    #[serde(default)]
    pub artifact_selection: BTreeMap<ArtifactType, SelectionRule>,
    /// Overrides the global parallelism limit for this pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
}

/// Selection rule for multi-producer artefact types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    /// Consumers see the most recently recorded artefact.
    Latest,
    /// Consumers see every artefact of the type.
    All,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// What the node does. Tagged by `kind` in configuration.
    #[serde(flatten)]
    pub action: NodeAction,

    /// Artefact types that must exist before the node may run.
    #[serde(default)]
    pub inputs: Vec<ArtifactType>,

    /// Artefact types the node produces on success.
    #[serde(default)]
    pub outputs: Vec<ArtifactType>,

    #[serde(default)]
    pub gate: GateMode,

    #[serde(default)]
    pub safety_override: SafetyOverride,

    /// Per-node execution timeout; falls back to the global setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Cost reserved against the run budget before the node starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<TokenCost>,
}

impl Node {
    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        match self.action {
            NodeAction::ToolExecution { .. } => NodeKind::ToolExecution,
            NodeAction::ReasoningCall { .. } => NodeKind::ReasoningCall,
            NodeAction::Gate => NodeKind::Gate,
            NodeAction::Spawn { .. } => NodeKind::Spawn,
        }
    }

    /// The gate mode that applies for a work item with the given safety flag.
    ///
    /// Every node, gate kind included, defaults to `auto`. A `require_human`
    /// safety override turns that into `human` on safety-critical items.
    pub fn effective_gate(&self, safety_critical: bool) -> GateMode {
        match (self.safety_override, safety_critical) {
            (SafetyOverride::RequireHuman, true) => GateMode::Human,
            _ => self.gate,
        }
    }

    /// The execution timeout, given the global default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// The kind of a node, without its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    ToolExecution,
    ReasoningCall,
    Gate,
    Spawn,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToolExecution => "tool_execution",
            Self::ReasoningCall => "reasoning_call",
            Self::Gate => "gate",
            Self::Spawn => "spawn",
        };
        f.write_str(s)
    }
}

/// Kind-specific node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAction {
    /// Invoke an operation on a domain service.
    ToolExecution {
        domain: DomainServiceName,
        operation: OperationName,
        /// Static payload merged with the node's input artefacts.
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Call the reasoning model.
    ReasoningCall {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        /// Top-level fields the JSON output must contain. When empty the
        /// output is free text.
        #[serde(default)]
        required_fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
    /// A checkpoint with no work of its own.
    Gate,
    /// Create sub-work-items from a plan artefact.
    Spawn {
        /// Pipeline assigned to the spawned items; defaults to the parent's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline: Option<PipelineName>,
    },
}

/// Whether a node's success needs human approval before its edges fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    #[default]
    Auto,
    Human,
}

/// How safety-critical work items change a node's gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyOverride {
    #[default]
    None,
    /// Force a human gate when the work item is safety-critical.
    RequireHuman,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,

    /// `None` fires when the source node succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,

    /// Rework edges route back to an earlier node and are bounded.
    #[serde(default)]
    pub rework: bool,

    /// Traversal bound for rework edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_traversals: Option<u32>,
}

impl Edge {
    /// Whether the edge only fires under a condition.
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// The effective traversal bound (rework edges only).
    pub fn traversal_limit(&self) -> u32 {
        self.max_traversals.unwrap_or(DEFAULT_MAX_TRAVERSALS)
    }
}

/// An edge condition.
///
/// In configuration:
///
/// ```toml
/// condition = { expression = 'outcome == "failure"' }
/// condition = { predicate = "Does the design cover every requirement?" }
/// condition = { all = [{ expression = 'output.verdict == "pass"' }, { predicate = "..." }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// A deterministic expression over the source node's result.
    Expression(String),
    /// A yes/no question answered by the reasoning model.
    Predicate(String),
    /// True when every operand is true. Evaluated left to right.
    All(Vec<EdgeCondition>),
    /// True when any operand is true. Evaluated left to right.
    Any(Vec<EdgeCondition>),
    Not(Box<EdgeCondition>),
}

//! Run records: the durable, append-only history of a pipeline run.
//!
//! Each record is written as one engine-authored comment. The comment starts
//! with a one-line human summary and ends with a machine-readable block:
//!
//! ```text
//! **CogWorks** · node `design` succeeded (attempt 1, $0.120000)
//!
//! <!-- cogworks:record v1
//! {"type":"node_completed", ...}
//! -->
//! ```
//!
//! Humans interact through commands in their own comments:
//! `/cogworks approve <node>` and `/cogworks reject <node> [reason]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    Artifact, CostBudget, Diagnostic, EdgeId, NodeId, PipelineDefinition, PipelineRunId,
    StoredComment, Timestamp, TokenCost,
};

const RECORD_OPEN: &str = "<!-- cogworks:record v1";
const RECORD_CLOSE: &str = "-->";
const COMMAND_PREFIX: &str = "/cogworks";

// ---------------------------------------------------------------------------
// Node results
// ---------------------------------------------------------------------------

/// Whether a node execution succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded,
    Failed,
}

impl NodeOutcome {
    /// The value seen by `outcome` in edge expressions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "success",
            Self::Failed => "failure",
        }
    }
}

/// Why a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The node's output did not match its declared schema.
    SchemaValidation,
    /// The domain service failed its health check or could not be reached.
    DomainServiceUnavailable,
    /// The domain service did not answer within the timeout.
    DomainServiceTimeout,
    /// The domain service answered with a response that broke the protocol.
    DomainServiceFault,
    /// The domain service answered `status: error` (e.g. validation failed).
    DomainServiceError,
    /// The reasoning provider failed.
    ReasoningFailure,
    /// The node exceeded its execution timeout.
    Timeout,
    /// A declared input artefact disappeared between readiness and execution.
    MissingInput,
    /// A human rejected the node at its gate.
    Rejected,
    /// Sub-work-item creation failed.
    SpawnFailure,
}

impl FailureKind {
    /// The value seen by `failure` in edge expressions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaValidation => "schema_validation",
            Self::DomainServiceUnavailable => "domain_service_unavailable",
            Self::DomainServiceTimeout => "domain_service_timeout",
            Self::DomainServiceFault => "domain_service_fault",
            Self::DomainServiceError => "domain_service_error",
            Self::ReasoningFailure => "reasoning_failure",
            Self::Timeout => "timeout",
            Self::MissingInput => "missing_input",
            Self::Rejected => "rejected",
            Self::SpawnFailure => "spawn_failure",
        }
    }
}

/// A recorded node failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Gate state of a successful node at the time it was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    #[default]
    Passed,
    AwaitingApproval,
}

/// The result of one node execution.
///
/// The gate decision is part of the same record so that a crash can never
/// leave a human-gated success without its pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCompletion {
    pub node: NodeId,
    /// 1 for the first execution, incremented on every re-execution.
    pub attempt: u32,
    pub outcome: NodeOutcome,
    /// Structured output, visible to edge expressions as `output.*`.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub cost: TokenCost,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    #[serde(default)]
    pub gate: GateStatus,
    pub completed_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Run-level records
// ---------------------------------------------------------------------------

/// Why automated progress stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    BudgetExceeded {
        accumulated: TokenCost,
        limit: CostBudget,
    },
    RetryLimitExceeded {
        retries: u32,
        limit: u32,
    },
    ReworkExhausted {
        edge: EdgeId,
        traversals: u32,
    },
    ExecutionCapReached {
        executions: usize,
    },
    InvalidDefinition {
        message: String,
    },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded { accumulated, limit } => {
                write!(f, "cost budget exceeded ({accumulated} of {limit})")
            }
            Self::RetryLimitExceeded { retries, limit } => {
                write!(f, "retry limit exceeded ({retries} of {limit})")
            }
            Self::ReworkExhausted { edge, traversals } => {
                write!(f, "rework edge `{edge}` exhausted after {traversals} traversals")
            }
            Self::ExecutionCapReached { executions } => {
                write!(f, "invocation stopped after {executions} node executions")
            }
            Self::InvalidDefinition { message } => {
                write!(f, "recorded pipeline definition is invalid: {message}")
            }
        }
    }
}

/// How a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedStatus {
    Completed,
    Failed,
}

/// One durable record of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunRecord {
    /// The run began. The full definition is embedded so later
    /// configuration edits never change a run in progress.
    RunStarted {
        run_id: PipelineRunId,
        definition: PipelineDefinition,
        started_at: Timestamp,
    },
    NodeCompleted(NodeCompletion),
    /// An outgoing edge of a settled node was evaluated. A fired rework
    /// edge is a traversal.
    EdgeResolved { edge: EdgeId, fired: bool },
    /// Answer to a reasoning predicate inside an edge condition.
    PredicateAnswered {
        edge: EdgeId,
        index: u32,
        value: bool,
        #[serde(default)]
        cost: TokenCost,
    },
    /// A reasoning predicate could not be asked. Counts as one retry.
    PredicateFailed {
        edge: EdgeId,
        index: u32,
        message: String,
    },
    Escalated {
        reason: EscalationReason,
        at: Timestamp,
    },
    /// Terminal status announcement. Informational: the status is derivable.
    RunFinished { status: FinishedStatus },
}

impl RunRecord {
    /// One-line human summary shown above the machine-readable block.
    pub fn summary(&self) -> String {
        match self {
            Self::RunStarted { definition, .. } => {
                format!("started pipeline `{}`", definition.name)
            }
            Self::NodeCompleted(c) => {
                let mut line = format!(
                    "node `{}` {} (attempt {}, {})",
                    c.node,
                    match c.outcome {
                        NodeOutcome::Succeeded => "succeeded",
                        NodeOutcome::Failed => "failed",
                    },
                    c.attempt,
                    c.cost
                );
                if c.gate == GateStatus::AwaitingApproval {
                    line.push_str(&format!(
                        ". Awaiting approval: comment `/cogworks approve {}` or `/cogworks reject {}`",
                        c.node, c.node
                    ));
                }
                line
            }
            Self::EdgeResolved { edge, fired } => {
                format!("edge `{edge}` {}", if *fired { "fired" } else { "not taken" })
            }
            Self::PredicateAnswered {
                edge, index, value, ..
            } => {
                format!("condition {index} of edge `{edge}` evaluated to {value}")
            }
            Self::PredicateFailed {
                edge,
                index,
                message,
            } => {
                format!("condition {index} of edge `{edge}` could not be evaluated: {message}")
            }
            Self::Escalated { reason, .. } => format!("escalated: {reason}"),
            Self::RunFinished { status } => match status {
                FinishedStatus::Completed => "run completed".to_string(),
                FinishedStatus::Failed => "run failed".to_string(),
            },
        }
    }

    /// Renders the record as a comment body.
    pub fn to_comment(&self) -> Result<String, serde_json::Error> {
        // `>` only occurs inside JSON strings, so escaping it keeps the block
        // from terminating early without changing the decoded value.
        let json = serde_json::to_string(self)?.replace('>', "\\u003e");
        Ok(format!(
            "**CogWorks** · {}\n\n{RECORD_OPEN}\n{json}\n{RECORD_CLOSE}",
            self.summary()
        ))
    }

    /// Extracts a record from a comment body, if it contains one.
    pub fn from_comment(body: &str) -> Option<Result<Self, serde_json::Error>> {
        let start = body.find(RECORD_OPEN)? + RECORD_OPEN.len();
        let rest = &body[start..];
        let end = rest.rfind(RECORD_CLOSE)?;
        Some(serde_json::from_str(rest[..end].trim()))
    }
}

// ---------------------------------------------------------------------------
// Human commands
// ---------------------------------------------------------------------------

/// An approval signal given by a human in a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanCommand {
    Approve(NodeId),
    Reject { node: NodeId, reason: Option<String> },
}

impl HumanCommand {
    /// Parses the first command line in a comment body.
    pub fn parse(body: &str) -> Option<Self> {
        body.lines().find_map(|line| {
            let rest = line.trim().strip_prefix(COMMAND_PREFIX)?;
            let mut words = rest.split_whitespace();
            let verb = words.next()?;
            let node = NodeId::new(words.next()?)?;
            let remainder = words.collect::<Vec<_>>().join(" ");
            match verb {
                "approve" => Some(Self::Approve(node)),
                "reject" => Some(Self::Reject {
                    node,
                    reason: (!remainder.is_empty()).then_some(remainder),
                }),
                _ => None,
            }
        })
    }
}

/// What a stored comment means to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentEntry {
    Record(Box<RunRecord>),
    Command(HumanCommand),
    Ignored,
}

impl CommentEntry {
    /// Classifies a comment. Records are only trusted from the engine's own
    /// identity and commands only from humans.
    pub fn classify(comment: &StoredComment) -> Self {
        if comment.authored_by_engine {
            match RunRecord::from_comment(&comment.body) {
                Some(Ok(record)) => Self::Record(Box::new(record)),
                Some(Err(e)) => {
                    warn!(comment = %comment.id, error = %e, "Ignoring undecodable run record");
                    Self::Ignored
                }
                None => Self::Ignored,
            }
        } else {
            HumanCommand::parse(&comment.body).map_or(Self::Ignored, Self::Command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommentId, Diagnostic};
    use serde_json::json;

    fn completion(message: &str) -> NodeCompletion {
        NodeCompletion {
            node: NodeId::new("validate").unwrap(),
            attempt: 2,
            outcome: NodeOutcome::Failed,
            output: json!({"status": "error"}),
            artifacts: vec![],
            cost: TokenCost::new(0.5).unwrap(),
            diagnostics: vec![Diagnostic {
                message: message.to_string(),
                artifact: None,
                location: Some("line 3".into()),
                severity: Default::default(),
            }],
            failure: Some(NodeFailure {
                kind: FailureKind::DomainServiceError,
                message: "validation failed".into(),
            }),
            gate: GateStatus::Passed,
            completed_at: Timestamp::parse_rfc3339("2026-03-01T10:00:00Z").unwrap(),
        }
    }

    fn engine_comment(body: String) -> StoredComment {
        StoredComment {
            id: CommentId::new(1),
            body,
            created_at: Timestamp::now(),
            authored_by_engine: true,
        }
    }

    #[test]
    fn record_survives_comment_encoding_even_with_closing_markers_in_text() {
        let record = RunRecord::NodeCompleted(completion("expected `-->` but found `>>`"));
        let body = record.to_comment().unwrap();

        assert!(body.starts_with("**CogWorks** · node `validate` failed (attempt 2"));
        assert_eq!(body.matches(RECORD_CLOSE).count(), 1);
        assert_eq!(RunRecord::from_comment(&body).unwrap().unwrap(), record);
    }

    #[test]
    fn plain_comments_carry_no_record() {
        assert!(RunRecord::from_comment("looks good to me").is_none());
    }

    #[test]
    fn records_from_humans_are_not_trusted() {
        let record = RunRecord::EdgeResolved {
            edge: EdgeId::new("a-b").unwrap(),
            fired: true,
        };
        let mut comment = engine_comment(record.to_comment().unwrap());
        assert!(matches!(CommentEntry::classify(&comment), CommentEntry::Record(_)));

        comment.authored_by_engine = false;
        assert_eq!(CommentEntry::classify(&comment), CommentEntry::Ignored);
    }

    #[test]
    fn commands_from_the_engine_are_ignored() {
        let mut comment = engine_comment("/cogworks approve design".into());
        assert_eq!(CommentEntry::classify(&comment), CommentEntry::Ignored);

        comment.authored_by_engine = false;
        assert_eq!(
            CommentEntry::classify(&comment),
            CommentEntry::Command(HumanCommand::Approve(NodeId::new("design").unwrap()))
        );
    }

    #[test]
    fn reject_command_keeps_reason() {
        let cmd = HumanCommand::parse("Thanks!\n/cogworks reject design  needs more detail\n");
        assert_eq!(
            cmd,
            Some(HumanCommand::Reject {
                node: NodeId::new("design").unwrap(),
                reason: Some("needs more detail".into()),
            })
        );
        assert_eq!(HumanCommand::parse("/cogworks approve"), None);
        assert_eq!(HumanCommand::parse("/cogworks merge design"), None);
    }

    #[test]
    fn awaiting_approval_summary_tells_humans_what_to_do() {
        let mut c = completion("x");
        c.outcome = NodeOutcome::Succeeded;
        c.failure = None;
        c.gate = GateStatus::AwaitingApproval;
        let summary = RunRecord::NodeCompleted(c).summary();
        assert!(summary.contains("/cogworks approve validate"));
    }
}

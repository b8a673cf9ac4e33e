//! The outcome of one invocation of the step function.

use std::time::Duration;

use crate::record::EscalationReason;
use crate::{NodeId, SubWorkItemId, Timestamp};

/// What one `advance` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Nodes were executed (possibly none when only edges were resolved).
    /// `complete` is set when the run finished.
    Advanced { executed: Vec<NodeId>, complete: bool },
    /// Waiting for a human decision on these nodes.
    Gated { awaiting: Vec<NodeId> },
    /// Another invocation holds the lock.
    Busy { held_since: Timestamp },
    /// The run failed: these nodes failed with no outgoing edge taken.
    Failed { nodes: Vec<NodeId> },
    /// Automated progress stopped; a human must act.
    Escalated { reason: EscalationReason },
    /// The cost ceiling was reached.
    BudgetExhausted { reason: EscalationReason },
    /// A transient condition (rate limit) deferred the wave.
    Deferred { retry_after: Option<Duration> },
    /// The item is a sub-work-item whose dependencies are still open.
    Blocked { waiting_on: Vec<SubWorkItemId> },
    /// The item does not carry the trigger label.
    NotTriggered,
}

/// Exit code for errors that prevented any result.
pub const EXIT_FATAL: i32 = 70;

impl StepResult {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Advanced { .. } => 0,
            Self::Failed { .. } => 1,
            Self::Escalated { .. } => 2,
            Self::BudgetExhausted { .. } => 3,
            Self::Gated { .. } => 10,
            Self::Busy { .. } => 11,
            Self::Deferred { .. } => 12,
            Self::Blocked { .. } => 13,
            Self::NotTriggered => 14,
        }
    }

    /// Short name used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced { complete: true, .. } => "complete",
            Self::Advanced { .. } => "advanced",
            Self::Gated { .. } => "gated",
            Self::Busy { .. } => "busy",
            Self::Failed { .. } => "failed",
            Self::Escalated { .. } => "escalated",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Deferred { .. } => "deferred",
            Self::Blocked { .. } => "blocked",
            Self::NotTriggered => "not_triggered",
        }
    }
}

impl std::fmt::Display for StepResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = |ids: &[NodeId]| {
            ids.iter()
                .map(NodeId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::Advanced { executed, complete } => {
                write!(f, "advanced: executed [{}]", list(executed))?;
                if *complete {
                    write!(f, "; run complete")?;
                }
                Ok(())
            }
            Self::Gated { awaiting } => write!(f, "gated: awaiting approval of [{}]", list(awaiting)),
            Self::Busy { held_since } => write!(f, "busy: lock held since {held_since}"),
            Self::Failed { nodes } => write!(f, "failed: [{}]", list(nodes)),
            Self::Escalated { reason } => write!(f, "escalated: {reason}"),
            Self::BudgetExhausted { reason } => write!(f, "budget exhausted: {reason}"),
            Self::Deferred { retry_after } => write!(f, "deferred: retry after {retry_after:?}"),
            Self::Blocked { waiting_on } => {
                let ids: Vec<String> = waiting_on.iter().map(|i| format!("#{i}")).collect();
                write!(f, "blocked: waiting on [{}]", ids.join(", "))
            }
            Self::NotTriggered => write!(f, "not triggered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_every_outcome() {
        let results = [
            StepResult::Advanced { executed: vec![], complete: false },
            StepResult::Failed { nodes: vec![] },
            StepResult::Escalated {
                reason: EscalationReason::ExecutionCapReached { executions: 3 },
            },
            StepResult::BudgetExhausted {
                reason: EscalationReason::ExecutionCapReached { executions: 3 },
            },
            StepResult::Gated { awaiting: vec![] },
            StepResult::Busy { held_since: Timestamp::now() },
            StepResult::Deferred { retry_after: None },
            StepResult::Blocked { waiting_on: vec![] },
            StepResult::NotTriggered,
        ];
        let mut codes: Vec<i32> = results.iter().map(StepResult::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), results.len());
        assert!(!codes.contains(&EXIT_FATAL));
    }

    #[test]
    fn display_lists_nodes() {
        let gated = StepResult::Gated {
            awaiting: vec![NodeId::new("design").unwrap()],
        };
        assert_eq!(gated.to_string(), "gated: awaiting approval of [design]");
        assert_eq!(gated.label(), "gated");
    }
}

//! Run-state reconstruction.
//!
//! [`RunState`] is a disposable projection of a work item's comment history.
//! It is rebuilt from scratch at the start of every invocation by replaying
//! the run records (and human commands) in store order, and the executor
//! applies its own freshly written records through the same [`RunState::apply`]
//! path, so in-process state can never diverge from what a later invocation
//! would reconstruct.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::graph::{ready_nodes, ConditionInput, Edge, Evaluation, PipelineGraph};
use crate::record::{
    CommentEntry, EscalationReason, FailureKind, FinishedStatus, GateStatus, HumanCommand,
    NodeCompletion, NodeFailure, NodeOutcome, RunRecord,
};
use crate::{
    ArtifactSet, Diagnostic, DiagnosticSeverity, EdgeId, NodeId, PipelineRunId, StoredComment,
    Timestamp, TokenCost, WorkItem,
};

/// Lifecycle of a node within the current traversal of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    /// Succeeded; downstream edges wait for a human approval.
    AwaitingApproval,
    Succeeded,
    Failed,
}

impl NodeStatus {
    /// Succeeded or failed: outgoing edges may be evaluated.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NodeState {
    status: NodeStatus,
    /// Executions so far, across rework traversals.
    attempts: u32,
    last: Option<NodeCompletion>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            last: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ActiveRun {
    run_id: PipelineRunId,
    graph: PipelineGraph,
    started_at: Timestamp,
}

/// Where a run stands, as derived from its state.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// No `RunStarted` record exists yet.
    NotStarted,
    Escalated(EscalationReason),
    /// Ready nodes, or settled nodes with unresolved edges, exist.
    Runnable,
    /// Nothing can proceed until a human answers these gates.
    Gated(Vec<NodeId>),
    /// A node failed with no outgoing edge taken, or an activated node can
    /// never get its inputs.
    Failed(Vec<NodeId>),
    Complete,
}

/// The reconstructed state of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    work_item: WorkItem,
    run: Option<ActiveRun>,
    nodes: BTreeMap<NodeId, NodeState>,
    resolved: BTreeMap<EdgeId, bool>,
    predicates: BTreeMap<(EdgeId, u32), bool>,
    traversals: BTreeMap<EdgeId, u32>,
    artifacts: ArtifactSet,
    cost: TokenCost,
    retries: u32,
    escalation: Option<EscalationReason>,
    finished: Option<FinishedStatus>,
    classification: Option<String>,
    /// Diagnostics of the failed attempt that sent work back to a rework target.
    feedback: BTreeMap<NodeId, Vec<Diagnostic>>,
}

impl RunState {
    /// A state with no history.
    pub fn empty(work_item: WorkItem) -> Self {
        Self {
            work_item,
            run: None,
            nodes: BTreeMap::new(),
            resolved: BTreeMap::new(),
            predicates: BTreeMap::new(),
            traversals: BTreeMap::new(),
            artifacts: ArtifactSet::new(),
            cost: TokenCost::zero(),
            retries: 0,
            escalation: None,
            finished: None,
            classification: None,
            feedback: BTreeMap::new(),
        }
    }

    /// Replays `comments` in order. Pure: identical inputs give identical state.
    pub fn reconstruct(work_item: WorkItem, comments: &[StoredComment]) -> Self {
        let mut state = Self::empty(work_item);
        for comment in comments {
            state.apply(&CommentEntry::classify(comment));
        }
        state
    }

    /// Applies one classified comment.
    pub fn apply(&mut self, entry: &CommentEntry) {
        match entry {
            CommentEntry::Record(record) => self.apply_record(record),
            CommentEntry::Command(command) => self.apply_command(command),
            CommentEntry::Ignored => {}
        }
    }

    /// Applies one run record.
    pub fn apply_record(&mut self, record: &RunRecord) {
        if let RunRecord::RunStarted {
            run_id,
            definition,
            started_at,
        } = record
        {
            if self.run.is_some() || self.escalation.is_some() {
                debug!(run_id = %run_id, "Ignoring repeated run start");
                return;
            }
            match PipelineGraph::new(definition.clone()) {
                Ok(graph) => {
                    self.nodes = graph
                        .nodes()
                        .map(|n| (n.id.clone(), NodeState::default()))
                        .collect();
                    self.run = Some(ActiveRun {
                        run_id: *run_id,
                        graph,
                        started_at: *started_at,
                    });
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Recorded pipeline definition is invalid");
                    self.escalation = Some(EscalationReason::InvalidDefinition {
                        message: e.to_string(),
                    });
                }
            }
            return;
        }

        if self.run.is_none() {
            if let RunRecord::Escalated { reason, .. } = record {
                self.escalation = Some(reason.clone());
            }
            return;
        }

        match record {
            RunRecord::RunStarted { .. } => {}
            RunRecord::NodeCompleted(completion) => self.apply_completion(completion),
            RunRecord::EdgeResolved { edge, fired } => self.apply_edge(edge, *fired),
            RunRecord::PredicateAnswered {
                edge,
                index,
                value,
                cost,
            } => {
                self.cost += *cost;
                self.predicates.insert((edge.clone(), *index), *value);
            }
            RunRecord::PredicateFailed { .. } => self.retries += 1,
            RunRecord::Escalated { reason, .. } => {
                if self.escalation.is_none() {
                    self.escalation = Some(reason.clone());
                }
            }
            RunRecord::RunFinished { status } => self.finished = Some(*status),
        }
    }

    fn apply_completion(&mut self, completion: &NodeCompletion) {
        // Cost is spent whether or not the result still counts.
        self.cost += completion.cost;

        let Some(node) = self.nodes.get_mut(&completion.node) else {
            debug!(node = %completion.node, "Ignoring completion of unknown node");
            return;
        };
        if node.status != NodeStatus::Pending {
            debug!(node = %completion.node, "Ignoring completion of a node that is not pending");
            return;
        }

        node.attempts += 1;
        node.last = Some(completion.clone());
        node.status = match (completion.outcome, completion.gate) {
            (NodeOutcome::Failed, _) => NodeStatus::Failed,
            (NodeOutcome::Succeeded, GateStatus::AwaitingApproval) => NodeStatus::AwaitingApproval,
            (NodeOutcome::Succeeded, GateStatus::Passed) => NodeStatus::Succeeded,
        };

        if node.status == NodeStatus::Succeeded {
            self.publish(&completion.node);
        }
    }

    /// Makes a successful node's artefacts and classification visible.
    fn publish(&mut self, node: &NodeId) {
        let Some(completion) = self.nodes.get(node).and_then(|n| n.last.as_ref()) else {
            return;
        };
        for artifact in &completion.artifacts {
            self.artifacts.insert(artifact.clone());
        }
        if let Some(class) = completion.output.get("classification").and_then(|v| v.as_str()) {
            self.classification = Some(class.to_string());
        }
    }

    fn apply_edge(&mut self, edge_id: &EdgeId, fired: bool) {
        let Some(edge) = self.graph().and_then(|g| g.edge(edge_id)).cloned() else {
            debug!(edge = %edge_id, "Ignoring resolution of unknown edge");
            return;
        };
        if !fired || !edge.rework {
            self.resolved.insert(edge.id, fired);
            return;
        }

        // A fired rework edge is one traversal.
        if let Some(source) = self.completion(&edge.from) {
            let mut diagnostics = source.diagnostics.clone();
            if let Some(failure) = &source.failure {
                diagnostics.push(Diagnostic {
                    message: failure.message.clone(),
                    artifact: None,
                    location: Some(format!("node {}", edge.from)),
                    severity: DiagnosticSeverity::Blocking,
                });
            }
            self.feedback.insert(edge.to.clone(), diagnostics);
        }
        *self.traversals.entry(edge.id.clone()).or_default() += 1;
        self.retries += 1;
        let closure = self
            .graph()
            .map(|g| g.forward_closure(&edge.to))
            .unwrap_or_default();
        self.reset(&closure);
    }

    fn reset(&mut self, nodes: &BTreeSet<NodeId>) {
        let outgoing: Vec<EdgeId> = match self.graph() {
            Some(graph) => nodes
                .iter()
                .flat_map(|n| graph.outgoing(n).map(|e| e.id.clone()))
                .collect(),
            None => return,
        };
        for id in nodes {
            if let Some(node) = self.nodes.get_mut(id) {
                node.status = NodeStatus::Pending;
                node.last = None;
            }
            self.artifacts.remove_from(id);
        }
        for edge in &outgoing {
            self.resolved.remove(edge);
        }
        self.predicates.retain(|(edge, _), _| !outgoing.contains(edge));
    }

    fn apply_command(&mut self, command: &HumanCommand) {
        let node_id = match command {
            HumanCommand::Approve(node) | HumanCommand::Reject { node, .. } => node,
        };
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        if node.status != NodeStatus::AwaitingApproval {
            return;
        }

        match command {
            HumanCommand::Approve(_) => {
                node.status = NodeStatus::Succeeded;
                self.publish(node_id);
            }
            HumanCommand::Reject { reason, .. } => {
                node.status = NodeStatus::Failed;
                if let Some(last) = node.last.as_mut() {
                    last.outcome = NodeOutcome::Failed;
                    last.failure = Some(NodeFailure {
                        kind: FailureKind::Rejected,
                        message: reason
                            .clone()
                            .unwrap_or_else(|| "rejected at gate".to_string()),
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn work_item(&self) -> &WorkItem {
        &self.work_item
    }

    /// The graph the run was started with.
    pub fn graph(&self) -> Option<&PipelineGraph> {
        self.run.as_ref().map(|r| &r.graph)
    }

    pub fn run_id(&self) -> Option<PipelineRunId> {
        self.run.as_ref().map(|r| r.run_id)
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.run.as_ref().map(|r| r.started_at)
    }

    pub fn node_status(&self, node: &NodeId) -> NodeStatus {
        self.nodes
            .get(node)
            .map_or(NodeStatus::Pending, |n| n.status)
    }

    /// Number of times `node` has been executed in this run.
    pub fn attempts(&self, node: &NodeId) -> u32 {
        self.nodes.get(node).map_or(0, |n| n.attempts)
    }

    /// The node's result in the current traversal.
    pub fn completion(&self, node: &NodeId) -> Option<&NodeCompletion> {
        self.nodes.get(node).and_then(|n| n.last.as_ref())
    }

    /// `Some(fired)` once the edge has been resolved in the current traversal.
    pub fn resolution(&self, edge: &EdgeId) -> Option<bool> {
        self.resolved.get(edge).copied()
    }

    pub fn has_fired(&self, edge: &EdgeId) -> bool {
        self.resolution(edge) == Some(true)
    }

    /// Cached answer to a reasoning predicate.
    pub fn predicate(&self, edge: &EdgeId, index: u32) -> Option<bool> {
        self.predicates.get(&(edge.clone(), index)).copied()
    }

    /// Times a rework edge has fired in this run.
    pub fn traversals(&self, edge: &EdgeId) -> u32 {
        self.traversals.get(edge).copied().unwrap_or(0)
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Total cost recorded for the run; never decreases.
    pub fn accumulated_cost(&self) -> TokenCost {
        self.cost
    }

    /// Rework traversals across all edges; never decreases.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn escalation(&self) -> Option<&EscalationReason> {
        self.escalation.as_ref()
    }

    pub fn finished(&self) -> Option<FinishedStatus> {
        self.finished
    }

    /// Diagnostics from the attempt that last routed work back to `node`.
    pub fn rework_feedback(&self, node: &NodeId) -> &[Diagnostic] {
        self.feedback.get(node).map_or(&[], Vec::as_slice)
    }

    /// Classification produced by a node of this run, if any.
    pub fn classification(&self) -> Option<&str> {
        self.classification.as_deref()
    }

    /// Nodes waiting for a human, in declaration order.
    pub fn awaiting_approval(&self) -> Vec<NodeId> {
        self.nodes_in_order(|s| s == NodeStatus::AwaitingApproval)
    }

    fn nodes_in_order(&self, pred: impl Fn(NodeStatus) -> bool) -> Vec<NodeId> {
        self.graph()
            .map(|g| {
                g.nodes()
                    .filter(|n| pred(self.node_status(&n.id)))
                    .map(|n| n.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Outgoing edges of settled nodes that are still unresolved, in
    /// node declaration order then edge declaration order.
    pub fn unresolved_edges(&self) -> Vec<&Edge> {
        let Some(graph) = self.graph() else {
            return Vec::new();
        };
        graph
            .nodes()
            .filter(|n| self.node_status(&n.id).is_settled())
            .flat_map(|n| graph.outgoing(&n.id))
            .filter(|e| self.resolution(&e.id).is_none())
            .collect()
    }

    /// Evaluates `edge` against its source node's result, using cached
    /// predicate answers. Unsettled sources never fire.
    pub fn evaluate_edge<'e>(&self, edge: &'e Edge) -> Evaluation<'e> {
        let Some(source) = self
            .completion(&edge.from)
            .filter(|_| self.node_status(&edge.from).is_settled())
        else {
            return Evaluation::Decided(false);
        };
        let outcome = source.outcome;
        match &edge.condition {
            None => Evaluation::Decided(outcome == NodeOutcome::Succeeded),
            Some(condition) => {
                let input = ConditionInput {
                    outcome,
                    output: &source.output,
                    failure: source.failure.as_ref().map(|f| f.kind),
                };
                condition.evaluate(&input, &|index| self.predicate(&edge.id, index))
            }
        }
    }

    /// Where the run stands.
    pub fn status(&self) -> RunStatus {
        if let Some(reason) = &self.escalation {
            return RunStatus::Escalated(reason.clone());
        }
        let Some(graph) = self.graph() else {
            return RunStatus::NotStarted;
        };

        if !ready_nodes(graph, self).is_empty() || !self.unresolved_edges().is_empty() {
            return RunStatus::Runnable;
        }

        let gated = self.awaiting_approval();
        if !gated.is_empty() {
            return RunStatus::Gated(gated);
        }

        let mut failed: Vec<NodeId> = graph
            .nodes()
            .filter(|n| self.node_status(&n.id) == NodeStatus::Failed)
            .filter(|n| !graph.outgoing(&n.id).any(|e| self.has_fired(&e.id)))
            .map(|n| n.id.clone())
            .collect();
        failed.extend(
            graph
                .nodes()
                .filter(|n| {
                    self.node_status(&n.id) == NodeStatus::Pending
                        && crate::graph::is_activated(graph, self, &n.id)
                })
                .map(|n| n.id.clone()),
        );
        if !failed.is_empty() {
            return RunStatus::Failed(failed);
        }

        RunStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::*;
    use crate::graph::PipelineDefinition;
    use crate::record::NodeCompletion;
    use crate::testing::{completion, failure, sample_work_item};
    use crate::{Artifact, ArtifactType, CommentId};

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn eid(s: &str) -> EdgeId {
        EdgeId::new(s).unwrap()
    }

    fn started(def: PipelineDefinition) -> RunRecord {
        RunRecord::RunStarted {
            run_id: PipelineRunId::new_random(),
            definition: def,
            started_at: Timestamp::now(),
        }
    }

    fn comments(records: &[RunRecord]) -> Vec<StoredComment> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| StoredComment {
                id: CommentId::new(i as u64 + 1),
                body: r.to_comment().unwrap(),
                created_at: Timestamp::now(),
                authored_by_engine: true,
            })
            .collect()
    }

    fn loop_definition() -> PipelineDefinition {
        definition(
            vec![
                tool("a", &["work_item"], &["code"]),
                tool("b", &["code"], &["report"]),
                tool("c", &["report"], &[]),
            ],
            vec![
                edge("a-b", "a", "b"),
                edge("b-c", "b", "c"),
                rework("b-a", "b", "a", 2),
            ],
        )
    }

    fn with_output(mut c: NodeCompletion, artifact_type: &str) -> NodeCompletion {
        c.artifacts.push(Artifact::inline(
            ArtifactType::new(artifact_type).unwrap(),
            c.node.clone(),
            serde_json::Value::Null,
        ));
        c
    }

    #[test]
    fn nothing_recorded_means_not_started() {
        let state = RunState::reconstruct(sample_work_item(1), &[]);
        assert_eq!(state.status(), RunStatus::NotStarted);
        assert!(state.graph().is_none());
    }

    #[test]
    fn failed_predicates_count_as_retries() {
        let records = vec![
            started(loop_definition()),
            RunRecord::PredicateFailed {
                edge: eid("a-b"),
                index: 0,
                message: "provider error".into(),
            },
            RunRecord::PredicateFailed {
                edge: eid("a-b"),
                index: 0,
                message: "provider error".into(),
            },
        ];
        let state = RunState::reconstruct(sample_work_item(1), &comments(&records));
        assert_eq!(state.retries(), 2);
        assert_eq!(state.resolution(&eid("a-b")), None);
    }

    #[test]
    fn rework_firing_resets_the_forward_closure_and_counts() {
        let records = vec![
            started(loop_definition()),
            RunRecord::NodeCompleted(with_output(completion("a", 1, 0.1), "code")),
            RunRecord::EdgeResolved { edge: eid("a-b"), fired: true },
            RunRecord::NodeCompleted(failure("b", 1, FailureKind::DomainServiceError)),
            RunRecord::EdgeResolved { edge: eid("b-c"), fired: false },
            RunRecord::EdgeResolved { edge: eid("b-a"), fired: true },
        ];
        let state = RunState::reconstruct(sample_work_item(1), &comments(&records));

        assert_eq!(state.node_status(&id("a")), NodeStatus::Pending);
        assert_eq!(state.node_status(&id("b")), NodeStatus::Pending);
        assert_eq!(state.attempts(&id("a")), 1);
        assert_eq!(state.traversals(&eid("b-a")), 1);
        assert_eq!(state.rework_feedback(&id("a")).len(), 1);
        assert_eq!(state.retries(), 1);
        assert_eq!(state.resolution(&eid("a-b")), None);
        assert_eq!(state.resolution(&eid("b-c")), None);
        assert!(!state.artifacts().contains(&ArtifactType::new("code").unwrap()));
        assert!((state.accumulated_cost().as_f64() - 0.2).abs() < 1e-9);
        assert_eq!(state.status(), RunStatus::Runnable);
    }

    #[test]
    fn duplicate_completion_counts_cost_but_not_result() {
        let records = vec![
            started(loop_definition()),
            RunRecord::NodeCompleted(completion("a", 1, 0.1)),
            RunRecord::NodeCompleted(failure("a", 2, FailureKind::Timeout)),
        ];
        let state = RunState::reconstruct(sample_work_item(1), &comments(&records));
        assert_eq!(state.node_status(&id("a")), NodeStatus::Succeeded);
        assert_eq!(state.attempts(&id("a")), 1);
        assert!((state.accumulated_cost().as_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn approval_only_counts_after_the_gate_was_posted() {
        let def = definition(
            vec![tool("a", &[], &["design"]), tool("b", &["design"], &[])],
            vec![edge("a-b", "a", "b")],
        );
        let mut gated = with_output(completion("a", 1, 0.0), "design");
        gated.gate = GateStatus::AwaitingApproval;

        let mut history = comments(&[started(def)]);
        let human = |body: &str| StoredComment {
            id: CommentId::new(100),
            body: body.to_string(),
            created_at: Timestamp::now(),
            authored_by_engine: false,
        };
        history.push(human("/cogworks approve a"));
        history.extend(comments(&[RunRecord::NodeCompleted(gated)]));

        let state = RunState::reconstruct(sample_work_item(1), &history);
        assert_eq!(state.status(), RunStatus::Gated(vec![id("a")]));
        assert!(!state.artifacts().contains(&ArtifactType::new("design").unwrap()));

        history.push(human("/cogworks approve a"));
        let state = RunState::reconstruct(sample_work_item(1), &history);
        assert_eq!(state.node_status(&id("a")), NodeStatus::Succeeded);
        assert!(state.artifacts().contains(&ArtifactType::new("design").unwrap()));
        assert_eq!(state.status(), RunStatus::Runnable);
    }

    #[test]
    fn rejection_fails_the_gated_node() {
        let def = definition(vec![tool("a", &[], &[])], vec![]);
        let mut gated = completion("a", 1, 0.0);
        gated.gate = GateStatus::AwaitingApproval;
        let mut history = comments(&[started(def), RunRecord::NodeCompleted(gated)]);
        history.push(StoredComment {
            id: CommentId::new(9),
            body: "/cogworks reject a wrong approach".into(),
            created_at: Timestamp::now(),
            authored_by_engine: false,
        });

        let state = RunState::reconstruct(sample_work_item(1), &history);
        assert_eq!(state.node_status(&id("a")), NodeStatus::Failed);
        let failure = state.completion(&id("a")).unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Rejected);
        assert_eq!(failure.message, "wrong approach");
        assert_eq!(state.status(), RunStatus::Failed(vec![id("a")]));
    }

    #[test]
    fn invalid_recorded_definition_escalates() {
        let def = definition(vec![tool("a", &[], &[])], vec![edge("a-x", "a", "x")]);
        let state = RunState::reconstruct(sample_work_item(1), &comments(&[started(def)]));
        assert!(matches!(
            state.status(),
            RunStatus::Escalated(EscalationReason::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let records = vec![
            started(loop_definition()),
            RunRecord::NodeCompleted(with_output(completion("a", 1, 0.3), "code")),
            RunRecord::EdgeResolved { edge: eid("a-b"), fired: true },
        ];
        let history = comments(&records);
        let first = RunState::reconstruct(sample_work_item(1), &history);
        let second = RunState::reconstruct(sample_work_item(1), &history);
        assert_eq!(first, second);
    }

    #[test]
    fn completed_linear_run_is_complete() {
        let def = definition(
            vec![tool("a", &[], &["x"]), tool("b", &["x"], &[])],
            vec![edge("a-b", "a", "b")],
        );
        let records = vec![
            started(def),
            RunRecord::NodeCompleted(with_output(completion("a", 1, 0.0), "x")),
            RunRecord::EdgeResolved { edge: eid("a-b"), fired: true },
            RunRecord::NodeCompleted(completion("b", 1, 0.0)),
        ];
        let state = RunState::reconstruct(sample_work_item(1), &comments(&records));
        assert_eq!(state.status(), RunStatus::Complete);
    }
}

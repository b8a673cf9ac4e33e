//! The pipeline graph model.
//!
//! A [`PipelineDefinition`] is the declared form of a graph; a
//! [`PipelineGraph`] is a definition that passed structural validation,
//! together with the adjacency indices the engine needs. Construction either
//! yields a complete graph or fails with every defect found; there is no
//! partially loaded state.
//!
//! Rework edges are the only permitted cycles. They are never followed by
//! generic traversal: readiness and reachability consider forward edges only,
//! and rework firings are bounded by an explicit per-edge traversal counter
//! kept in the run state.

mod condition;
mod definition;
mod ready;
mod validate;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub use condition::{ConditionInput, Evaluation};
pub use definition::{
    Edge, EdgeCondition, GateMode, Node, NodeAction, NodeKind, PipelineDefinition,
    SafetyOverride, SelectionRule, DEFAULT_MAX_TRAVERSALS,
};
pub use ready::{is_activated, ready_nodes};

use crate::{ArtifactType, CogWorksError, EdgeId, NodeId, PipelineName};

/// A structurally valid pipeline graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    definition: PipelineDefinition,
    node_index: BTreeMap<NodeId, usize>,
    edge_index: BTreeMap<EdgeId, usize>,
    /// Outgoing edge indices per node, in declaration order.
    outgoing: BTreeMap<NodeId, Vec<usize>>,
    /// Incoming forward (non-rework) edge indices per node, in declaration order.
    incoming_forward: BTreeMap<NodeId, Vec<usize>>,
}

impl PipelineGraph {
    /// Validates `definition` and builds the graph.
    ///
    /// # Errors
    ///
    /// [`CogWorksError::StructuralConfig`] listing every defect found.
    pub fn new(definition: PipelineDefinition) -> Result<Self, CogWorksError> {
        let errors = validate::validate(&definition);
        if !errors.is_empty() {
            return Err(CogWorksError::StructuralConfig { errors });
        }

        let node_index = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let edge_index = definition
            .edges
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let mut outgoing: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        let mut incoming_forward: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
            if !edge.rework {
                incoming_forward.entry(edge.to.clone()).or_default().push(i);
            }
        }

        Ok(Self {
            definition,
            node_index,
            edge_index,
            outgoing,
            incoming_forward,
        })
    }

    /// The definition this graph was built from.
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// The pipeline's name.
    pub fn name(&self) -> &PipelineName {
        &self.definition.name
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.definition.nodes.iter()
    }

    /// Looks up a node.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.definition.nodes[i])
    }

    /// Looks up an edge.
    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edge_index.get(id).map(|&i| &self.definition.edges[i])
    }

    /// Position of a node in declaration order. Used for deterministic ordering.
    pub fn position(&self, id: &NodeId) -> usize {
        self.node_index.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Outgoing edges of `node` (forward and rework), in declaration order.
    pub fn outgoing(&self, node: &NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.definition.edges[i])
    }

    /// Incoming forward edges of `node`, in declaration order.
    pub fn incoming_forward(&self, node: &NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming_forward
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.definition.edges[i])
    }

    /// Whether `node` has no incoming forward edges.
    pub fn is_entry(&self, node: &NodeId) -> bool {
        self.incoming_forward.get(node).map_or(true, Vec::is_empty)
    }

    /// `start` and every node reachable from it over forward edges.
    pub fn forward_closure(&self, start: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for edge in self.outgoing(&node).filter(|e| !e.rework) {
                queue.push_back(edge.to.clone());
            }
        }
        seen
    }

    /// How consumers select among artefacts of `artifact_type`.
    pub fn selection_rule(&self, artifact_type: &ArtifactType) -> SelectionRule {
        self.definition
            .artifact_selection
            .get(artifact_type)
            .copied()
            .unwrap_or(SelectionRule::Latest)
    }

    /// Upper bound on node executions in one invocation.
    ///
    /// Every node may run once plus once per possible rework traversal.
    pub fn execution_cap(&self) -> usize {
        let rework: usize = self
            .definition
            .edges
            .iter()
            .filter(|e| e.rework)
            .map(|e| e.traversal_limit() as usize)
            .sum();
        self.definition.nodes.len() * (rework + 1)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn indices_follow_declaration_order() {
        let graph = PipelineGraph::new(definition(
            vec![tool("a", &[], &["x"]), tool("b", &["x"], &[]), tool("c", &["x"], &[])],
            vec![edge("a-c", "a", "c"), edge("a-b", "a", "b")],
        ))
        .unwrap();

        let targets: Vec<_> = graph.outgoing(&id("a")).map(|e| e.to.as_str()).collect();
        assert_eq!(targets, vec!["c", "b"]);
        assert!(graph.is_entry(&id("a")));
        assert!(!graph.is_entry(&id("b")));
        assert_eq!(graph.position(&id("c")), 2);
    }

    #[test]
    fn forward_closure_ignores_rework_edges() {
        let graph = PipelineGraph::new(definition(
            vec![tool("a", &[], &[]), tool("b", &[], &[]), tool("c", &[], &[])],
            vec![edge("a-b", "a", "b"), edge("b-c", "b", "c"), rework("c-b", "c", "b", 2)],
        ))
        .unwrap();

        let closure: Vec<_> = graph.forward_closure(&id("b")).into_iter().collect();
        assert_eq!(closure, vec![id("b"), id("c")]);
        assert_eq!(graph.execution_cap(), 9);
    }

    #[test]
    fn invalid_definitions_are_rejected_whole() {
        let err = PipelineGraph::new(definition(
            vec![tool("a", &[], &[])],
            vec![edge("a-z", "a", "z")],
        ))
        .unwrap_err();
        assert!(matches!(err, CogWorksError::StructuralConfig { .. }));
    }
}

//! Ready-node computation.

use super::PipelineGraph;
use crate::state::{NodeStatus, RunState};
use crate::{ArtifactType, NodeId};

/// Nodes that may execute now, in declaration order.
///
/// A node is ready when it is pending, activated by its incoming edges, and
/// every declared input artefact exists. Fan-in follows from activation: a
/// node with unconditional incoming edges waits for all of them to fire.
pub fn ready_nodes(graph: &PipelineGraph, state: &RunState) -> Vec<NodeId> {
    let work_item = ArtifactType::work_item();
    graph
        .nodes()
        .filter(|n| state.node_status(&n.id) == NodeStatus::Pending)
        .filter(|n| is_activated(graph, state, &n.id))
        .filter(|n| {
            n.inputs
                .iter()
                .all(|input| *input == work_item || state.artifacts().contains(input))
        })
        .map(|n| n.id.clone())
        .collect()
}

/// Whether the edges into `node` allow it to run.
///
/// Entry nodes are always activated. Otherwise every unconditional incoming
/// forward edge must have fired; a node reached only through conditional
/// edges needs at least one of them to fire.
pub fn is_activated(graph: &PipelineGraph, state: &RunState, node: &NodeId) -> bool {
    if graph.is_entry(node) {
        return true;
    }
    let (conditional, unconditional): (Vec<_>, Vec<_>) =
        graph.incoming_forward(node).partition(|e| e.is_conditional());
    if unconditional.is_empty() {
        conditional.iter().any(|e| state.has_fired(&e.id))
    } else {
        unconditional.iter().all(|e| state.has_fired(&e.id))
    }
}

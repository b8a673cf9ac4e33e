//! Structural validation of pipeline definitions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{NodeAction, PipelineDefinition};
use crate::{ArtifactType, NodeId, StructuralError};

/// Returns every structural defect in `definition`; empty when valid.
pub(super) fn validate(definition: &PipelineDefinition) -> Vec<StructuralError> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push(StructuralError::EmptyPipeline(definition.name.clone()));
        return errors;
    }

    let mut node_ids = BTreeSet::new();
    for node in &definition.nodes {
        if !node_ids.insert(&node.id) {
            errors.push(StructuralError::DuplicateNode(node.id.clone()));
        }
        check_node_action(node, &mut errors);
    }

    let mut edge_ids = BTreeSet::new();
    for edge in &definition.edges {
        if !edge_ids.insert(&edge.id) {
            errors.push(StructuralError::DuplicateEdge(edge.id.clone()));
        }
        for end in [&edge.from, &edge.to] {
            if !node_ids.contains(end) {
                errors.push(StructuralError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: end.clone(),
                });
            }
        }
        if edge.rework && edge.traversal_limit() == 0 {
            errors.push(StructuralError::InvalidReworkBound(edge.id.clone()));
        }
        if let Some(condition) = &edge.condition {
            if let Err(reason) = condition.check() {
                errors.push(StructuralError::InvalidCondition {
                    edge: edge.id.clone(),
                    reason,
                });
            }
        }
    }

    // Cycle and loop checks need a well-formed node and edge set.
    if errors.iter().any(|e| {
        matches!(
            e,
            StructuralError::DanglingEdge { .. } | StructuralError::DuplicateNode(_)
        )
    }) {
        return errors;
    }

    check_forward_cycles(definition, &mut errors);
    check_rework_loops(definition, &mut errors);
    check_producers(definition, &mut errors);

    errors
}

fn check_node_action(node: &super::Node, errors: &mut Vec<StructuralError>) {
    let invalid = |reason: &str| StructuralError::InvalidNode {
        node: node.id.clone(),
        reason: reason.to_string(),
    };
    match &node.action {
        NodeAction::ReasoningCall { prompt, .. } if prompt.trim().is_empty() => {
            errors.push(invalid("reasoning prompt is empty"));
        }
        NodeAction::Spawn { .. } if node.inputs.is_empty() => {
            errors.push(invalid("spawn node must declare the plan artifact as an input"));
        }
        _ => {}
    }
    if node.timeout_secs == Some(0) {
        errors.push(invalid("timeout_secs must be greater than zero"));
    }
}

/// Kahn's algorithm over forward edges; whatever cannot be ordered is on a cycle
/// (or downstream of one) that has no rework bound.
fn check_forward_cycles(definition: &PipelineDefinition, errors: &mut Vec<StructuralError>) {
    let mut in_degree: BTreeMap<&NodeId, usize> =
        definition.nodes.iter().map(|n| (&n.id, 0)).collect();
    let mut successors: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    for edge in definition.edges.iter().filter(|e| !e.rework) {
        *in_degree.entry(&edge.to).or_default() += 1;
        successors.entry(&edge.from).or_default().push(&edge.to);
    }

    if in_degree.values().all(|&d| d > 0) {
        errors.push(StructuralError::NoEntryNode);
    }

    let mut queue: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut ordered = 0;
    while let Some(node) = queue.pop_front() {
        ordered += 1;
        for next in successors.get(node).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if ordered < definition.nodes.len() {
        let nodes = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.clone())
            .collect();
        errors.push(StructuralError::UnboundedCycle { nodes });
    }
}

/// A rework edge must point at a node from which its source is reachable.
fn check_rework_loops(definition: &PipelineDefinition, errors: &mut Vec<StructuralError>) {
    let mut successors: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    for edge in definition.edges.iter().filter(|e| !e.rework) {
        successors.entry(&edge.from).or_default().push(&edge.to);
    }

    for edge in definition.edges.iter().filter(|e| e.rework) {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([&edge.to]);
        let mut closes = false;
        while let Some(node) = queue.pop_front() {
            if node == &edge.from {
                closes = true;
                break;
            }
            if seen.insert(node) {
                queue.extend(successors.get(node).into_iter().flatten().copied());
            }
        }
        if !closes {
            errors.push(StructuralError::ReworkNotALoop(edge.id.clone()));
        }
    }
}

fn check_producers(definition: &PipelineDefinition, errors: &mut Vec<StructuralError>) {
    let mut producers: BTreeMap<&ArtifactType, Vec<NodeId>> = BTreeMap::new();
    for node in &definition.nodes {
        for output in &node.outputs {
            producers.entry(output).or_default().push(node.id.clone());
        }
    }

    for (artifact_type, nodes) in &producers {
        if nodes.len() > 1 && !definition.artifact_selection.contains_key(*artifact_type) {
            errors.push(StructuralError::AmbiguousProducer {
                artifact_type: (*artifact_type).clone(),
                producers: nodes.clone(),
            });
        }
    }

    let work_item = ArtifactType::work_item();
    for node in &definition.nodes {
        for input in &node.inputs {
            if *input != work_item && !producers.contains_key(input) {
                errors.push(StructuralError::MissingProducer {
                    node: node.id.clone(),
                    artifact_type: input.clone(),
                });
            }
        }
    }
}

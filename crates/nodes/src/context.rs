//! Everything a node needs to execute, gathered before the wave starts.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};

use pipeline::graph::SelectionRule;
use pipeline::{
    ArtifactType, Diagnostic, Node, PipelineGraph, PipelineName, RepositoryContext, RunState,
    WorkItem,
};

/// An owned snapshot of one node's inputs.
///
/// Contexts are built from the run state before the wave runs, so node
/// execution never observes records written by its siblings.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node: Node,
    pub pipeline: PipelineName,
    pub work_item: WorkItem,
    /// Input artefact content by type. Types with selection rule `all` map
    /// to an array of every artefact's content.
    pub inputs: BTreeMap<ArtifactType, Value>,
    /// Diagnostics from the attempt that routed work back to this node.
    pub feedback: Vec<Diagnostic>,
    /// 1 for the first execution.
    pub attempt: u32,
    pub repository: RepositoryContext,
    pub trace_id: String,
    pub timeout: Duration,
}

impl NodeContext {
    /// Builds the context for `node`. Returns the missing input types when
    /// some declared input is unavailable.
    pub fn build(
        graph: &PipelineGraph,
        state: &RunState,
        node: &Node,
        repository: &RepositoryContext,
        trace_id: &str,
        default_timeout: Duration,
    ) -> Result<Self, Vec<ArtifactType>> {
        let work_item_type = ArtifactType::work_item();
        let mut inputs = BTreeMap::new();
        let mut missing = Vec::new();

        for input in &node.inputs {
            if *input == work_item_type {
                inputs.insert(input.clone(), work_item_value(state.work_item()));
                continue;
            }
            let value = match graph.selection_rule(input) {
                SelectionRule::Latest => state.artifacts().latest(input).map(|a| a.content.clone()),
                SelectionRule::All => {
                    let all = state.artifacts().all(input);
                    (!all.is_empty())
                        .then(|| Value::Array(all.iter().map(|a| a.content.clone()).collect()))
                }
            };
            match value {
                Some(v) => {
                    inputs.insert(input.clone(), v);
                }
                None => missing.push(input.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(Self {
            node: node.clone(),
            pipeline: graph.name().clone(),
            work_item: state.work_item().clone(),
            inputs,
            feedback: state.rework_feedback(&node.id).to_vec(),
            attempt: state.attempts(&node.id) + 1,
            repository: repository.clone(),
            trace_id: trace_id.to_string(),
            timeout: node.timeout(default_timeout),
        })
    }

    /// Inputs as one JSON object keyed by artefact type.
    pub fn inputs_value(&self) -> Value {
        Value::Object(
            self.inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

/// The built-in `work_item` artefact.
fn work_item_value(item: &WorkItem) -> Value {
    json!({
        "reference": item.reference.to_string(),
        "title": item.title,
        "body": item.body,
        "labels": item.labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::record::RunRecord;
    use pipeline::testing::{completion, sample_work_item};
    use pipeline::{Artifact, NodeId, PipelineDefinition, PipelineRunId, Timestamp};

    fn graph() -> PipelineGraph {
        let definition: PipelineDefinition = serde_json::from_value(json!({
            "name": "p",
            "nodes": [
                { "id": "a", "kind": "gate", "outputs": ["review"] },
                { "id": "b", "kind": "gate", "outputs": ["review"] },
                { "id": "c", "kind": "gate", "inputs": ["work_item", "review"], "timeout_secs": 7 }
            ],
            "edges": [
                { "id": "a-c", "from": "a", "to": "c" },
                { "id": "b-c", "from": "b", "to": "c" }
            ],
            "artifact_selection": { "review": "all" }
        }))
        .unwrap();
        PipelineGraph::new(definition).unwrap()
    }

    fn repo() -> RepositoryContext {
        RepositoryContext {
            path: ".".into(),
            git_ref: "main".into(),
        }
    }

    #[test]
    fn inputs_follow_selection_rules_and_include_the_work_item() {
        let graph = graph();
        let mut state = RunState::empty(sample_work_item(3));
        state.apply_record(&RunRecord::RunStarted {
            run_id: PipelineRunId::new_random(),
            definition: graph.definition().clone(),
            started_at: Timestamp::now(),
        });
        for (node, verdict) in [("a", "ok"), ("b", "nits")] {
            let mut c = completion(node, 1, 0.0);
            c.artifacts.push(Artifact::inline(
                ArtifactType::new("review").unwrap(),
                NodeId::new(node).unwrap(),
                json!({ "verdict": verdict }),
            ));
            state.apply_record(&RunRecord::NodeCompleted(c));
        }

        let node = graph.node(&NodeId::new("c").unwrap()).unwrap();
        let ctx = NodeContext::build(&graph, &state, node, &repo(), "t", Duration::from_secs(60)).unwrap();

        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.timeout, Duration::from_secs(7));
        let inputs = ctx.inputs_value();
        assert_eq!(inputs["work_item"]["title"], json!(state.work_item().title));
        assert_eq!(inputs["review"], json!([{ "verdict": "ok" }, { "verdict": "nits" }]));
    }

    #[test]
    fn missing_inputs_are_reported() {
        let graph = graph();
        let state = RunState::empty(sample_work_item(3));
        let node = graph.node(&NodeId::new("c").unwrap()).unwrap();
        let missing =
            NodeContext::build(&graph, &state, node, &repo(), "t", Duration::from_secs(1)).unwrap_err();
        assert_eq!(missing, vec![ArtifactType::new("review").unwrap()]);
    }
}

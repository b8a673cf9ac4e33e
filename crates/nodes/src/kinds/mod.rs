//! Per-kind node execution.
//!
//! Every node kind is executed through [`execute`], which dispatches on the
//! node's [`NodeAction`]. A node never writes run records itself; it returns
//! a [`NodeRun`] and the executor records it.

mod gate;
mod reasoning;
mod spawn;
mod tool;

use std::time::Duration;

use serde_json::Value;

use pipeline::{
    Artifact, ArtifactStore, Diagnostic, FailureKind, NodeAction, NodeFailure, NodeOutcome,
    ReasoningProvider, TokenCost,
};

use crate::context::NodeContext;
use crate::gateway::DomainGateway;

pub use spawn::PLAN_ARTIFACT;

/// The collaborators a node may call.
#[derive(Clone, Copy)]
pub struct NodeServices<'a> {
    pub reasoner: &'a dyn ReasoningProvider,
    pub domains: &'a DomainGateway,
    pub store: &'a dyn ArtifactStore,
}

/// The result of one node execution, before it is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub outcome: NodeOutcome,
    pub output: Value,
    pub artifacts: Vec<Artifact>,
    pub cost: TokenCost,
    pub diagnostics: Vec<Diagnostic>,
    pub failure: Option<NodeFailure>,
}

impl NodeResult {
    pub fn succeeded(output: Value, artifacts: Vec<Artifact>) -> Self {
        Self {
            outcome: NodeOutcome::Succeeded,
            output,
            artifacts,
            cost: TokenCost::zero(),
            diagnostics: Vec::new(),
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            outcome: NodeOutcome::Failed,
            output: Value::Null,
            artifacts: Vec::new(),
            cost: TokenCost::zero(),
            diagnostics: Vec::new(),
            failure: Some(NodeFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn with_cost(mut self, cost: TokenCost) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// What came of running a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRun {
    Finished(NodeResult),
    /// A transient condition stopped the node; nothing is recorded and the
    /// node stays ready for the next trigger.
    Deferred { retry_after: Option<Duration> },
}

impl From<NodeResult> for NodeRun {
    fn from(result: NodeResult) -> Self {
        Self::Finished(result)
    }
}

/// Executes one node.
pub async fn execute(ctx: &NodeContext, services: NodeServices<'_>) -> NodeRun {
    match &ctx.node.action {
        NodeAction::ToolExecution {
            domain,
            operation,
            payload,
        } => tool::execute(ctx, services, domain, operation, payload).await,
        NodeAction::ReasoningCall {
            prompt,
            system,
            required_fields,
            max_tokens,
        } => {
            let call = reasoning::Call {
                prompt,
                system: system.as_deref(),
                required_fields,
                max_tokens: *max_tokens,
            };
            reasoning::execute(ctx, services, call).await
        }
        NodeAction::Gate => gate::execute(ctx).into(),
        NodeAction::Spawn { pipeline } => spawn::execute(ctx, services, pipeline.as_ref()).await,
    }
}

/// One inline artefact per declared output type, all carrying `content`.
fn declared_outputs(ctx: &NodeContext, content: &Value) -> Vec<Artifact> {
    ctx.node
        .outputs
        .iter()
        .map(|t| Artifact::inline(t.clone(), ctx.node.id.clone(), content.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::Value;

    use pipeline::testing::sample_work_item;
    use pipeline::{ArtifactType, Node, PipelineName, RepositoryContext};

    use crate::context::NodeContext;

    /// A context for `node` with the given inputs.
    pub fn context(node: Value, inputs: &[(&str, Value)]) -> NodeContext {
        let node: Node = serde_json::from_value(node).unwrap();
        NodeContext {
            node,
            pipeline: PipelineName::new("default").unwrap(),
            work_item: sample_work_item(1),
            inputs: inputs
                .iter()
                .map(|(k, v)| (ArtifactType::new(*k).unwrap(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            feedback: Vec::new(),
            attempt: 1,
            repository: RepositoryContext {
                path: "/work".into(),
                git_ref: "main".into(),
            },
            trace_id: "trace-1".into(),
            timeout: Duration::from_secs(5),
        }
    }
}

//! Tool-execution nodes: one operation on a domain service.

use serde_json::{json, Value};
use tracing::debug;

use pipeline::{
    Artifact, DiagnosticSeverity, DomainServiceName, ExtensionRequest, FailureKind,
    OperationName, ResponseStatus,
};

use super::{NodeResult, NodeRun, NodeServices};
use crate::context::NodeContext;

pub(super) async fn execute(
    ctx: &NodeContext,
    services: NodeServices<'_>,
    domain: &DomainServiceName,
    operation: &OperationName,
    parameters: &Value,
) -> NodeRun {
    let request = ExtensionRequest {
        repository: ctx.repository.clone(),
        domain: domain.clone(),
        operation: operation.clone(),
        payload: json!({
            "parameters": parameters,
            "inputs": ctx.inputs_value(),
            "feedback": ctx.feedback,
        }),
        trace_id: ctx.trace_id.clone(),
    };

    let response = match services.domains.invoke(&request, ctx.timeout).await {
        Ok(response) => response,
        Err(e) => return NodeResult::failed(e.failure_kind(), e.to_string()).into(),
    };
    debug!(
        domain = %domain,
        operation = %operation,
        diagnostics = response.diagnostics.len(),
        artifacts = response.artifacts.len(),
        "Domain service answered"
    );

    match response.status {
        ResponseStatus::Error => {
            let blocking = response
                .diagnostics
                .iter()
                .filter(|d| d.severity == DiagnosticSeverity::Blocking)
                .count();
            let message = format!(
                "{domain}/{operation} reported an error ({} diagnostics, {blocking} blocking)",
                response.diagnostics.len()
            );
            NodeResult::failed(FailureKind::DomainServiceError, message)
                .with_diagnostics(response.diagnostics)
                .into()
        }
        ResponseStatus::Ok => {
            let output = json!({
                "status": "ok",
                "artifacts": response.artifacts,
                "diagnostics": response.diagnostics.len(),
            });
            let artifacts = ctx
                .node
                .outputs
                .iter()
                .map(|t| {
                    // A service artefact tagged with the declared type wins
                    // over the whole response.
                    let content = response
                        .artifacts
                        .iter()
                        .find(|a| a.get("type").and_then(Value::as_str) == Some(t.as_str()))
                        .cloned()
                        .unwrap_or_else(|| output.clone());
                    Artifact::inline(t.clone(), ctx.node.id.clone(), content)
                })
                .collect();
            NodeResult::succeeded(output, artifacts)
                .with_diagnostics(response.diagnostics)
                .into()
        }
    }
}

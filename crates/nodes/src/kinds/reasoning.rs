//! Reasoning-call nodes.

use serde_json::json;
use tracing::{debug, warn};

use pipeline::reasoning::DEFAULT_MAX_TOKENS;
use pipeline::{require_fields, FailureKind, ReasoningError, ReasoningRequest};

use super::{declared_outputs, NodeResult, NodeRun, NodeServices};
use crate::context::NodeContext;
use crate::prompt::{extract_json, render_prompt, render_system};

/// The reasoning configuration of one node.
pub(super) struct Call<'a> {
    pub prompt: &'a str,
    pub system: Option<&'a str>,
    pub required_fields: &'a [String],
    pub max_tokens: Option<u32>,
}

pub(super) async fn execute(ctx: &NodeContext, services: NodeServices<'_>, call: Call<'_>) -> NodeRun {
    let request = ReasoningRequest {
        system: Some(render_system(call.system)),
        prompt: render_prompt(ctx, call.prompt, call.required_fields),
        max_tokens: call.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        trace_id: ctx.trace_id.clone(),
    };

    let response = match services.reasoner.complete(request).await {
        Ok(response) => response,
        Err(ReasoningError::RateLimited { retry_after }) => {
            warn!(node = %ctx.node.id, ?retry_after, "Reasoning provider rate limited; deferring");
            return NodeRun::Deferred { retry_after };
        }
        Err(e) => return NodeResult::failed(FailureKind::ReasoningFailure, e.to_string()).into(),
    };
    debug!(
        node = %ctx.node.id,
        input_tokens = %response.usage.input_tokens,
        output_tokens = %response.usage.output_tokens,
        cost = %response.cost,
        "Reasoning call completed"
    );

    let output = if call.required_fields.is_empty() {
        json!({ "text": response.text })
    } else {
        let Some(value) = extract_json(&response.text) else {
            return NodeResult::failed(
                FailureKind::SchemaValidation,
                "schema violation at '$': reply does not contain a JSON object",
            )
            .with_cost(response.cost)
            .into();
        };
        if let Err(e) = require_fields(&value, call.required_fields) {
            return NodeResult::failed(FailureKind::SchemaValidation, e.to_string())
                .with_cost(response.cost)
                .into();
        }
        value
    };

    let artifacts = declared_outputs(ctx, &output);
    NodeResult::succeeded(output, artifacts)
        .with_cost(response.cost)
        .into()
}

//! Spawn nodes: decompose a work item into dependency-ordered sub-work-items.
//!
//! The plan artefact lists the items to create:
//!
//! ```json
//! { "sub_work_items": [ { "title": "...", "body": "...", "depends_on": [0] } ] }
//! ```
//!
//! `depends_on` holds indices of earlier entries. Titles identify items and
//! must be unique within a plan. Creation is idempotent: an item whose title
//! already exists under the parent is reused, so a spawn interrupted halfway
//! completes on the next trigger without duplicates.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use pipeline::work_item::labels;
use pipeline::{
    Artifact, ArtifactLocation, ArtifactType, FailureKind, NewSubWorkItem, PipelineName,
    SubWorkItemId, SubWorkItemSpec,
};

use super::{NodeResult, NodeRun, NodeServices};
use crate::context::NodeContext;

/// The artefact type a spawn node reads its plan from, when it declares it.
pub const PLAN_ARTIFACT: &str = "plan";

#[derive(Debug, Deserialize)]
struct Plan {
    sub_work_items: Vec<SubWorkItemSpec>,
}

pub(super) async fn execute(
    ctx: &NodeContext,
    services: NodeServices<'_>,
    pipeline: Option<&PipelineName>,
) -> NodeRun {
    let plan = match read_plan(ctx) {
        Ok(plan) => plan,
        Err(message) => return NodeResult::failed(FailureKind::SchemaValidation, message).into(),
    };

    let parent = &ctx.work_item.reference;
    let existing = match services.store.sub_work_items(parent).await {
        Ok(items) => items,
        Err(e) => return NodeResult::failed(FailureKind::SpawnFailure, e.to_string()).into(),
    };
    let by_title: HashMap<&str, SubWorkItemId> =
        existing.iter().map(|s| (s.title.as_str(), s.id)).collect();

    let pipeline = pipeline.unwrap_or(&ctx.pipeline);
    let mut item_labels = vec![labels::RUN.to_string(), labels::pipeline(pipeline)];
    if ctx.work_item.is_safety_critical() {
        item_labels.push(labels::SAFETY_CRITICAL.to_string());
    }

    let mut ids: Vec<SubWorkItemId> = Vec::with_capacity(plan.sub_work_items.len());
    let mut created = 0usize;
    for spec in &plan.sub_work_items {
        if let Some(id) = by_title.get(spec.title.as_str()) {
            debug!(title = %spec.title, id = %id, "Sub-work-item already exists");
            ids.push(*id);
            continue;
        }
        let request = NewSubWorkItem {
            title: spec.title.clone(),
            body: spec.body.clone(),
            depends_on: spec.depends_on.iter().map(|&i| ids[i]).collect(),
            labels: item_labels.clone(),
        };
        match services.store.create_sub_work_item(parent, &request).await {
            Ok(id) => {
                ids.push(id);
                created += 1;
            }
            Err(e) => {
                return NodeResult::failed(
                    FailureKind::SpawnFailure,
                    format!("creating sub-work-item '{}' failed: {e}", spec.title),
                )
                .into()
            }
        }
    }
    info!(parent = %parent, created, total = ids.len(), "Spawned sub-work-items");

    let items: Vec<Value> = plan
        .sub_work_items
        .iter()
        .zip(&ids)
        .map(|(spec, id)| json!({ "id": id, "title": spec.title }))
        .collect();
    let output = json!({ "sub_work_items": items, "created": created });
    let artifacts = ctx
        .node
        .outputs
        .iter()
        .map(|t| Artifact {
            artifact_type: t.clone(),
            producer: ctx.node.id.clone(),
            location: ArtifactLocation::SubWorkItems { ids: ids.clone() },
            content: output.clone(),
        })
        .collect();
    NodeResult::succeeded(output, artifacts).into()
}

/// Finds and checks the plan among the node's inputs.
fn read_plan(ctx: &NodeContext) -> Result<Plan, String> {
    let value = ArtifactType::new(PLAN_ARTIFACT)
        .and_then(|t| ctx.inputs.get(&t))
        .or_else(|| ctx.inputs.values().find(|v| v.get("sub_work_items").is_some()))
        .ok_or_else(|| "schema violation at '$': no input carries a sub_work_items plan".to_string())?;

    let plan: Plan = serde_json::from_value(value.clone())
        .map_err(|e| format!("schema violation at '$.sub_work_items': {e}"))?;
    let mut titles = HashSet::new();
    for (i, spec) in plan.sub_work_items.iter().enumerate() {
        if spec.title.trim().is_empty() {
            return Err(format!("schema violation at '$.sub_work_items[{i}].title': title is empty"));
        }
        if !titles.insert(spec.title.as_str()) {
            return Err(format!(
                "schema violation at '$.sub_work_items[{i}].title': '{}' appears twice",
                spec.title
            ));
        }
        if let Some(bad) = spec.depends_on.iter().find(|&&d| d >= i) {
            return Err(format!(
                "schema violation at '$.sub_work_items[{i}].depends_on': {bad} is not an earlier entry"
            ));
        }
    }
    Ok(plan)
}

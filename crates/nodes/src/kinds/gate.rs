//! Gate nodes: checkpoints with no work of their own.

use super::{declared_outputs, NodeResult};
use crate::context::NodeContext;

/// Passes the node's inputs through to its declared outputs. Whether the
/// run waits for a human is decided by the node's gate mode, not here.
pub(super) fn execute(ctx: &NodeContext) -> NodeResult {
    let inputs = ctx.inputs_value();
    let artifacts = declared_outputs(ctx, &inputs);
    NodeResult::succeeded(inputs, artifacts)
}

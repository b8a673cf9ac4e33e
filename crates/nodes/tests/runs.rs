//! Locking, fan-in, deferral, predicates, decomposition and timeouts.

mod common;

use std::time::Duration;

use common::{ids, Harness};
use pipeline::testing::{reply, sample_ref, ScriptedReasoner};
use pipeline::work_item::labels;
use pipeline::{
    Clock, EscalationReason, InvocationId, LockMarker, ReasoningError, RunRecord, RunState,
    StepResult, SubWorkItemId,
};

const FAN_IN: &str = r#"
version = 1
default_pipeline = "diamond"

[[pipelines]]
name = "diamond"

[[pipelines.nodes]]
id = "a"
kind = "gate"
outputs = ["design"]

[[pipelines.nodes]]
id = "b"
kind = "tool_execution"
domain = "rust"
operation = "lint"
inputs = ["design"]
outputs = ["lint"]

[[pipelines.nodes]]
id = "c"
kind = "tool_execution"
domain = "rust"
operation = "build"
inputs = ["design"]
outputs = ["build"]

[[pipelines.nodes]]
id = "d"
kind = "gate"
inputs = ["lint", "build"]

[[pipelines.edges]]
id = "a-b"
from = "a"
to = "b"

[[pipelines.edges]]
id = "a-c"
from = "a"
to = "c"

[[pipelines.edges]]
id = "b-d"
from = "b"
to = "d"

[[pipelines.edges]]
id = "c-d"
from = "c"
to = "d"
"#;

#[tokio::test]
async fn fan_in_waits_for_both_branches_and_records_in_graph_order() {
    let h = Harness::new(FAN_IN);
    h.domains.delay("rust", "lint", Duration::from_millis(50));

    assert_eq!(
        h.advance().await,
        StepResult::Advanced {
            executed: ids(&["a", "b", "c", "d"]),
            complete: true
        }
    );
    // b finishes after c but is recorded first.
    assert_eq!(h.completed_nodes(), vec!["a", "b", "c", "d"]);
    assert!(!h.labels().contains(&labels::PROCESSING.to_string()));
}

#[tokio::test]
async fn reconstruction_is_deterministic() {
    let h = Harness::new(FAN_IN);
    h.advance().await;

    let item = h.store.item(&h.item()).unwrap();
    let comments = pipeline::ArtifactStore::comments(h.store.as_ref(), &h.item())
        .await
        .unwrap();
    let first = RunState::reconstruct(item.clone(), &comments);
    let second = RunState::reconstruct(item, &comments);
    assert_eq!(first.status(), second.status());
    assert_eq!(first.artifacts(), second.artifacts());
    assert_eq!(first.accumulated_cost(), second.accumulated_cost());
}

#[tokio::test]
async fn fresh_lock_makes_the_invocation_busy() {
    let h = Harness::new(FAN_IN);
    let acquired_at = h.clock.now();
    h.store.force_lock(
        &h.item(),
        Some(LockMarker {
            holder: InvocationId::new_random(),
            acquired_at,
        }),
    );

    let result = h.advance().await;
    assert_eq!(result, StepResult::Busy { held_since: acquired_at });
    assert_eq!(result.exit_code(), 11);
    assert_eq!(h.store.comment_count(&h.item()), 0);

    // After the timeout the marker is stale and is overridden.
    h.clock.advance(Duration::from_secs(31 * 60));
    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert!(!h.labels().contains(&labels::PROCESSING.to_string()));
}

#[tokio::test]
async fn concurrent_invocations_never_both_execute() {
    let h = Harness::new(FAN_IN);
    h.domains.delay("rust", "lint", Duration::from_millis(100));

    let (first, second) = tokio::join!(h.advance(), h.advance());
    let busy = [&first, &second]
        .iter()
        .filter(|r| matches!(r, StepResult::Busy { .. }))
        .count();
    assert_eq!(busy, 1);
    assert_eq!(h.completed_nodes(), vec!["a", "b", "c", "d"]);
    assert_eq!(h.domains.invocations().len(), 2);
}

#[tokio::test]
async fn rate_limited_reasoning_defers_without_recording() {
    let config = r#"
version = 1
default_pipeline = "p"

[[pipelines]]
name = "p"

[[pipelines.nodes]]
id = "summarise"
kind = "reasoning_call"
prompt = "Summarise the work item."
"#;
    let h = Harness::new(config);
    h.reasoner.on(
        "Summarise",
        Err(ReasoningError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }),
    );

    let result = h.advance().await;
    assert_eq!(
        result,
        StepResult::Deferred {
            retry_after: Some(Duration::from_secs(30))
        }
    );
    assert_eq!(result.exit_code(), 12);
    assert!(h.completed_nodes().is_empty());
    assert!(!h.labels().contains(&labels::PROCESSING.to_string()));

    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert_eq!(h.completed_nodes(), vec!["summarise"]);
}

#[tokio::test]
async fn spawned_items_run_once_their_dependencies_close() {
    let config = r#"
version = 1
default_pipeline = "epic"

[[pipelines]]
name = "epic"

[[pipelines.nodes]]
id = "plan"
kind = "reasoning_call"
prompt = "Break the work item into steps."
required_fields = ["sub_work_items"]
outputs = ["plan"]

[[pipelines.nodes]]
id = "split"
kind = "spawn"
pipeline = "leaf"
inputs = ["plan"]

[[pipelines.edges]]
id = "plan-split"
from = "plan"
to = "split"

[[pipelines]]
name = "leaf"

[[pipelines.nodes]]
id = "do"
kind = "gate"
"#;
    let plan = r#"{"sub_work_items": [
        {"title": "Add the spindle", "body": "First."},
        {"title": "Wire the motor", "body": "Second.", "depends_on": [0]}
    ]}"#;
    let h = Harness::with_reasoner(config, ScriptedReasoner::new());
    h.reasoner.on("Break the work item", Ok(reply(plan, 0.2)));

    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));

    let first = sample_ref(1000);
    let second = sample_ref(1001);
    let child = h.store.item(&second).unwrap();
    assert!(child.has_label("cogworks:pipeline:leaf"));
    assert_eq!(
        h.advance_ref(&second).await,
        StepResult::Blocked {
            waiting_on: vec![SubWorkItemId::new(1000)]
        }
    );
    assert_eq!(h.store.comment_count(&second), 0);

    assert!(matches!(h.advance_ref(&first).await, StepResult::Advanced { complete: true, .. }));
    h.store.close(&first);
    assert!(matches!(h.advance_ref(&second).await, StepResult::Advanced { complete: true, .. }));

    // Re-running the parent does not spawn duplicates.
    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert!(h.store.item(&sample_ref(1002)).is_none());
}

#[tokio::test]
async fn slow_nodes_fail_with_a_timeout() {
    let config = r#"
version = 1
default_pipeline = "p"

[[pipelines]]
name = "p"

[[pipelines.nodes]]
id = "slow"
kind = "tool_execution"
domain = "rust"
operation = "test"
timeout_secs = 1
"#;
    let h = Harness::new(config);
    h.domains.delay("rust", "test", Duration::from_secs(3));

    let result = h.advance().await;
    assert_eq!(result, StepResult::Failed { nodes: ids(&["slow"]) });
    assert_eq!(result.exit_code(), 1);
    assert!(h.labels().contains(&labels::FAILED.to_string()));
    let timed_out = h.records().iter().any(|r| {
        matches!(r, RunRecord::NodeCompleted(c)
            if c.failure.as_ref().is_some_and(|f| f.kind == pipeline::FailureKind::Timeout))
    });
    assert!(timed_out);
}

#[tokio::test]
async fn classification_output_labels_the_work_item() {
    let config = r#"
version = 1
default_pipeline = "triage"

[[pipelines]]
name = "triage"

[[pipelines.nodes]]
id = "classify"
kind = "reasoning_call"
prompt = "Classify the work item."
required_fields = ["classification"]
"#;
    let h = Harness::new(config);
    h.reasoner.on("Classify", Ok(reply(r#"{"classification": "bug"}"#, 0.01)));

    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert!(h.labels().contains(&labels::classification("bug")));
}

const SOUND: &str = "Is the plan sound?";
const SMALL: &str = "Is the plan small?";

/// `plan` feeds `build` through an edge guarded by `condition`.
fn predicate_config(settings: &str, condition: &str) -> String {
    format!(
        r#"
version = 1
default_pipeline = "p"

[settings]
{settings}

[[pipelines]]
name = "p"

[[pipelines.nodes]]
id = "plan"
kind = "reasoning_call"
prompt = "Write a plan for the spindle."
outputs = ["plan"]

[[pipelines.nodes]]
id = "build"
kind = "gate"
inputs = ["plan"]

[[pipelines.edges]]
id = "plan-build"
from = "plan"
to = "build"
condition = {condition}
"#
    )
}

fn asked(h: &Harness, question: &str) -> usize {
    h.reasoner
        .calls()
        .iter()
        .filter(|r| r.prompt.contains(question))
        .count()
}

fn predicate_answers(h: &Harness) -> Vec<bool> {
    h.records()
        .iter()
        .filter_map(|r| match r {
            RunRecord::PredicateAnswered { value, .. } => Some(*value),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn answered_predicates_are_recorded_and_never_asked_again() {
    let condition = format!(r#"{{ all = [{{ predicate = "{SOUND}" }}, {{ predicate = "{SMALL}" }}] }}"#);
    let h = Harness::new(&predicate_config("", &condition));
    h.reasoner.on(SOUND, Ok(reply("Yes.", 0.01)));
    h.reasoner
        .on(SMALL, Err(ReasoningError::RateLimited { retry_after: None }))
        .on(SMALL, Ok(reply("yes", 0.01)));

    assert_eq!(h.advance().await, StepResult::Deferred { retry_after: None });
    assert_eq!(predicate_answers(&h), vec![true]);

    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert_eq!(predicate_answers(&h), vec![true, true]);
    assert_eq!(asked(&h, SOUND), 1);
    assert_eq!(asked(&h, SMALL), 2);
    assert_eq!(h.completed_nodes(), vec!["plan", "build"]);
}

#[tokio::test]
async fn unclear_or_invalid_answers_count_as_no() {
    let condition = format!(r#"{{ any = [{{ predicate = "{SOUND}" }}, {{ predicate = "{SMALL}" }}] }}"#);
    let h = Harness::new(&predicate_config("", &condition));
    h.reasoner.on(SOUND, Ok(reply("It depends on the motor.", 0.0)));
    h.reasoner.on(SMALL, Err(ReasoningError::InvalidOutput("empty response".into())));

    assert!(matches!(h.advance().await, StepResult::Advanced { complete: true, .. }));
    assert_eq!(predicate_answers(&h), vec![false, false]);
    assert_eq!(h.completed_nodes(), vec!["plan"]);
    assert!(h.records().iter().any(|r| matches!(r, RunRecord::EdgeResolved { fired: false, .. })));
}

#[tokio::test]
async fn predicate_cost_counts_toward_the_ceiling() {
    let condition = format!(r#"{{ predicate = "{SOUND}" }}"#);
    let h = Harness::new(&predicate_config("cost_ceiling_usd = 1.0", &condition));
    h.reasoner.on("Write a plan", Ok(reply("{}", 0.4)));
    h.reasoner.on(SOUND, Ok(reply("yes", 0.7)));

    let result = h.advance().await;
    assert!(matches!(
        result,
        StepResult::BudgetExhausted {
            reason: EscalationReason::BudgetExceeded { .. }
        }
    ));
    assert_eq!(h.completed_nodes(), vec!["plan"]);

    let item = h.store.item(&h.item()).unwrap();
    let comments = pipeline::ArtifactStore::comments(h.store.as_ref(), &h.item())
        .await
        .unwrap();
    let state = RunState::reconstruct(item, &comments);
    assert!((state.accumulated_cost().as_f64() - 1.1).abs() < 1e-9);
}

#[tokio::test]
async fn failing_predicates_escalate_at_the_retry_limit() {
    let condition = format!(r#"{{ predicate = "{SOUND}" }}"#);
    let h = Harness::new(&predicate_config("max_retries = 2", &condition));
    for _ in 0..5 {
        h.reasoner
            .on(SOUND, Err(ReasoningError::Provider("401 invalid x-api-key".into())));
    }

    assert_eq!(h.advance().await, StepResult::Deferred { retry_after: None });
    assert_eq!(h.advance().await, StepResult::Deferred { retry_after: None });
    let result = h.advance().await;
    assert_eq!(
        result,
        StepResult::Escalated {
            reason: EscalationReason::RetryLimitExceeded { retries: 2, limit: 2 }
        }
    );
    assert_eq!(result.exit_code(), 2);
    assert!(h.labels().contains(&labels::ESCALATED.to_string()));

    let failures = h
        .records()
        .iter()
        .filter(|r| matches!(r, RunRecord::PredicateFailed { .. }))
        .count();
    assert_eq!(failures, 2);

    // Settled: later triggers do not call the provider again.
    for _ in 0..5 {
        assert!(matches!(h.advance().await, StepResult::Escalated { .. }));
    }
    assert_eq!(asked(&h, SOUND), 3);
}

//! The step function.
//!
//! [`PipelineExecutor::advance`] is one invocation of the engine for one
//! work item. It reconstructs the run from the store, takes the processing
//! lock, runs waves of ready nodes until no further progress is possible
//! without an external signal, records every result, and releases the lock
//! on every exit path.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use pipeline::graph::{ready_nodes, Evaluation};
use pipeline::lock::LockOutcome;
use pipeline::reasoning::parse_yes_no;
use pipeline::record::FinishedStatus;
use pipeline::work_item::labels;
use pipeline::{
    ArtifactStore, BudgetTracker, Clock, CogWorksError, DomainServiceClient, Edge,
    EscalationReason, FailureKind, GateMode, GateStatus, InvocationId, LockManager, LockMarker,
    NodeCompletion, NodeId, NodeOutcome, PipelineConfig, PipelineGraph, PipelineRunId,
    ReasoningError, ReasoningProvider, ReasoningRequest, RepositoryContext, RunRecord, RunState,
    RunStatus, StepResult, SubWorkItemId, SystemClock, TokenCost, WorkItemRef,
};

use crate::context::NodeContext;
use crate::gateway::DomainGateway;
use crate::kinds::{self, NodeResult, NodeRun, NodeServices};
use crate::prompt::{render_predicate, render_system};

/// Output token limit for edge predicates; the answer is one word.
const PREDICATE_MAX_TOKENS: u32 = 16;

/// Drives pipeline runs, one invocation at a time.
pub struct PipelineExecutor {
    store: Arc<dyn ArtifactStore>,
    reasoner: Arc<dyn ReasoningProvider>,
    domains: Arc<dyn DomainServiceClient>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    repository: RepositoryContext,
}

/// How a cascade of waves ended.
enum Cascade {
    /// Nothing is ready any more.
    Idle { executed: Vec<NodeId> },
    /// Something stopped progress before the frontier emptied.
    Stopped(StepResult),
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        reasoner: Arc<dyn ReasoningProvider>,
        domains: Arc<dyn DomainServiceClient>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            reasoner,
            domains,
            config,
            clock: Arc::new(SystemClock),
            repository: RepositoryContext {
                path: ".".to_string(),
                git_ref: "HEAD".to_string(),
            },
        }
    }

    /// Replaces the wall clock (lock staleness and record timestamps).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the checkout domain services operate on.
    pub fn with_repository(mut self, repository: RepositoryContext) -> Self {
        self.repository = repository;
        self
    }

    fn lock_manager(&self) -> LockManager {
        LockManager::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.settings.lock_timeout(),
        )
    }

    /// Runs one invocation for `item`.
    ///
    /// Node failures, gates, escalations and lock contention are results,
    /// not errors. An error means the invocation could not determine the
    /// state of the run at all (store unreachable, invalid configuration).
    pub async fn advance(&self, item: &WorkItemRef) -> Result<StepResult, CogWorksError> {
        let invocation = InvocationId::new_random();
        let span = info_span!("advance", work_item = %item, invocation = %invocation);
        async move {
            let result = self.advance_inner(item, invocation).await;
            match &result {
                Ok(step) => info!(result = step.label(), "{step}"),
                Err(e) => warn!(error = %e, "Invocation aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn advance_inner(
        &self,
        item: &WorkItemRef,
        invocation: InvocationId,
    ) -> Result<StepResult, CogWorksError> {
        let work_item = self.store.work_item(item).await?;
        if !work_item.is_triggered() {
            debug!("Work item does not carry the trigger label");
            return Ok(StepResult::NotTriggered);
        }

        if let Some(link) = &work_item.sub_work_item {
            let waiting_on = self.open_dependencies(item, &link.depends_on).await?;
            if !waiting_on.is_empty() {
                return Ok(StepResult::Blocked { waiting_on });
            }
        }

        // Settled runs are answered without touching the lock.
        let comments = self.store.comments(item).await?;
        let state = RunState::reconstruct(work_item, &comments);
        if let Some(result) = settled_result(&state) {
            debug!("Run is settled; nothing to do");
            return Ok(result);
        }

        let locks = self.lock_manager();
        let marker = match locks.try_acquire(item, invocation).await? {
            LockOutcome::AlreadyHeld { since } => {
                return Ok(StepResult::Busy { held_since: since })
            }
            outcome => match outcome.marker() {
                Some(marker) => marker.clone(),
                None => return Ok(StepResult::Busy { held_since: self.clock.now() }),
            },
        };

        let result = self.run_locked(item, &locks, &marker).await;

        if let Err(e) = locks.release(item, &marker).await {
            warn!(error = %e, "Failed to release processing lock; it will go stale");
        }
        result
    }

    /// Sibling sub-work-items among `depends_on` that are still open.
    async fn open_dependencies(
        &self,
        item: &WorkItemRef,
        depends_on: &[SubWorkItemId],
    ) -> Result<Vec<SubWorkItemId>, CogWorksError> {
        let mut open = Vec::new();
        for id in depends_on {
            let dependency = self.store.work_item(&item.sibling(*id)).await?;
            if !dependency.closed {
                open.push(*id);
            }
        }
        Ok(open)
    }

    async fn run_locked(
        &self,
        item: &WorkItemRef,
        locks: &LockManager,
        marker: &LockMarker,
    ) -> Result<StepResult, CogWorksError> {
        // Re-read under the lock: another invocation may have finished a
        // wave between our first read and the acquisition.
        let work_item = self.store.work_item(item).await?;
        let comments = self.store.comments(item).await?;
        let mut state = RunState::reconstruct(work_item, &comments);
        if let Some(result) = settled_result(&state) {
            return Ok(result);
        }

        if state.graph().is_none() && state.escalation().is_none() {
            self.start_run(item, &mut state).await?;
        }

        let result = match self.cascade(item, locks, marker, &mut state).await? {
            Cascade::Idle { executed } => self.final_result(item, &mut state, executed).await?,
            Cascade::Stopped(result) => result,
        };
        self.sync_labels(item, &state, &result).await?;
        Ok(result)
    }

    async fn start_run(&self, item: &WorkItemRef, state: &mut RunState) -> Result<(), CogWorksError> {
        let definition = self.config.select(state.work_item())?.clone();
        // Validated at load; re-checked so a bad definition is never recorded.
        PipelineGraph::new(definition.clone())?;
        let run_id = PipelineRunId::new_random();
        info!(run_id = %run_id, pipeline = %definition.name, "Starting pipeline run");
        self.record(
            item,
            state,
            RunRecord::RunStarted {
                run_id,
                definition,
                started_at: self.clock.now(),
            },
        )
        .await
    }

    /// Runs waves until nothing is ready. Returns the nodes executed, or the
    /// result that stopped the cascade early.
    async fn cascade(
        &self,
        item: &WorkItemRef,
        locks: &LockManager,
        marker: &LockMarker,
        state: &mut RunState,
    ) -> Result<Cascade, CogWorksError> {
        if let Some(reason) = state.escalation() {
            return Ok(Cascade::Stopped(escalation_result(reason.clone())));
        }
        let Some(graph) = state.graph().cloned() else {
            return Ok(Cascade::Idle { executed: Vec::new() });
        };

        let settings = &self.config.settings;
        let mut budget =
            BudgetTracker::from_state(state, settings.cost_budget()?, settings.max_retries);
        let gateway = DomainGateway::new(self.domains.clone());
        let parallelism = graph
            .definition()
            .max_parallelism
            .unwrap_or(settings.max_parallelism)
            .max(1);
        let cap = graph.execution_cap();
        let trace_id = state
            .run_id()
            .map_or_else(|| item.to_string(), |id| id.to_string());
        let mut executed: Vec<NodeId> = Vec::new();

        loop {
            if !locks.is_held(item, marker).await? {
                warn!("Processing lock was taken over; stopping");
                let since = self
                    .store
                    .read_lock(item)
                    .await?
                    .map_or_else(|| self.clock.now(), |m| m.acquired_at);
                return Ok(Cascade::Stopped(StepResult::Busy { held_since: since }));
            }

            if let Some(stop) = self.resolve_edges(item, state, &graph, &mut budget).await? {
                return Ok(Cascade::Stopped(stop));
            }

            let ready = ready_nodes(&graph, state);
            if ready.is_empty() {
                return Ok(Cascade::Idle { executed });
            }
            if budget.is_exhausted() {
                let reason = EscalationReason::BudgetExceeded {
                    accumulated: budget.accumulated(),
                    limit: budget.limit(),
                };
                return Ok(Cascade::Stopped(self.escalate(item, state, reason).await?));
            }
            if executed.len() >= cap {
                let reason = EscalationReason::ExecutionCapReached {
                    executions: executed.len(),
                };
                return Ok(Cascade::Stopped(self.escalate(item, state, reason).await?));
            }

            // Reserve in declaration order; nodes that do not fit wait for a
            // later wave. A wave that cannot start a single node escalates.
            let mut batch = Vec::new();
            for id in ready.into_iter().take(cap - executed.len()) {
                let Some(node) = graph.node(&id) else { continue };
                let estimate = node.estimated_cost.unwrap_or_else(TokenCost::zero);
                match budget.check_and_reserve(&id, estimate) {
                    Ok(reservation) => batch.push((node.clone(), reservation)),
                    Err(CogWorksError::BudgetExceeded { accumulated, limit }) if batch.is_empty() => {
                        let reason = EscalationReason::BudgetExceeded { accumulated, limit };
                        return Ok(Cascade::Stopped(self.escalate(item, state, reason).await?));
                    }
                    Err(e) => {
                        debug!(node = %id, error = %e, "Postponing node to a later wave");
                    }
                }
            }

            let default_timeout = settings.node_timeout();
            let jobs: Vec<_> = batch
                .into_iter()
                .map(|(node, reservation)| {
                    let ctx = NodeContext::build(&graph, state, &node, &self.repository, &trace_id, default_timeout);
                    (node, reservation, ctx)
                })
                .collect();

            let mut results: Vec<_> = stream::iter(jobs)
                .map(|(node, reservation, ctx)| {
                    let gateway = &gateway;
                    async move {
                        let run = match &ctx {
                            Ok(ctx) => self.execute_node(ctx, gateway).await,
                            Err(missing) => {
                                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                                NodeResult::failed(
                                    FailureKind::MissingInput,
                                    format!("input artifacts unavailable: {}", names.join(", ")),
                                )
                                .into()
                            }
                        };
                        let attempt = ctx.as_ref().map_or(1, |c| c.attempt);
                        (node, reservation, attempt, run)
                    }
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;

            // Record in graph order so history does not depend on which
            // sibling finished first.
            results.sort_by_key(|(node, ..)| graph.position(&node.id));

            let mut deferred: Option<Option<Duration>> = None;
            for (node, reservation, attempt, run) in results {
                match run {
                    NodeRun::Finished(result) => {
                        budget.record_actual(reservation, result.cost);
                        let gate = match (result.outcome, node.effective_gate(state.work_item().is_safety_critical())) {
                            (NodeOutcome::Succeeded, GateMode::Human) => GateStatus::AwaitingApproval,
                            _ => GateStatus::Passed,
                        };
                        info!(
                            node = %node.id,
                            outcome = result.outcome.as_str(),
                            cost = %result.cost,
                            attempt,
                            awaiting_approval = gate == GateStatus::AwaitingApproval,
                            "Node finished"
                        );
                        let completion = NodeCompletion {
                            node: node.id.clone(),
                            attempt,
                            outcome: result.outcome,
                            output: result.output,
                            artifacts: result.artifacts,
                            cost: result.cost,
                            diagnostics: result.diagnostics,
                            failure: result.failure,
                            gate,
                            completed_at: self.clock.now(),
                        };
                        self.record(item, state, RunRecord::NodeCompleted(completion)).await?;
                        executed.push(node.id);
                    }
                    NodeRun::Deferred { retry_after } => {
                        budget.record_actual(reservation, TokenCost::zero());
                        deferred = Some(match deferred.flatten() {
                            Some(current) => Some(retry_after.map_or(current, |r| r.max(current))),
                            None => retry_after,
                        });
                    }
                }
            }
            if let Some(retry_after) = deferred {
                return Ok(Cascade::Stopped(StepResult::Deferred { retry_after }));
            }
        }
    }

    async fn execute_node(&self, ctx: &NodeContext, gateway: &DomainGateway) -> NodeRun {
        let services = NodeServices {
            reasoner: self.reasoner.as_ref(),
            domains: gateway,
            store: self.store.as_ref(),
        };
        let span = info_span!("node", node = %ctx.node.id, kind = %ctx.node.kind(), attempt = ctx.attempt);
        match tokio::time::timeout(ctx.timeout, kinds::execute(ctx, services))
            .instrument(span)
            .await
        {
            Ok(run) => run,
            Err(_) => {
                warn!(node = %ctx.node.id, timeout = ?ctx.timeout, "Node timed out");
                NodeResult::failed(
                    FailureKind::Timeout,
                    format!("node did not finish within {:?}", ctx.timeout),
                )
                .into()
            }
        }
    }

    /// Resolves every pending edge of settled nodes, answering reasoning
    /// predicates as they come up.
    async fn resolve_edges(
        &self,
        item: &WorkItemRef,
        state: &mut RunState,
        graph: &PipelineGraph,
        budget: &mut BudgetTracker,
    ) -> Result<Option<StepResult>, CogWorksError> {
        loop {
            let Some(edge) = state.unresolved_edges().first().map(|e| (*e).clone()) else {
                return Ok(None);
            };
            match state.evaluate_edge(&edge) {
                Evaluation::Decided(fired) => {
                    if fired && edge.rework {
                        if let Some(stop) = self.check_rework(item, state, &edge, budget).await? {
                            return Ok(Some(stop));
                        }
                        budget.record_retry();
                        info!(edge = %edge.id, from = %edge.from, to = %edge.to, "Rework edge fired");
                    }
                    self.record(item, state, RunRecord::EdgeResolved { edge: edge.id.clone(), fired })
                        .await?;
                }
                Evaluation::NeedsPredicate { index, prompt } => {
                    let prompt = prompt.to_string();
                    match self.ask_predicate(state, graph, &edge, &prompt).await {
                        Ok((value, cost)) => {
                            budget.record_unreserved(cost);
                            self.record(
                                item,
                                state,
                                RunRecord::PredicateAnswered {
                                    edge: edge.id.clone(),
                                    index,
                                    value,
                                    cost,
                                },
                            )
                            .await?;
                        }
                        Err(ReasoningError::RateLimited { retry_after }) => {
                            warn!(edge = %edge.id, "Predicate rate limited; deferring");
                            return Ok(Some(StepResult::Deferred { retry_after }));
                        }
                        Err(ReasoningError::InvalidOutput(message)) => {
                            warn!(edge = %edge.id, error = %message, "Predicate answer unusable; treating as no");
                            self.record(
                                item,
                                state,
                                RunRecord::PredicateAnswered {
                                    edge: edge.id.clone(),
                                    index,
                                    value: false,
                                    cost: TokenCost::zero(),
                                },
                            )
                            .await?;
                        }
                        Err(e) => {
                            // Provider faults and timeouts are retried on later
                            // invocations, each one counted against the run.
                            if let Err(CogWorksError::RetryLimitExceeded { retries, limit }) =
                                budget.check_retry(&edge.to)
                            {
                                let reason = EscalationReason::RetryLimitExceeded { retries, limit };
                                return Ok(Some(self.escalate(item, state, reason).await?));
                            }
                            warn!(edge = %edge.id, error = %e, "Predicate evaluation failed; deferring");
                            self.record(
                                item,
                                state,
                                RunRecord::PredicateFailed {
                                    edge: edge.id.clone(),
                                    index,
                                    message: e.to_string(),
                                },
                            )
                            .await?;
                            budget.record_retry();
                            return Ok(Some(StepResult::Deferred { retry_after: None }));
                        }
                    }
                }
            }
        }
    }

    /// Escalates instead of firing a rework edge past its bounds.
    async fn check_rework(
        &self,
        item: &WorkItemRef,
        state: &mut RunState,
        edge: &Edge,
        budget: &BudgetTracker,
    ) -> Result<Option<StepResult>, CogWorksError> {
        let traversals = state.traversals(&edge.id);
        if traversals >= edge.traversal_limit() {
            let reason = EscalationReason::ReworkExhausted {
                edge: edge.id.clone(),
                traversals,
            };
            return Ok(Some(self.escalate(item, state, reason).await?));
        }
        if let Err(CogWorksError::RetryLimitExceeded { retries, limit }) = budget.check_retry(&edge.to) {
            let reason = EscalationReason::RetryLimitExceeded { retries, limit };
            return Ok(Some(self.escalate(item, state, reason).await?));
        }
        Ok(None)
    }

    async fn ask_predicate(
        &self,
        state: &RunState,
        graph: &PipelineGraph,
        edge: &Edge,
        question: &str,
    ) -> Result<(bool, TokenCost), ReasoningError> {
        let source = state.completion(&edge.from);
        let output = source.map(|c| c.output.clone()).unwrap_or_default();
        let artifacts: Vec<(String, serde_json::Value)> = source
            .map(|c| {
                c.artifacts
                    .iter()
                    .map(|a| (a.artifact_type.to_string(), a.content.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let request = ReasoningRequest {
            system: Some(render_system(None)),
            prompt: render_predicate(question, &output, &artifacts),
            max_tokens: PREDICATE_MAX_TOKENS,
            trace_id: format!("{}:{}", graph.name(), edge.id),
        };
        let response = self.reasoner.complete(request).await?;
        let value = parse_yes_no(&response.text).unwrap_or_else(|| {
            warn!(edge = %edge.id, "Predicate answer was neither yes nor no; treating as no");
            false
        });
        debug!(edge = %edge.id, value, cost = %response.cost, "Predicate answered");
        Ok((value, response.cost))
    }

    async fn escalate(
        &self,
        item: &WorkItemRef,
        state: &mut RunState,
        reason: EscalationReason,
    ) -> Result<StepResult, CogWorksError> {
        warn!(reason = %reason, "Escalating run");
        self.record(
            item,
            state,
            RunRecord::Escalated {
                reason: reason.clone(),
                at: self.clock.now(),
            },
        )
        .await?;
        Ok(escalation_result(reason))
    }

    /// Maps the run status after a completed cascade to a result, writing
    /// the terminal record when the run just finished.
    async fn final_result(
        &self,
        item: &WorkItemRef,
        state: &mut RunState,
        executed: Vec<NodeId>,
    ) -> Result<StepResult, CogWorksError> {
        match state.status() {
            RunStatus::Gated(awaiting) => Ok(StepResult::Gated { awaiting }),
            RunStatus::Escalated(reason) => Ok(escalation_result(reason)),
            RunStatus::Failed(nodes) => {
                if state.finished().is_none() {
                    self.record(item, state, RunRecord::RunFinished { status: FinishedStatus::Failed })
                        .await?;
                }
                Ok(StepResult::Failed { nodes })
            }
            RunStatus::Complete => {
                if state.finished().is_none() {
                    self.record(item, state, RunRecord::RunFinished { status: FinishedStatus::Completed })
                        .await?;
                }
                Ok(StepResult::Advanced {
                    executed,
                    complete: true,
                })
            }
            RunStatus::Runnable | RunStatus::NotStarted => Ok(StepResult::Advanced {
                executed,
                complete: false,
            }),
        }
    }

    /// Mirrors the run status onto informational labels.
    async fn sync_labels(
        &self,
        item: &WorkItemRef,
        state: &RunState,
        result: &StepResult,
    ) -> Result<(), CogWorksError> {
        let wanted = [
            (labels::AWAITING_APPROVAL, matches!(result, StepResult::Gated { .. })),
            (labels::ESCALATED, state.escalation().is_some()),
            (labels::COMPLETE, state.finished() == Some(FinishedStatus::Completed)),
            (labels::FAILED, state.finished() == Some(FinishedStatus::Failed)),
        ];
        let current = state.work_item();
        for (label, on) in wanted {
            if on && !current.has_label(label) {
                self.store.add_label(item, label).await?;
            } else if !on && current.has_label(label) {
                self.store.remove_label(item, label).await?;
            }
        }
        if let Some(class) = state.classification() {
            let label = labels::classification(class);
            if !current.has_label(&label) {
                self.store.add_label(item, &label).await?;
            }
        }
        Ok(())
    }

    /// Appends `record` to the store, then applies it to `state`.
    async fn record(
        &self,
        item: &WorkItemRef,
        state: &mut RunState,
        record: RunRecord,
    ) -> Result<(), CogWorksError> {
        let body = record.to_comment()?;
        self.store.append_comment(item, &body).await?;
        debug!(record = %record.summary(), "Recorded");
        state.apply_record(&record);
        Ok(())
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

/// The result for a run that needs no lock: waiting on a human, escalated,
/// or finished with its terminal record written.
fn settled_result(state: &RunState) -> Option<StepResult> {
    match state.status() {
        RunStatus::Escalated(reason) => Some(escalation_result(reason)),
        RunStatus::Gated(awaiting) => Some(StepResult::Gated { awaiting }),
        RunStatus::Complete if state.finished().is_some() => Some(StepResult::Advanced {
            executed: Vec::new(),
            complete: true,
        }),
        RunStatus::Failed(nodes) if state.finished().is_some() => Some(StepResult::Failed { nodes }),
        _ => None,
    }
}

fn escalation_result(reason: EscalationReason) -> StepResult {
    match reason {
        EscalationReason::BudgetExceeded { .. } => StepResult::BudgetExhausted { reason },
        reason => StepResult::Escalated { reason },
    }
}

//! In-memory implementations of the ports, for tests.
//!
//! These doubles behave like the real adapters where it matters to the
//! engine: the artefact store keeps comments in order, distinguishes engine
//! and human authors, and implements the lock compare-and-swap atomically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::extension::{
    DomainServiceClient, DomainServiceError, ExtensionRequest, ExtensionResponse, HealthStatus,
    RepositoryContext, ResponseStatus,
};
use crate::lock::{Clock, LockMarker};
use crate::reasoning::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse};
use crate::record::{CommentEntry, FailureKind, GateStatus, NodeCompletion, NodeFailure, NodeOutcome, RunRecord};
use crate::work_item::labels;
use crate::{
    ApiVersion, ArtifactStore, CommentId, Diagnostic, DomainServiceName, NewSubWorkItem, NodeId,
    RepositoryId, StoreError, StoredComment, SubWorkItem, SubWorkItemId, SubWorkItemLink,
    Timestamp, TokenCost, WorkItem, WorkItemId, WorkItemRef,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Repository used by [`sample_work_item`].
pub const SAMPLE_REPOSITORY: &str = "octo/widgets";

/// A triggered work item `octo/widgets#number`.
pub fn sample_work_item(number: u64) -> WorkItem {
    WorkItem {
        reference: sample_ref(number),
        title: format!("Work item {number}"),
        body: "Make the widget spin.".to_string(),
        labels: vec![labels::RUN.to_string()],
        closed: false,
        sub_work_item: None,
    }
}

/// Reference to `octo/widgets#number`.
pub fn sample_ref(number: u64) -> WorkItemRef {
    WorkItemRef::new(
        RepositoryId::new(SAMPLE_REPOSITORY).unwrap_or_else(|| unreachable!()),
        WorkItemId::new(number),
    )
}

/// A successful, auto-gated completion with the given cost.
pub fn completion(node: &str, attempt: u32, cost: f64) -> NodeCompletion {
    NodeCompletion {
        node: NodeId::new(node).unwrap_or_else(|| panic!("empty node id")),
        attempt,
        outcome: NodeOutcome::Succeeded,
        output: Value::Null,
        artifacts: Vec::new(),
        cost: TokenCost::new(cost).unwrap_or_default(),
        diagnostics: Vec::new(),
        failure: None,
        gate: GateStatus::Passed,
        completed_at: Timestamp::now(),
    }
}

/// A failed completion costing 0.1.
pub fn failure(node: &str, attempt: u32, kind: FailureKind) -> NodeCompletion {
    NodeCompletion {
        outcome: NodeOutcome::Failed,
        failure: Some(NodeFailure {
            kind,
            message: format!("{} failed", node),
        }),
        ..completion(node, attempt, 0.1)
    }
}

// ---------------------------------------------------------------------------
// Artefact store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredItem {
    item: WorkItem,
    comments: Vec<StoredComment>,
    lock: Option<LockMarker>,
}

#[derive(Debug, Default)]
struct StoreInner {
    items: BTreeMap<WorkItemRef, StoredItem>,
    next_comment: u64,
    next_issue: u64,
}

/// An artefact store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                next_comment: 1,
                next_issue: 1000,
                ..StoreInner::default()
            }),
        }
    }

    /// Adds or replaces a work item.
    pub fn insert_work_item(&self, item: WorkItem) {
        let mut inner = guard(&self.inner);
        let reference = item.reference.clone();
        match inner.items.get_mut(&reference) {
            Some(existing) => existing.item = item,
            None => {
                inner.items.insert(
                    reference,
                    StoredItem {
                        item,
                        comments: Vec::new(),
                        lock: None,
                    },
                );
            }
        }
    }

    /// Current snapshot of a work item.
    pub fn item(&self, reference: &WorkItemRef) -> Option<WorkItem> {
        guard(&self.inner).items.get(reference).map(|s| s.item.clone())
    }

    /// Appends a comment written by a human.
    pub fn post_human_comment(&self, reference: &WorkItemRef, body: &str) {
        self.push_comment(reference, body, false);
    }

    /// Appends a comment that claims to be a record but comes from a human.
    pub fn post_forged_record(&self, reference: &WorkItemRef, record: &RunRecord) {
        let body = record.to_comment().unwrap_or_default();
        self.push_comment(reference, &body, false);
    }

    fn push_comment(&self, reference: &WorkItemRef, body: &str, engine: bool) -> Option<CommentId> {
        let mut inner = guard(&self.inner);
        let id = CommentId::new(inner.next_comment);
        inner.next_comment += 1;
        let stored = inner.items.get_mut(reference)?;
        stored.comments.push(StoredComment {
            id,
            body: body.to_string(),
            created_at: Timestamp::now(),
            authored_by_engine: engine,
        });
        Some(id)
    }

    /// Engine records on the item, in order.
    pub fn records(&self, reference: &WorkItemRef) -> Vec<RunRecord> {
        guard(&self.inner)
            .items
            .get(reference)
            .map(|s| {
                s.comments
                    .iter()
                    .filter_map(|c| match CommentEntry::classify(c) {
                        CommentEntry::Record(r) => Some(*r),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of comments of any author.
    pub fn comment_count(&self, reference: &WorkItemRef) -> usize {
        guard(&self.inner)
            .items
            .get(reference)
            .map_or(0, |s| s.comments.len())
    }

    pub fn labels(&self, reference: &WorkItemRef) -> Vec<String> {
        self.item(reference).map(|i| i.labels).unwrap_or_default()
    }

    /// Marks an item closed.
    pub fn close(&self, reference: &WorkItemRef) {
        if let Some(stored) = guard(&self.inner).items.get_mut(reference) {
            stored.item.closed = true;
        }
    }

    /// Overwrites the lock marker without any check.
    pub fn force_lock(&self, reference: &WorkItemRef, marker: Option<LockMarker>) {
        if let Some(stored) = guard(&self.inner).items.get_mut(reference) {
            set_lock(stored, marker);
        }
    }
}

fn set_lock(stored: &mut StoredItem, marker: Option<LockMarker>) {
    stored.item.labels.retain(|l| l != labels::PROCESSING);
    if marker.is_some() {
        stored.item.labels.push(labels::PROCESSING.to_string());
    }
    stored.lock = marker;
}

fn not_found(reference: &WorkItemRef) -> StoreError {
    StoreError::NotFound(reference.to_string())
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn work_item(&self, item: &WorkItemRef) -> Result<WorkItem, StoreError> {
        self.item(item).ok_or_else(|| not_found(item))
    }

    async fn comments(&self, item: &WorkItemRef) -> Result<Vec<StoredComment>, StoreError> {
        guard(&self.inner)
            .items
            .get(item)
            .map(|s| s.comments.clone())
            .ok_or_else(|| not_found(item))
    }

    async fn append_comment(&self, item: &WorkItemRef, body: &str) -> Result<CommentId, StoreError> {
        self.push_comment(item, body, true).ok_or_else(|| not_found(item))
    }

    async fn add_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError> {
        let mut inner = guard(&self.inner);
        let stored = inner.items.get_mut(item).ok_or_else(|| not_found(item))?;
        if !stored.item.has_label(label) {
            stored.item.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError> {
        let mut inner = guard(&self.inner);
        let stored = inner.items.get_mut(item).ok_or_else(|| not_found(item))?;
        stored.item.labels.retain(|l| l != label);
        Ok(())
    }

    async fn read_lock(&self, item: &WorkItemRef) -> Result<Option<LockMarker>, StoreError> {
        guard(&self.inner)
            .items
            .get(item)
            .map(|s| s.lock.clone())
            .ok_or_else(|| not_found(item))
    }

    async fn compare_and_swap_lock(
        &self,
        item: &WorkItemRef,
        expected: Option<&LockMarker>,
        replacement: Option<&LockMarker>,
    ) -> Result<bool, StoreError> {
        let mut inner = guard(&self.inner);
        let stored = inner.items.get_mut(item).ok_or_else(|| not_found(item))?;
        if stored.lock.as_ref() != expected {
            return Ok(false);
        }
        set_lock(stored, replacement.cloned());
        Ok(true)
    }

    async fn sub_work_items(&self, parent: &WorkItemRef) -> Result<Vec<SubWorkItem>, StoreError> {
        let inner = guard(&self.inner);
        Ok(inner
            .items
            .values()
            .filter(|s| s.item.reference.repository == parent.repository)
            .filter_map(|s| {
                let link = s.item.sub_work_item.as_ref()?;
                (link.parent == parent.number).then(|| SubWorkItem {
                    id: SubWorkItemId::new(s.item.reference.number.as_u64()),
                    title: s.item.title.clone(),
                    depends_on: link.depends_on.clone(),
                })
            })
            .collect())
    }

    async fn create_sub_work_item(
        &self,
        parent: &WorkItemRef,
        item: &NewSubWorkItem,
    ) -> Result<SubWorkItemId, StoreError> {
        let mut inner = guard(&self.inner);
        if !inner.items.contains_key(parent) {
            return Err(not_found(parent));
        }
        let number = inner.next_issue;
        inner.next_issue += 1;
        let id = SubWorkItemId::new(number);
        let reference = parent.sibling(id);
        inner.items.insert(
            reference.clone(),
            StoredItem {
                item: WorkItem {
                    reference,
                    title: item.title.clone(),
                    body: item.body.clone(),
                    labels: item.labels.clone(),
                    closed: false,
                    sub_work_item: Some(SubWorkItemLink {
                        parent: parent.number,
                        depends_on: item.depends_on.clone(),
                    }),
                },
                comments: Vec::new(),
                lock: None,
            },
        );
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

/// A successful completion with `text`.
pub fn reply(text: &str, cost: f64) -> ReasoningResponse {
    ReasoningResponse {
        text: text.to_string(),
        usage: Default::default(),
        cost: TokenCost::new(cost).unwrap_or_default(),
    }
}

/// A reasoner that answers from a script keyed on prompt fragments.
#[derive(Debug)]
pub struct ScriptedReasoner {
    scripts: Mutex<Vec<(String, VecDeque<Result<ReasoningResponse, ReasoningError>>)>>,
    fallback: ReasoningResponse,
    calls: Mutex<Vec<ReasoningRequest>>,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReasoner {
    /// Answers `{}` at no cost unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_fallback(reply("{}", 0.0))
    }

    pub fn with_fallback(fallback: ReasoningResponse) -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues `result` for the next prompt containing `fragment`.
    pub fn on(&self, fragment: &str, result: Result<ReasoningResponse, ReasoningError>) -> &Self {
        let mut scripts = guard(&self.scripts);
        match scripts.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(result),
            None => scripts.push((fragment.to_string(), VecDeque::from([result]))),
        }
        self
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<ReasoningRequest> {
        guard(&self.calls).clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoner {
    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
        let scripted = guard(&self.scripts)
            .iter_mut()
            .filter(|(fragment, _)| request.prompt.contains(fragment.as_str()))
            .find_map(|(_, queue)| queue.pop_front());
        guard(&self.calls).push(request);
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// ---------------------------------------------------------------------------
// Domain services
// ---------------------------------------------------------------------------

/// An `ok` response with no diagnostics.
pub fn ok_response() -> ExtensionResponse {
    ExtensionResponse {
        status: ResponseStatus::Ok,
        diagnostics: Vec::new(),
        artifacts: Vec::new(),
        api_version: None,
    }
}

/// An `error` response carrying one blocking diagnostic per message.
pub fn error_response(messages: &[&str]) -> ExtensionResponse {
    ExtensionResponse {
        status: ResponseStatus::Error,
        diagnostics: messages
            .iter()
            .map(|m| Diagnostic {
                message: m.to_string(),
                artifact: None,
                location: None,
                severity: crate::DiagnosticSeverity::Blocking,
            })
            .collect(),
        ..ok_response()
    }
}

type OperationKey = (String, String);

/// Domain services answering from a script.
#[derive(Debug, Default)]
pub struct ScriptedDomainService {
    health: Mutex<BTreeMap<DomainServiceName, HealthStatus>>,
    scripts: Mutex<BTreeMap<OperationKey, VecDeque<Result<ExtensionResponse, DomainServiceError>>>>,
    delays: Mutex<BTreeMap<OperationKey, Duration>>,
    health_checks: Mutex<Vec<DomainServiceName>>,
    invocations: Mutex<Vec<ExtensionRequest>>,
}

impl ScriptedDomainService {
    /// Every domain is healthy and every operation answers `ok`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_health(&self, domain: &str, status: HealthStatus) {
        if let Some(name) = DomainServiceName::new(domain) {
            guard(&self.health).insert(name, status);
        }
    }

    /// Queues `result` for the next call of `domain`/`operation`.
    pub fn on(&self, domain: &str, operation: &str, result: Result<ExtensionResponse, DomainServiceError>) -> &Self {
        guard(&self.scripts)
            .entry((domain.to_string(), operation.to_string()))
            .or_default()
            .push_back(result);
        self
    }

    /// Makes every call of `domain`/`operation` take `delay`. The operation
    /// `health_check` delays the health probe.
    pub fn delay(&self, domain: &str, operation: &str, delay: Duration) {
        guard(&self.delays).insert((domain.to_string(), operation.to_string()), delay);
    }

    pub fn health_checks(&self) -> Vec<DomainServiceName> {
        guard(&self.health_checks).clone()
    }

    pub fn invocations(&self) -> Vec<ExtensionRequest> {
        guard(&self.invocations).clone()
    }
}

#[async_trait]
impl DomainServiceClient for ScriptedDomainService {
    async fn health_check(&self, domain: &DomainServiceName, _repository: &RepositoryContext) -> HealthStatus {
        guard(&self.health_checks).push(domain.clone());
        let delay = guard(&self.delays)
            .get(&(domain.to_string(), "health_check".to_string()))
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard(&self.health)
            .get(domain)
            .cloned()
            .unwrap_or(HealthStatus::Healthy {
                api_version: ApiVersion::CURRENT,
            })
    }

    async fn invoke(
        &self,
        request: &ExtensionRequest,
        _timeout: Duration,
    ) -> Result<ExtensionResponse, DomainServiceError> {
        let key = (request.domain.to_string(), request.operation.to_string());
        guard(&self.invocations).push(request.clone());
        let delay = guard(&self.delays).get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = guard(&self.scripts).get_mut(&key).and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(ok_response()))
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = guard(&self.now);
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *guard(&self.now)
    }
}

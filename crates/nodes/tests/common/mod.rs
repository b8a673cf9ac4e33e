//! Shared fixtures for the executor scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use nodes::PipelineExecutor;
use pipeline::testing::{
    sample_ref, sample_work_item, InMemoryArtifactStore, ManualClock, ScriptedDomainService,
    ScriptedReasoner,
};
use pipeline::{NodeId, PipelineConfig, RunRecord, StepResult, Timestamp, WorkItem, WorkItemRef};

/// An executor wired to in-memory doubles, plus handles on the doubles.
pub struct Harness {
    pub store: Arc<InMemoryArtifactStore>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub domains: Arc<ScriptedDomainService>,
    pub clock: Arc<ManualClock>,
    pub executor: PipelineExecutor,
}

impl Harness {
    /// A harness for `config_toml` with the reasoner answering `{}`.
    pub fn new(config_toml: &str) -> Self {
        Self::with_reasoner(config_toml, ScriptedReasoner::new())
    }

    pub fn with_reasoner(config_toml: &str, reasoner: ScriptedReasoner) -> Self {
        let config = PipelineConfig::from_toml(config_toml).expect("test configuration is valid");
        let store = Arc::new(InMemoryArtifactStore::new());
        let reasoner = Arc::new(reasoner);
        let domains = Arc::new(ScriptedDomainService::new());
        let clock = Arc::new(ManualClock::new(Timestamp::now()));
        let executor = PipelineExecutor::new(store.clone(), reasoner.clone(), domains.clone(), config)
            .with_clock(clock.clone());
        store.insert_work_item(sample_work_item(1));
        Self {
            store,
            reasoner,
            domains,
            clock,
            executor,
        }
    }

    /// The work item every scenario runs against.
    pub fn item(&self) -> WorkItemRef {
        sample_ref(1)
    }

    pub fn insert(&self, item: WorkItem) {
        self.store.insert_work_item(item);
    }

    pub async fn advance(&self) -> StepResult {
        self.advance_ref(&self.item()).await
    }

    pub async fn advance_ref(&self, item: &WorkItemRef) -> StepResult {
        self.executor.advance(item).await.expect("advance succeeds")
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.store.records(&self.item())
    }

    /// Nodes in the order their completions were recorded.
    pub fn completed_nodes(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| match r {
                RunRecord::NodeCompleted(c) => Some(c.node.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.store.labels(&self.item())
    }
}

pub fn ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|n| NodeId::new(*n).unwrap()).collect()
}

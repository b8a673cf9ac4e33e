//! Repository pipeline configuration (`.cogworks/pipeline.toml`).
//!
//! ```toml
//! version = 1
//! default_pipeline = "standard"
//!
//! [settings]
//! max_parallelism = 4
//! cost_ceiling_usd = 50.0
//!
//! [[pipelines]]
//! name = "standard"
//!
//! [[pipelines.nodes]]
//! id = "design"
//! kind = "reasoning_call"
//! prompt = "Write a design for the work item."
//! outputs = ["design"]
//! gate = "human"
//!
//! [[selection]]
//! classification = "bug"
//! pipeline = "hotfix"
//! ```
//!
//! Loading validates every pipeline; a document with any structural defect
//! is rejected whole.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::{PipelineDefinition, PipelineGraph};
use crate::{CogWorksError, CostBudget, PipelineName, StructuralError, WorkItem};

/// The only configuration version this build understands.
pub const CONFIG_VERSION: u32 = 1;

/// Conventional location of the configuration in a repository.
pub const CONFIG_PATH: &str = ".cogworks/pipeline.toml";

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Nodes executed concurrently within a wave.
    pub max_parallelism: usize,
    /// Age after which a processing lock is stale.
    pub lock_timeout_minutes: u64,
    /// Cost ceiling per run, in USD.
    pub cost_ceiling_usd: f64,
    /// Rework traversals allowed per run across all edges.
    pub max_retries: u32,
    /// Node execution timeout unless the node overrides it.
    pub node_timeout_secs: u64,
    /// Traversal bound for rework edges that do not declare one.
    pub default_max_traversals: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            lock_timeout_minutes: 30,
            cost_ceiling_usd: 50.0,
            max_retries: 10,
            node_timeout_secs: 900,
            default_max_traversals: crate::graph::DEFAULT_MAX_TRAVERSALS,
        }
    }
}

impl Settings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_minutes * 60)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// The cost ceiling. Validated at load time.
    pub fn cost_budget(&self) -> Result<CostBudget, CogWorksError> {
        CostBudget::new(self.cost_ceiling_usd).ok_or_else(|| {
            CogWorksError::structural(StructuralError::InvalidSetting {
                name: "cost_ceiling_usd".into(),
                reason: "must be a positive number".into(),
            })
        })
    }

    fn validate(&self, errors: &mut Vec<StructuralError>) {
        let mut invalid = |name: &str, reason: &str| {
            errors.push(StructuralError::InvalidSetting {
                name: name.into(),
                reason: reason.into(),
            })
        };
        if self.max_parallelism == 0 {
            invalid("max_parallelism", "must be at least 1");
        }
        if self.lock_timeout_minutes == 0 {
            invalid("lock_timeout_minutes", "must be at least 1");
        }
        if CostBudget::new(self.cost_ceiling_usd).is_none() {
            invalid("cost_ceiling_usd", "must be a positive number");
        }
        if self.node_timeout_secs == 0 {
            invalid("node_timeout_secs", "must be at least 1");
        }
        if self.default_max_traversals == 0 {
            invalid("default_max_traversals", "must be at least 1");
        }
    }
}

/// Maps a classification to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub classification: String,
    pub pipeline: PipelineName,
}

/// A parsed and validated configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: u32,
    pub default_pipeline: PipelineName,
    #[serde(default)]
    pub settings: Settings,
    pub pipelines: Vec<PipelineDefinition>,
    #[serde(default)]
    pub selection: Vec<SelectionRule>,
}

impl PipelineConfig {
    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// [`CogWorksError::StructuralConfig`] listing every defect found.
    pub fn from_toml(text: &str) -> Result<Self, CogWorksError> {
        let mut config: Self = toml::from_str(text)
            .map_err(|e| CogWorksError::structural(StructuralError::Parse(e.to_string())))?;
        config.apply_defaults();
        config.validate()?;
        debug!(pipelines = config.pipelines.len(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Makes the default rework bound explicit, so a recorded definition does
    /// not depend on the settings of a later invocation.
    fn apply_defaults(&mut self) {
        let bound = self.settings.default_max_traversals;
        for pipeline in &mut self.pipelines {
            for edge in pipeline.edges.iter_mut().filter(|e| e.rework) {
                edge.max_traversals.get_or_insert(bound);
            }
        }
    }

    fn validate(&self) -> Result<(), CogWorksError> {
        let mut errors = Vec::new();
        if self.version != CONFIG_VERSION {
            errors.push(StructuralError::UnsupportedVersion {
                found: self.version,
                expected: CONFIG_VERSION,
            });
        }
        self.settings.validate(&mut errors);

        let mut names = BTreeSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(&pipeline.name) {
                errors.push(StructuralError::DuplicatePipeline(pipeline.name.clone()));
            }
            if let Err(CogWorksError::StructuralConfig { errors: found }) =
                PipelineGraph::new(pipeline.clone())
            {
                errors.extend(found);
            }
        }

        let referenced = std::iter::once(&self.default_pipeline)
            .chain(self.selection.iter().map(|r| &r.pipeline));
        for name in referenced {
            if !names.contains(name) {
                errors.push(StructuralError::UnknownPipeline(name.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CogWorksError::StructuralConfig { errors })
        }
    }

    /// Picks the pipeline for `item`: an explicit selection label, else the
    /// first rule matching its classification, else the default.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownPipeline`] when the label names an
    /// undeclared pipeline.
    pub fn select(&self, item: &WorkItem) -> Result<&PipelineDefinition, CogWorksError> {
        let name = item
            .selected_pipeline()
            .or_else(|| {
                let class = item.classification()?;
                self.selection
                    .iter()
                    .find(|r| r.classification == class)
                    .map(|r| r.pipeline.clone())
            })
            .unwrap_or_else(|| self.default_pipeline.clone());
        self.pipeline(&name)
    }

    /// Looks up a pipeline by name.
    pub fn pipeline(&self, name: &PipelineName) -> Result<&PipelineDefinition, CogWorksError> {
        self.pipelines
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| CogWorksError::structural(StructuralError::UnknownPipeline(name.clone())))
    }
}

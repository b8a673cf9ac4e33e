//! Artefacts: the externally persisted outputs of nodes.
//!
//! An artefact is always written somewhere addressable outside the process
//! (a comment, a label, a pull request, a file in the working directory, a
//! set of sub-work-item issues). The run records carry a description of each
//! artefact, so the set of available artefacts can be rebuilt at any time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ArtifactPath, ArtifactType, NodeId, PullRequestId, SubWorkItemId};

/// Where an artefact lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// Embedded in the run record comment itself.
    Comment,
    /// A label on the work item.
    Label { name: String },
    /// A pull request opened for review.
    PullRequest { id: PullRequestId },
    /// A file in the working directory.
    File { path: ArtifactPath },
    /// A set of sub-work-item issues.
    SubWorkItems { ids: Vec<SubWorkItemId> },
}

/// One artefact produced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: ArtifactType,
    pub producer: NodeId,
    pub location: ArtifactLocation,
    /// Structured content (or a summary of it for externally stored artefacts).
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Artifact {
    /// An artefact whose content is stored inline in the run record.
    pub fn inline(artifact_type: ArtifactType, producer: NodeId, content: serde_json::Value) -> Self {
        Self {
            artifact_type,
            producer,
            location: ArtifactLocation::Comment,
            content,
        }
    }
}

/// The artefacts currently available in a run, grouped by type in the order
/// they were recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    by_type: BTreeMap<ArtifactType, Vec<Artifact>>,
}

impl ArtifactSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artefact.
    pub fn insert(&mut self, artifact: Artifact) {
        self.by_type
            .entry(artifact.artifact_type.clone())
            .or_default()
            .push(artifact);
    }

    /// Removes every artefact produced by `producer`.
    pub fn remove_from(&mut self, producer: &NodeId) {
        for list in self.by_type.values_mut() {
            list.retain(|a| &a.producer != producer);
        }
        self.by_type.retain(|_, list| !list.is_empty());
    }

    /// Returns `true` if at least one artefact of `artifact_type` exists.
    pub fn contains(&self, artifact_type: &ArtifactType) -> bool {
        self.by_type.contains_key(artifact_type)
    }

    /// The most recently recorded artefact of `artifact_type`.
    pub fn latest(&self, artifact_type: &ArtifactType) -> Option<&Artifact> {
        self.by_type.get(artifact_type).and_then(|list| list.last())
    }

    /// Every artefact of `artifact_type`, oldest first.
    pub fn all(&self, artifact_type: &ArtifactType) -> &[Artifact] {
        self.by_type
            .get(artifact_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Iterates over all artefacts grouped by type.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.by_type.values().flatten()
    }

    /// Number of artefacts in the set.
    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ty(s: &str) -> ArtifactType {
        ArtifactType::new(s).unwrap()
    }

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn latest_returns_most_recent_of_type() {
        let mut set = ArtifactSet::new();
        set.insert(Artifact::inline(ty("review"), node("r1"), json!(1)));
        set.insert(Artifact::inline(ty("review"), node("r2"), json!(2)));
        assert_eq!(set.latest(&ty("review")).unwrap().content, json!(2));
        assert_eq!(set.all(&ty("review")).len(), 2);
        assert!(set.all(&ty("missing")).is_empty());
    }

    #[test]
    fn removing_a_producer_drops_empty_types() {
        let mut set = ArtifactSet::new();
        set.insert(Artifact::inline(ty("design"), node("design"), json!({})));
        set.insert(Artifact::inline(ty("plan"), node("plan"), json!({})));
        set.remove_from(&node("design"));
        assert!(!set.contains(&ty("design")));
        assert!(set.contains(&ty("plan")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn location_serialises_with_kind_tag() {
        let loc = ArtifactLocation::PullRequest {
            id: PullRequestId::new(12),
        };
        assert_eq!(
            serde_json::to_value(&loc).unwrap(),
            json!({"kind": "pull_request", "id": 12})
        );
    }
}

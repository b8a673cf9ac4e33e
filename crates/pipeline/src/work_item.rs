//! Work items, sub-work-items, and the labels that act as signals on them.
//!
//! A work item is an issue in the ticket tracker. CogWorks reads its labels
//! as trigger, lock and safety signals, and writes status back as comments
//! and labels. A sub-work-item is also an issue; it knows its parent and the
//! sibling sub-work-items it depends on.

use serde::{Deserialize, Serialize};

use crate::{CogWorksError, PipelineName, RepositoryId, SubWorkItemId, WorkItemId};

/// Well-known label names.
pub mod labels {
    /// Trigger label: only items carrying it are processed.
    pub const RUN: &str = "cogworks:run";
    /// Lock label: present while an invocation holds the processing lock.
    pub const PROCESSING: &str = "cogworks:processing";
    /// Safety-critical flag.
    pub const SAFETY_CRITICAL: &str = "cogworks:safety-critical";
    /// Prefix of the explicit pipeline-selection label.
    pub const PIPELINE_PREFIX: &str = "cogworks:pipeline:";
    /// Prefix of the classification label written when a node classifies the item.
    pub const CLASSIFICATION_PREFIX: &str = "cogworks:classification:";
    /// Informational: a human gate is waiting.
    pub const AWAITING_APPROVAL: &str = "cogworks:awaiting-approval";
    /// Informational: automated progress has stopped.
    pub const ESCALATED: &str = "cogworks:escalated";
    /// Informational: the run finished.
    pub const COMPLETE: &str = "cogworks:complete";
    /// Informational: the run failed.
    pub const FAILED: &str = "cogworks:failed";

    /// Builds the pipeline-selection label for `name`.
    pub fn pipeline(name: &crate::PipelineName) -> String {
        format!("{PIPELINE_PREFIX}{name}")
    }

    /// Builds the classification label for `class`.
    pub fn classification(class: &str) -> String {
        format!("{CLASSIFICATION_PREFIX}{class}")
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// Addresses one work item or sub-work-item in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemRef {
    /// Repository in `owner/repo` form.
    pub repository: RepositoryId,
    /// Issue number.
    pub number: WorkItemId,
}

impl WorkItemRef {
    /// Creates a reference.
    pub fn new(repository: RepositoryId, number: WorkItemId) -> Self {
        Self { repository, number }
    }

    /// Parses `owner/repo#42` or `https://github.com/owner/repo/issues/42`.
    pub fn parse(input: &str) -> Result<Self, CogWorksError> {
        let invalid = || CogWorksError::InvalidReference(input.to_string());
        let trimmed = input.trim();

        let (repo, number) = if let Some(rest) = trimmed
            .strip_prefix("https://github.com/")
            .or_else(|| trimmed.strip_prefix("http://github.com/"))
        {
            let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
            match parts.as_slice() {
                [owner, name, "issues" | "pull", number] => (format!("{owner}/{name}"), *number),
                _ => return Err(invalid()),
            }
        } else {
            let (repo, number) = trimmed.split_once('#').ok_or_else(invalid)?;
            (repo.to_string(), number)
        };

        let valid_repo = matches!(
            repo.split('/').collect::<Vec<_>>().as_slice(),
            [owner, name] if !owner.is_empty() && !name.is_empty()
        );
        if !valid_repo {
            return Err(invalid());
        }
        let number: u64 = number.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }

        Ok(Self {
            repository: RepositoryId::new(repo).ok_or_else(invalid)?,
            number: WorkItemId::new(number),
        })
    }

    /// The reference of a sub-work-item living in the same repository.
    pub fn sibling(&self, id: SubWorkItemId) -> Self {
        Self {
            repository: self.repository.clone(),
            number: WorkItemId::new(id.as_u64()),
        }
    }
}

impl std::fmt::Display for WorkItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Parent/dependency information for an issue that is a sub-work-item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkItemLink {
    /// The work item this sub-work-item was decomposed from.
    pub parent: WorkItemId,
    /// Sibling sub-work-items that must be closed before this one may start.
    pub depends_on: Vec<SubWorkItemId>,
}

/// A work item as read from the ticket tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub reference: WorkItemRef,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Whether the issue is closed. Closed sub-work-items satisfy dependencies.
    pub closed: bool,
    /// Present when this item is a sub-work-item.
    pub sub_work_item: Option<SubWorkItemLink>,
}

impl WorkItem {
    /// Returns `true` if the item carries `label`.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Whether processing has been requested.
    pub fn is_triggered(&self) -> bool {
        self.has_label(labels::RUN)
    }

    /// Whether the item is flagged safety-critical.
    pub fn is_safety_critical(&self) -> bool {
        self.has_label(labels::SAFETY_CRITICAL)
    }

    /// The classification recorded on the item, if any.
    pub fn classification(&self) -> Option<&str> {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix(labels::CLASSIFICATION_PREFIX))
            .filter(|c| !c.is_empty())
            .min()
    }

    /// The pipeline explicitly selected by label, if any.
    ///
    /// When several selection labels are present the alphabetically first
    /// wins, so that the choice does not depend on label ordering.
    pub fn selected_pipeline(&self) -> Option<PipelineName> {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix(labels::PIPELINE_PREFIX))
            .filter_map(PipelineName::new)
            .min()
    }
}

/// A sub-work-item to be created by a spawn node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkItemSpec {
    pub title: String,
    pub body: String,
    /// Indices into the same plan of the items this one depends on.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// A sub-work-item that exists in the ticket tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkItem {
    pub id: SubWorkItemId,
    pub title: String,
    pub depends_on: Vec<SubWorkItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_reference() {
        let r = WorkItemRef::parse("octo/widgets#42").unwrap();
        assert_eq!(r.repository.as_str(), "octo/widgets");
        assert_eq!(r.number, WorkItemId::new(42));
        assert_eq!(r.to_string(), "octo/widgets#42");
    }

    #[test]
    fn parses_issue_url() {
        let r = WorkItemRef::parse("https://github.com/octo/widgets/issues/7/").unwrap();
        assert_eq!(r.repository.as_str(), "octo/widgets");
        assert_eq!(r.number.as_u64(), 7);
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in ["octo#1", "octo/widgets", "octo/widgets#x", "/widgets#3", "a/b#0"] {
            assert!(WorkItemRef::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn pipeline_label_selection_is_order_independent() {
        let item = WorkItem {
            reference: WorkItemRef::parse("o/r#1").unwrap(),
            title: String::new(),
            body: String::new(),
            labels: vec![
                "cogworks:pipeline:zeta".into(),
                "cogworks:pipeline:hotfix".into(),
                labels::RUN.into(),
            ],
            closed: false,
            sub_work_item: None,
        };
        assert_eq!(item.selected_pipeline().unwrap().as_str(), "hotfix");
        assert!(item.is_triggered());
        assert!(!item.is_safety_critical());
    }
}

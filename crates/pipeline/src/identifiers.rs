//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging — for example —
//! a [`WorkItemId`] with a [`PullRequestId`] even though both are `u64` under the
//! hood.
//!
//! String-backed identifiers reject the empty string both at construction and
//! during deserialisation, so a configuration document can never smuggle in an
//! empty node or edge name.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display,
// and a serde representation that refuses empty strings.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value).ok_or_else(|| {
                    format!("{} must not be empty", stringify!($name))
                })
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes (GitHub-assigned integers).
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for UUID-wrapped newtypes (internally generated).
// ---------------------------------------------------------------------------
macro_rules! uuid_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates the identifier from an existing UUID (e.g. deserialised from a record).
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying [`Uuid`].
            pub fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers — GitHub-integer-backed
// ---------------------------------------------------------------------------

u64_id! {
    /// Identifies a GitHub Issue that represents a unit of work for CogWorks.
    ///
    /// Wraps the GitHub Issue number assigned by GitHub (positive integer).
    WorkItemId
}

u64_id! {
    /// Identifies a GitHub Issue created by a spawn node for one
    /// implementation sub-task within a larger work item.
    SubWorkItemId
}

u64_id! {
    /// Identifies a GitHub Pull Request opened as a review artefact.
    PullRequestId
}

u64_id! {
    /// Identifies a comment on a work item. Run records live in comments.
    CommentId
}

// ---------------------------------------------------------------------------
// Identifiers — UUID-backed (internally generated)
// ---------------------------------------------------------------------------

uuid_id! {
    /// Identifies one pipeline run: the execution of a pipeline definition for
    /// one work item, spanning any number of step-function invocations.
    ///
    /// Generated when the run starts and persisted in the `RunStarted` record.
    PipelineRunId
}

uuid_id! {
    /// Identifies a single invocation of the step function.
    ///
    /// Generated fresh for every `advance` call and written into the lock
    /// marker so that a release never clears another invocation's lock.
    InvocationId
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed (configuration / Git names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a pipeline node by its configured name within a pipeline graph.
    ///
    /// Node names are unique per pipeline and defined in `.cogworks/pipeline.toml`.
    NodeId
}

string_id! {
    /// Identifies an edge between two nodes within a pipeline graph.
    ///
    /// Edge names are unique per pipeline and defined in `.cogworks/pipeline.toml`.
    EdgeId
}

string_id! {
    /// Identifies a named pipeline configuration (e.g. `"default"`, `"hotfix"`).
    PipelineName
}

string_id! {
    /// Identifies a GitHub repository in `"owner/repo"` format.
    RepositoryId
}

string_id! {
    /// Identifies a domain service as declared in `.cogworks/services.toml`.
    DomainServiceName
}

string_id! {
    /// Names an operation offered by a domain service (e.g. `"validate"`, `"build"`).
    OperationName
}

string_id! {
    /// A file-system path relative to the repository root.
    ArtifactPath
}

string_id! {
    /// The type of an artefact exchanged between nodes (e.g. `"design"`, `"plan"`).
    ///
    /// Node inputs and outputs are declared as artefact types; readiness is
    /// decided by which types currently exist in the run.
    ArtifactType
}

impl OperationName {
    /// The health-check operation every domain service implements.
    pub fn health_check() -> Self {
        Self(crate::extension::HEALTH_CHECK_OPERATION.to_string())
    }
}

impl ArtifactType {
    /// The built-in artefact type that every run starts with: the work item itself.
    pub fn work_item() -> Self {
        Self("work_item".to_string())
    }
}

//! The core data model: repository keys, package names, revision ids, and
//! the lifecycle label attached to every package revision.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

//================================================================================================
// Types
//================================================================================================

/// The stable identity of a registered repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoKey {
    /// The namespace the repository was registered in.
    pub namespace: String,
    /// The repository's name within its namespace.
    pub name: String,
}

/// A repository-relative package path.
///
/// Packages are induced by the existence of at least one revision; the name
/// is the subdirectory (or artifact name) the revisions live under. Validated
/// on construction: relative, no empty or `..` segments, and limited to a
/// conservative character set shared by git refs and OCI tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

/// The human-visible version label of a package revision.
///
/// Either the `draft` sentinel or a label such as `v1`, `v2.0`, `stable`.
/// Labels of the form `v<integer>` participate in automatic version
/// assignment on approval; all other labels are valid but sit outside the
/// numeric sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(String);

/// The full key of a package revision: `(repository, package, revision)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionKey {
    /// The owning repository.
    pub repo: RepoKey,
    /// The package within the repository.
    pub package: PackageName,
    /// The revision label.
    pub revision: RevisionId,
}

/// The lifecycle label of a package revision.
///
/// Transitions are driven exclusively through the engine:
///
/// ```text
/// Draft ⇄ Proposed → Published → DeletionProposed → (deleted)
///   └──────────────────────────────────────────────→ (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Mutable working copy on a writable backend location.
    Draft,
    /// Submitted for review; content frozen pending approval or rejection.
    Proposed,
    /// Immutable, frozen under a read-only backend ref.
    Published,
    /// Published content whose removal has been requested.
    DeletionProposed,
}

/// A revision as reported by a backend: its key, lifecycle, and the
/// immutable object identifier (commit hash or manifest digest) its content
/// is frozen under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// The revision's key.
    pub key: RevisionKey,
    /// The revision's lifecycle label.
    pub lifecycle: Lifecycle,
    /// Commit hash (git) or manifest digest (OCI) of the current content.
    pub object: String,
    /// When the backend object was created, as reported by the backend.
    pub created_at: DateTime<Utc>,
}

/// The outcome of the last pipeline execution over a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStatus {
    /// Whether every declared function completed successfully.
    pub ok: bool,
    /// Per-function outcomes, in pipeline order up to the first failure.
    pub results: Vec<FunctionOutcome>,
}

/// The outcome of one function invocation within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOutcome {
    /// The function image that was evaluated.
    pub image: String,
    /// The function's exit code; zero on success.
    pub exit_code: i32,
    /// Diagnostics from the function's structured results and stderr.
    pub message: String,
}

//================================================================================================
// Impls
//================================================================================================

impl RepoKey {
    /// Creates a repository key from its namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        RepoKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl PackageName {
    /// Validates and wraps a repository-relative package path.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid("package name must not be empty"));
        }
        if name.starts_with('/') || name.ends_with('/') {
            return Err(Error::invalid(format!(
                "package name `{name}` must be a relative path"
            )));
        }
        for segment in name.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::invalid(format!(
                    "package name `{name}` contains an invalid path segment"
                )));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                return Err(Error::invalid(format!(
                    "package name `{name}` contains unsupported characters"
                )));
            }
        }
        Ok(PackageName(name))
    }

    /// The package path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageName::new(s)
    }
}

impl TryFrom<String> for PackageName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PackageName::new(s)
    }
}

impl From<PackageName> for String {
    fn from(p: PackageName) -> String {
        p.0
    }
}

impl RevisionId {
    /// The sentinel label of the single mutable draft of a package.
    pub const DRAFT: &'static str = "draft";

    /// Validates and wraps a revision label.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid("revision id must not be empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::invalid(format!(
                "revision id `{id}` contains unsupported characters"
            )));
        }
        Ok(RevisionId(id))
    }

    /// The `draft` sentinel.
    pub fn draft() -> Self {
        RevisionId(Self::DRAFT.to_string())
    }

    /// Whether this is the `draft` sentinel.
    pub fn is_draft(&self) -> bool {
        self.0 == Self::DRAFT
    }

    /// The numeric component of a `v<integer>` label, if this label has one.
    ///
    /// Labels like `v2.0` or `stable` return `None`: they are valid ids but
    /// do not participate in automatic version assignment.
    pub fn as_number(&self) -> Option<u64> {
        self.0.strip_prefix('v').and_then(|n| n.parse().ok())
    }

    /// The `v<n>` label for a numeric revision.
    pub fn from_number(n: u64) -> Self {
        RevisionId(format!("v{n}"))
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RevisionId::new(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RevisionId::new(s)
    }
}

impl From<RevisionId> for String {
    fn from(r: RevisionId) -> String {
        r.0
    }
}

impl RevisionKey {
    /// Assembles a revision key.
    pub fn new(repo: RepoKey, package: PackageName, revision: RevisionId) -> Self {
        RevisionKey {
            repo,
            package,
            revision,
        }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.repo, self.package, self.revision)
    }
}

impl Lifecycle {
    /// Whether a transition from `self` to `to` is legal for the engine.
    pub fn can_transition(self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Draft, Proposed) | (Proposed, Draft) | (Proposed, Published) | (Published, DeletionProposed)
        )
    }

    /// Whether a revision in this state may be removed from the backend.
    pub fn deletable(self) -> bool {
        matches!(self, Lifecycle::Draft | Lifecycle::DeletionProposed)
    }

    /// Whether the revision's contents may still change.
    pub fn mutable(self) -> bool {
        matches!(self, Lifecycle::Draft)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Draft => f.write_str("Draft"),
            Lifecycle::Proposed => f.write_str("Proposed"),
            Lifecycle::Published => f.write_str("Published"),
            Lifecycle::DeletionProposed => f.write_str("DeletionProposed"),
        }
    }
}

impl RenderStatus {
    /// A passing status with no recorded outcomes.
    pub fn success() -> Self {
        RenderStatus {
            ok: true,
            results: Vec::new(),
        }
    }
}

//================================================================================================
// Tests
//================================================================================================

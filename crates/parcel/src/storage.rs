//! # Repository Backends
//!
//! This module defines the abstraction every package store implements, plus
//! the two shipped implementations: remote git repositories ([`git`]) and
//! OCI artifact registries ([`oci`]).
//!
//! ## Contract
//!
//! All operations are linearizable *per repository*: the cache serializes
//! mutations and refreshes on one repository behind a mutex, while reads are
//! unrestricted and operate on immutable objects (commits, manifests).
//!
//! A backend is the single source of truth for its repository. The cache
//! layers a materialized view on top; the engine funnels every mutation
//! through [`Backend`] so that lifecycle invariants hold no matter which
//! store a package lives in.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::core::{Lifecycle, PackageName, RepoKey, RevisionId, RevisionKey, RevisionRecord};
use crate::error::Result;

pub mod git;
pub mod oci;

//================================================================================================
// Types
//================================================================================================

/// A declared repository: identity, backend locator, and bookkeeping flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// The repository's stable identity.
    pub key: RepoKey,
    /// Where the repository's packages live.
    pub spec: BackendSpec,
    /// Credentials presented to the backend, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Whether this is a published-only deployment target rather than a
    /// development source.
    #[serde(default)]
    pub deployment: bool,
    /// Overrides the configured background poll interval for this
    /// repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
}

/// Backend-specific locator of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendSpec {
    /// A remote git repository.
    Git {
        /// Clone URL of the repository.
        url: String,
        /// Directory prefix packages are discovered under; empty for the
        /// whole repository.
        #[serde(default)]
        directory: String,
    },
    /// An OCI artifact registry repository, e.g. `ghcr.io/acme/packages`.
    Oci {
        /// The registry repository holding package artifacts.
        registry: String,
    },
}

/// Credentials presented to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    /// Username/password (or token) authentication.
    Basic {
        /// The account name.
        username: String,
        /// The secret presented alongside it.
        password: String,
    },
}

/// A writable draft location held open by the engine while it mutates a
/// revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftHandle {
    /// The draft's key.
    pub key: RevisionKey,
    /// The object identifier of the draft's current tip.
    pub object: String,
}

/// The difference between two observations of a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Revisions that appeared since the prior refresh.
    pub added: Vec<RevisionRecord>,
    /// Revisions whose lifecycle or content changed.
    pub updated: Vec<RevisionRecord>,
    /// Revisions that disappeared.
    pub removed: Vec<RevisionKey>,
}

//================================================================================================
// Traits
//================================================================================================

/// The operations every package store supports.
///
/// Implementations: [`git::GitBackend`], [`oci::OciBackend`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// The identity of the repository this backend serves.
    fn key(&self) -> &RepoKey;

    /// Every revision currently known to the backend, with lifecycle labels.
    ///
    /// Reflects the backend state as of the last [`Backend::refresh`]; call
    /// `refresh` first to observe external changes.
    async fn list(&self) -> Result<Vec<RevisionRecord>>;

    /// The full contents of one revision.
    async fn read(&self, key: &RevisionKey) -> Result<Bundle>;

    /// Creates a writable draft location for `(package, revision)`.
    ///
    /// The draft starts from the package's latest published content, or
    /// empty for a brand-new package. Fails with `Conflict` if the draft
    /// location already exists.
    async fn create_draft(
        &self,
        package: &PackageName,
        revision: &RevisionId,
    ) -> Result<DraftHandle>;

    /// Replaces the draft's working contents. Does not publish.
    async fn write_draft(
        &self,
        draft: &DraftHandle,
        resources: &Bundle,
        message: &str,
    ) -> Result<DraftHandle>;

    /// Freezes a draft under the read-only ref for `revision`, removing the
    /// writable location. Fails with `Conflict` if the target ref exists.
    async fn publish_draft(
        &self,
        draft: &DraftHandle,
        revision: &RevisionId,
        approver: &str,
    ) -> Result<RevisionRecord>;

    /// Moves a draft between its `Draft` and `Proposed` locations.
    async fn move_draft(&self, key: &RevisionKey, to: Lifecycle) -> Result<RevisionRecord>;

    /// Marks or unmarks a published revision as proposed for deletion.
    async fn set_deletion_proposed(
        &self,
        key: &RevisionKey,
        proposed: bool,
    ) -> Result<RevisionRecord>;

    /// Removes a revision's backing object (branch or tag).
    async fn delete(&self, key: &RevisionKey) -> Result<()>;

    /// Re-observes the backend, returning what changed since the prior
    /// refresh.
    async fn refresh(&self) -> Result<ChangeSet>;
}

//================================================================================================
// Functions
//================================================================================================

/// Opens the backend a repository declaration points at.
pub fn open(repo: &Repository) -> Result<std::sync::Arc<dyn Backend>> {
    match &repo.spec {
        BackendSpec::Git { url, directory } => Ok(std::sync::Arc::new(git::GitBackend::open(
            repo.key.clone(),
            url.clone(),
            directory.clone(),
            repo.credentials.clone(),
        )?)),
        BackendSpec::Oci { registry } => Ok(std::sync::Arc::new(oci::OciBackend::new(
            repo.key.clone(),
            registry.clone(),
            repo.credentials.clone(),
        )?)),
    }
}

/// Computes the diff between two revision listings, keyed by revision.
pub(crate) fn diff_records(
    old: &std::collections::HashMap<RevisionKey, RevisionRecord>,
    new: &std::collections::HashMap<RevisionKey, RevisionRecord>,
) -> ChangeSet {
    let mut change = ChangeSet::default();
    for (key, record) in new {
        match old.get(key) {
            None => change.added.push(record.clone()),
            Some(prior) if prior.object != record.object || prior.lifecycle != record.lifecycle => {
                change.updated.push(record.clone())
            },
            Some(_) => {},
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            change.removed.push(key.clone());
        }
    }
    change
}

impl ChangeSet {
    /// Whether the refresh observed no changes.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl Credentials {
    /// The username/password pair, however the credential was declared.
    pub fn basic(&self) -> (&str, &str) {
        match self {
            Credentials::Basic { username, password } => (username, password),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn record(pkg: &str, rev: &str, lifecycle: Lifecycle, object: &str) -> RevisionRecord {
        RevisionRecord {
            key: RevisionKey::new(
                RepoKey::new("default", "r"),
                PackageName::new(pkg).unwrap(),
                RevisionId::new(rev).unwrap(),
            ),
            lifecycle,
            object: object.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn diff_detects_all_change_kinds() {
        let a = record("pkg", "v1", Lifecycle::Published, "aaaa");
        let b = record("pkg", "draft", Lifecycle::Draft, "bbbb");
        let b2 = record("pkg", "draft", Lifecycle::Draft, "cccc");
        let c = record("other", "v1", Lifecycle::Published, "dddd");

        let old: HashMap<_, _> = [a.clone(), b.clone()]
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        let new: HashMap<_, _> = [a.clone(), b2.clone(), c.clone()]
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let change = diff_records(&old, &new);
        assert_eq!(change.added, vec![c]);
        assert_eq!(change.updated, vec![b2]);
        assert!(change.removed.is_empty());

        let change = diff_records(&new, &old);
        assert_eq!(change.removed.len(), 1);
    }
}

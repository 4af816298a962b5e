//! # Package Manifest
//!
//! Every package carries a manifest file (`Pkgfile`) inside its bundle. The
//! manifest records where the package was cloned from (`upstream`), the
//! immutable identifier of the exact upstream object the clone was taken
//! from (`upstreamLock`), and an optional `pipeline` of transformation
//! functions applied to the bundle on every edit.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: orchard.dev/v1
//! kind: Pkgfile
//! metadata:
//!   name: basens-clone
//! upstream:
//!   type: git
//!   git:
//!     repo: https://example.com/t.git
//!     ref: basens/v1
//!     directory: basens
//! upstreamLock:
//!   type: git
//!   git:
//!     repo: https://example.com/t.git
//!     ref: basens/v1
//!     directory: basens
//!     commit: 0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d
//! pipeline:
//!   functions:
//!     - image: set-labels:v1
//!       config:
//!         labels:
//!           tier: web
//! ```
//!
//! ## Round-trip fidelity
//!
//! The engine edits manifests that users also edit by hand, so unknown
//! fields must survive. The manifest is therefore held as the parsed
//! document tree; typed views are extracted from it on demand and updates
//! are applied back into the tree, leaving everything else untouched.

use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};

use crate::core::PackageName;
use crate::error::{Error, Result};

//================================================================================================
// Constants
//================================================================================================

const API_VERSION: &str = "orchard.dev/v1";
const KIND: &str = "Pkgfile";

//================================================================================================
// Types
//================================================================================================

/// A package manifest, held as a document tree for round-trip fidelity.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    doc: Mapping,
}

/// Where a package was cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    /// The backend kind of the upstream, `git` or `oci`.
    #[serde(rename = "type")]
    pub kind: UpstreamKind,
    /// Locator of a git upstream; set when `kind` is `git`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitUpstream>,
    /// Locator of an OCI upstream; set when `kind` is `oci`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciUpstream>,
}

/// The backend kind of an upstream reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    /// A remote git repository.
    Git,
    /// An OCI artifact registry.
    Oci,
}

/// Locator of a git upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitUpstream {
    /// URL of the upstream repository.
    pub repo: String,
    /// The reference the clone was taken from, e.g. `basens/v1`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Repository-relative directory of the upstream package.
    pub directory: String,
}

/// Locator of an OCI upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUpstream {
    /// The upstream image reference.
    pub image: String,
}

/// The immutable upstream identifier pinned at clone time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamLock {
    /// The backend kind of the locked upstream.
    #[serde(rename = "type")]
    pub kind: UpstreamKind,
    /// Lock of a git upstream; set when `kind` is `git`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitLock>,
    /// Lock of an OCI upstream; set when `kind` is `oci`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciLock>,
}

/// A locked git upstream: the locator plus the resolved commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitLock {
    /// URL of the upstream repository.
    pub repo: String,
    /// The reference the clone was taken from.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Repository-relative directory of the upstream package.
    pub directory: String,
    /// The commit hash the reference resolved to at clone time.
    pub commit: String,
}

/// A locked OCI upstream: the image plus the resolved manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciLock {
    /// The upstream image reference.
    pub image: String,
    /// The manifest digest the image resolved to at clone time.
    pub digest: String,
}

/// The ordered function pipeline declared by a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Function invocations, applied in order.
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

/// One function invocation within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// The function image to evaluate.
    pub image: String,
    /// Optional configuration document passed to the function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

//================================================================================================
// Impls
//================================================================================================

impl Manifest {
    /// Parses a manifest from its file bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: Value = serde_yaml_ng::from_slice(bytes)
            .map_err(|e| Error::invalid(format!("malformed manifest: {e}")))?;
        match doc {
            Value::Mapping(doc) => Ok(Manifest { doc }),
            _ => Err(Error::invalid("manifest is not a document mapping")),
        }
    }

    /// A fresh manifest for a newly initialized package.
    pub fn init(package: &PackageName) -> Self {
        let mut metadata = Mapping::new();
        metadata.insert(Value::from("name"), Value::from(package.as_str()));

        let mut doc = Mapping::new();
        doc.insert(Value::from("apiVersion"), Value::from(API_VERSION));
        doc.insert(Value::from("kind"), Value::from(KIND));
        doc.insert(Value::from("metadata"), Value::Mapping(metadata));
        Manifest { doc }
    }

    /// The declared upstream, if any.
    pub fn upstream(&self) -> Result<Option<Upstream>> {
        self.section("upstream")
    }

    /// The pinned upstream lock, if any.
    pub fn upstream_lock(&self) -> Result<Option<UpstreamLock>> {
        self.section("upstreamLock")
    }

    /// The declared function pipeline, if any.
    pub fn pipeline(&self) -> Result<Option<Pipeline>> {
        self.section("pipeline")
    }

    /// Records the upstream a clone was taken from.
    pub fn set_upstream(&mut self, upstream: &Upstream) -> Result<()> {
        self.set_section("upstream", upstream)
    }

    /// Pins the immutable upstream identifier resolved at clone time.
    ///
    /// Written exactly once, by the clone operation; later resource edits
    /// leave the stored value in place.
    pub fn set_upstream_lock(&mut self, lock: &UpstreamLock) -> Result<()> {
        self.set_section("upstreamLock", lock)
    }

    /// Serializes the manifest, preserving fields this module knows nothing
    /// about.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_yaml_ng::to_string(&Value::Mapping(self.doc.clone()))
            .map(String::into_bytes)
            .map_err(|e| Error::internal(format!("manifest serialization failed: {e}")))
    }

    fn section<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.doc.get(key) {
            None => Ok(None),
            Some(value) => serde_yaml_ng::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::invalid(format!("manifest `{key}` section: {e}"))),
        }
    }

    fn set_section<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_yaml_ng::to_value(value)
            .map_err(|e| Error::internal(format!("manifest `{key}` serialization: {e}")))?;
        self.doc.insert(Value::from(key), value);
        Ok(())
    }
}

impl Upstream {
    /// A git upstream locator.
    pub fn git(repo: impl Into<String>, reference: impl Into<String>, directory: impl Into<String>) -> Self {
        Upstream {
            kind: UpstreamKind::Git,
            git: Some(GitUpstream {
                repo: repo.into(),
                reference: reference.into(),
                directory: directory.into(),
            }),
            oci: None,
        }
    }

    /// An OCI upstream locator.
    pub fn oci(image: impl Into<String>) -> Self {
        Upstream {
            kind: UpstreamKind::Oci,
            git: None,
            oci: Some(OciUpstream { image: image.into() }),
        }
    }
}

impl UpstreamLock {
    /// Locks a git upstream to the commit its reference resolved to.
    pub fn git(upstream: &GitUpstream, commit: impl Into<String>) -> Self {
        UpstreamLock {
            kind: UpstreamKind::Git,
            git: Some(GitLock {
                repo: upstream.repo.clone(),
                reference: upstream.reference.clone(),
                directory: upstream.directory.clone(),
                commit: commit.into(),
            }),
            oci: None,
        }
    }

    /// Locks an OCI upstream to a manifest digest.
    pub fn oci(image: impl Into<String>, digest: impl Into<String>) -> Self {
        UpstreamLock {
            kind: UpstreamKind::Oci,
            git: None,
            oci: Some(OciLock {
                image: image.into(),
                digest: digest.into(),
            }),
        }
    }
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "\
apiVersion: orchard.dev/v1
kind: Pkgfile
metadata:
  name: basens
info:
  description: base namespace
  x-team: platform
upstream:
  type: git
  git:
    repo: https://example.com/t.git
    ref: basens/v1
    directory: basens
pipeline:
  functions:
    - image: set-labels:v1
      config:
        labels:
          tier: web
";

    #[test]
    fn typed_views() {
        let manifest = Manifest::parse(RAW.as_bytes()).unwrap();
        let upstream = manifest.upstream().unwrap().unwrap();
        assert_eq!(upstream.kind, UpstreamKind::Git);
        let git = upstream.git.unwrap();
        assert_eq!(git.reference, "basens/v1");
        assert_eq!(git.directory, "basens");

        let pipeline = manifest.pipeline().unwrap().unwrap();
        assert_eq!(pipeline.functions.len(), 1);
        assert_eq!(pipeline.functions[0].image, "set-labels:v1");
        assert!(pipeline.functions[0].config.is_some());

        assert!(manifest.upstream_lock().unwrap().is_none());
    }

    #[test]
    fn lock_update_preserves_unknown_fields() {
        let mut manifest = Manifest::parse(RAW.as_bytes()).unwrap();
        let upstream = manifest.upstream().unwrap().unwrap().git.unwrap();
        let lock = UpstreamLock::git(&upstream, "0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d");
        manifest.set_upstream_lock(&lock).unwrap();

        let bytes = manifest.to_bytes().unwrap();
        let reparsed = Manifest::parse(&bytes).unwrap();

        let lock = reparsed.upstream_lock().unwrap().unwrap();
        assert_eq!(
            lock.git.unwrap().commit,
            "0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d"
        );

        // the field nobody in this module knows about survives the edit
        let text = String::from_utf8(reparsed.to_bytes().unwrap()).unwrap();
        assert!(text.contains("x-team: platform"));
    }

    #[test]
    fn init_manifest_round_trips() {
        let package = PackageName::new("basens-clone").unwrap();
        let manifest = Manifest::init(&package);
        let bytes = manifest.to_bytes().unwrap();
        let reparsed = Manifest::parse(&bytes).unwrap();
        assert!(reparsed.upstream().unwrap().is_none());
        assert!(reparsed.pipeline().unwrap().is_none());
    }
}

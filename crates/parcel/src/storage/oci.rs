//! # OCI Backend
//!
//! Maps the backend abstraction onto an OCI artifact registry. A package
//! revision is one image manifest whose single layer carries the bundle as a
//! gzipped tar of `path → bytes`; the config blob records the package,
//! revision, and lifecycle so that every lifecycle state has its own
//! manifest digest.
//!
//! ## Tag layout
//!
//! All revisions of all packages live in one registry repository; the tag
//! encodes the package and revision:
//!
//! - `{package}__{revision}` — published
//! - `drafts__{package}__{revision}` — mutable drafts
//! - `proposed__{package}__{revision}` — drafts awaiting approval
//! - `deletion__{package}__{revision}` — deletion-proposed markers
//!
//! Registries expose no portable repository catalog, so package paths are
//! restricted to a single segment here; the separator cannot occur in a
//! package name or revision id.
//!
//! ## Lock values
//!
//! Locks are manifest digests, resolved with a digest fetch after each push.
//!
//! ## Tag removal
//!
//! The distribution API removes manifests, not tags, so every state change
//! pushes a manifest with a distinct digest (the config blob differs) and
//! deletes the superseded manifest by digest. Layer blobs are content
//! addressed and dedupe across those pushes.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bundle::Bundle;
use crate::core::{Lifecycle, PackageName, RepoKey, RevisionId, RevisionKey, RevisionRecord};
use crate::error::{Error, Result};
use crate::storage::{diff_records, Backend, ChangeSet, Credentials, DraftHandle};

//================================================================================================
// Constants
//================================================================================================

const LAYER_MEDIA_TYPE: &str = "application/vnd.orchard.package.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.orchard.package.config.v1+json";

const SEPARATOR: &str = "__";
const DRAFTS_PREFIX: &str = "drafts__";
const PROPOSED_PREFIX: &str = "proposed__";
const DELETION_PREFIX: &str = "deletion__";

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(60);

//================================================================================================
// Types
//================================================================================================

/// An OCI-registry-backed package repository.
pub struct OciBackend {
    key: RepoKey,
    /// Registry host, e.g. `ghcr.io`.
    host: String,
    /// Repository path within the registry, e.g. `acme/packages`.
    repository: String,
    auth: RegistryAuth,
    client: Client,
    state: Mutex<RegistryState>,
}

/// The last observation of the registry: tag → manifest digest, plus the
/// derived revision records.
#[derive(Default)]
struct RegistryState {
    initialized: bool,
    tags: HashMap<String, String>,
    records: HashMap<RevisionKey, RevisionRecord>,
}

/// The config blob attached to every pushed manifest. Lifecycle is part of
/// the blob so each lifecycle state yields a distinct manifest digest.
#[derive(Serialize, Deserialize)]
struct PackageConfig {
    package: String,
    revision: String,
    lifecycle: String,
    created: String,
}

//================================================================================================
// Impls
//================================================================================================

impl OciBackend {
    /// Connects to the registry repository holding this repository's
    /// packages.
    pub fn new(key: RepoKey, registry: String, credentials: Option<Credentials>) -> Result<Self> {
        let (host, repository) = registry
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("registry `{registry}` has no repository path")))?;

        let auth = match &credentials {
            Some(c) => {
                let (user, pass) = c.basic();
                RegistryAuth::Basic(user.to_string(), pass.to_string())
            },
            None => RegistryAuth::Anonymous,
        };

        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });

        Ok(OciBackend {
            key,
            host: host.to_string(),
            repository: repository.to_string(),
            auth,
            client,
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn reference(&self, tag: &str) -> Reference {
        Reference::with_tag(self.host.clone(), self.repository.clone(), tag.to_string())
    }

    fn digest_reference(&self, digest: &str) -> Reference {
        Reference::with_digest(
            self.host.clone(),
            self.repository.clone(),
            digest.to_string(),
        )
    }

    fn tag_for(key: &RevisionKey, lifecycle: Lifecycle) -> Result<String> {
        let package = key.package.as_str();
        if package.contains('/') || package.contains(SEPARATOR) {
            return Err(Error::invalid(format!(
                "package `{package}` cannot be stored in a registry: nested paths are not addressable as tags"
            )));
        }
        let revision = key.revision.as_str();
        Ok(match lifecycle {
            Lifecycle::Draft => format!("{DRAFTS_PREFIX}{package}{SEPARATOR}{revision}"),
            Lifecycle::Proposed => format!("{PROPOSED_PREFIX}{package}{SEPARATOR}{revision}"),
            Lifecycle::Published => format!("{package}{SEPARATOR}{revision}"),
            Lifecycle::DeletionProposed => {
                format!("{DELETION_PREFIX}{package}{SEPARATOR}{revision}")
            },
        })
    }

    /// Pushes a bundle under `tag`, returning the new manifest digest.
    async fn push_bundle(
        &self,
        tag: &str,
        key: &RevisionKey,
        lifecycle: Lifecycle,
        bundle: &Bundle,
    ) -> Result<String> {
        let layer = ImageLayer::new(pack_bundle(bundle)?, LAYER_MEDIA_TYPE.to_string(), None);
        let config = PackageConfig {
            package: key.package.to_string(),
            revision: key.revision.to_string(),
            lifecycle: lifecycle.to_string(),
            created: Utc::now().to_rfc3339(),
        };
        let config = Config::new(
            serde_json::to_vec(&config)
                .map_err(|e| Error::internal(format!("config serialization failed: {e}")))?,
            CONFIG_MEDIA_TYPE.to_string(),
            None,
        );

        let reference = self.reference(tag);
        tokio::time::timeout(
            REGISTRY_TIMEOUT,
            self.client
                .push(&reference, &[layer], config, &self.auth, None),
        )
        .await
        .map_err(|_| Error::unavailable(format!("push of `{reference}` timed out")))?
        .map_err(|e| map_registry_error(&e.to_string()))?;

        self.fetch_digest(&reference).await
    }

    async fn fetch_digest(&self, reference: &Reference) -> Result<String> {
        tokio::time::timeout(
            REGISTRY_TIMEOUT,
            self.client.fetch_manifest_digest(reference, &self.auth),
        )
        .await
        .map_err(|_| Error::unavailable(format!("digest fetch for `{reference}` timed out")))?
        .map_err(|e| map_registry_error(&e.to_string()))
    }

    async fn pull_bundle(&self, reference: &Reference) -> Result<Bundle> {
        let image = tokio::time::timeout(
            REGISTRY_TIMEOUT,
            self.client
                .pull(reference, &self.auth, vec![LAYER_MEDIA_TYPE]),
        )
        .await
        .map_err(|_| Error::unavailable(format!("pull of `{reference}` timed out")))?
        .map_err(|e| map_registry_error(&e.to_string()))?;

        let layer = image
            .layers
            .first()
            .ok_or_else(|| Error::invalid(format!("`{reference}` carries no bundle layer")))?;
        unpack_bundle(&layer.data)
    }

    /// Removes the manifest a tag points at. Every lifecycle state has its
    /// own digest, so this retires exactly one tag.
    async fn delete_manifest(&self, digest: &str) -> Result<()> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            self.host, self.repository, digest
        );
        let client = reqwest::Client::new();
        let mut request = client.delete(&url).timeout(REGISTRY_TIMEOUT);
        if let RegistryAuth::Basic(user, pass) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("manifest delete failed: {e}")))?;

        match response.status().as_u16() {
            200..=299 | 404 => Ok(()),
            401 | 403 => Err(Error::Unauthorized(format!(
                "registry refused manifest delete for `{digest}`"
            ))),
            status => Err(Error::unavailable(format!(
                "registry returned {status} deleting `{digest}`"
            ))),
        }
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let reference = self.reference("latest");
        let response = tokio::time::timeout(
            REGISTRY_TIMEOUT,
            self.client.list_tags(&reference, &self.auth, None, None),
        )
        .await
        .map_err(|_| Error::unavailable("tag listing timed out"))?
        .map_err(|e| map_registry_error(&e.to_string()))?;
        Ok(response.tags)
    }

    async fn refresh_locked(&self, state: &mut RegistryState) -> Result<ChangeSet> {
        let tags = self.list_tags().await?;

        // tags can be re-pointed externally, so every refresh re-resolves
        // each revision tag to its current manifest digest
        let mut new_tags = HashMap::new();
        for tag in &tags {
            if parse_tag(&self.key, tag).is_none() {
                continue;
            }
            let digest = self.fetch_digest(&self.reference(tag)).await?;
            new_tags.insert(tag.clone(), digest);
        }

        let records = build_records(&self.key, &new_tags, &state.records);
        let change = diff_records(&state.records, &records);
        state.tags = new_tags;
        state.records = records;
        state.initialized = true;
        Ok(change)
    }

    async fn ensure_initialized(&self, state: &mut RegistryState) -> Result<()> {
        if !state.initialized {
            self.refresh_locked(state).await?;
        }
        Ok(())
    }

    fn latest_published(state: &RegistryState, package: &PackageName) -> Option<RevisionRecord> {
        state
            .records
            .values()
            .filter(|r| {
                &r.key.package == package
                    && matches!(
                        r.lifecycle,
                        Lifecycle::Published | Lifecycle::DeletionProposed
                    )
            })
            .max_by_key(|r| (r.key.revision.as_number(), r.created_at))
            .cloned()
    }
}

#[async_trait::async_trait]
impl Backend for OciBackend {
    fn key(&self) -> &RepoKey {
        &self.key
    }

    async fn list(&self) -> Result<Vec<RevisionRecord>> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        Ok(state.records.values().cloned().collect())
    }

    async fn read(&self, key: &RevisionKey) -> Result<Bundle> {
        let digest = {
            let mut state = self.state.lock().await;
            self.ensure_initialized(&mut state).await?;
            state
                .records
                .get(key)
                .map(|r| r.object.clone())
                .ok_or_else(|| Error::not_found(key))?
        };
        self.pull_bundle(&self.digest_reference(&digest)).await
    }

    async fn create_draft(
        &self,
        package: &PackageName,
        revision: &RevisionId,
    ) -> Result<DraftHandle> {
        let key = RevisionKey::new(self.key.clone(), package.clone(), revision.clone());
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        if state.records.contains_key(&key) {
            return Err(Error::conflict(format!("draft `{key}` already exists")));
        }

        let base = match Self::latest_published(&state, package) {
            Some(record) => {
                self.pull_bundle(&self.digest_reference(&record.object))
                    .await?
            },
            None => Bundle::new(),
        };

        let tag = Self::tag_for(&key, Lifecycle::Draft)?;
        let digest = self
            .push_bundle(&tag, &key, Lifecycle::Draft, &base)
            .await?;

        let record = RevisionRecord {
            key: key.clone(),
            lifecycle: Lifecycle::Draft,
            object: digest.clone(),
            created_at: Utc::now(),
        };
        state.tags.insert(tag, digest.clone());
        state.records.insert(key.clone(), record);
        Ok(DraftHandle {
            key,
            object: digest,
        })
    }

    async fn write_draft(
        &self,
        draft: &DraftHandle,
        resources: &Bundle,
        _message: &str,
    ) -> Result<DraftHandle> {
        let key = draft.key.clone();
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let tag = Self::tag_for(&key, Lifecycle::Draft)?;
        if !state.tags.contains_key(&tag) {
            return Err(Error::not_found(format!("draft `{key}`")));
        }
        let prior = state.tags.get(&tag).cloned();

        let digest = self
            .push_bundle(&tag, &key, Lifecycle::Draft, resources)
            .await?;
        if let Some(prior) = prior.filter(|p| p != &digest) {
            self.delete_manifest(&prior).await.ok();
        }

        let record = RevisionRecord {
            key: key.clone(),
            lifecycle: Lifecycle::Draft,
            object: digest.clone(),
            created_at: Utc::now(),
        };
        state.tags.insert(tag, digest.clone());
        state.records.insert(key.clone(), record);
        Ok(DraftHandle {
            key,
            object: digest,
        })
    }

    async fn publish_draft(
        &self,
        draft: &DraftHandle,
        revision: &RevisionId,
        _approver: &str,
    ) -> Result<RevisionRecord> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let published_key = RevisionKey::new(
            self.key.clone(),
            draft.key.package.clone(),
            revision.clone(),
        );
        let published_tag = Self::tag_for(&published_key, Lifecycle::Published)?;
        if state.tags.contains_key(&published_tag) {
            return Err(Error::conflict(format!(
                "revision `{published_key}` is already published"
            )));
        }

        // the draft sits under its proposed tag once submitted for review
        let proposed_tag = Self::tag_for(&draft.key, Lifecycle::Proposed)?;
        let drafts_tag = Self::tag_for(&draft.key, Lifecycle::Draft)?;
        let (source_tag, source_digest) = match state.tags.get(&proposed_tag) {
            Some(d) => (proposed_tag.clone(), d.clone()),
            None => (
                drafts_tag.clone(),
                state
                    .tags
                    .get(&drafts_tag)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("draft `{}`", draft.key)))?,
            ),
        };

        let bundle = self.pull_bundle(&self.digest_reference(&source_digest)).await?;
        let digest = self
            .push_bundle(
                &published_tag,
                &published_key,
                Lifecycle::Published,
                &bundle,
            )
            .await?;
        self.delete_manifest(&source_digest).await.ok();

        let record = RevisionRecord {
            key: published_key.clone(),
            lifecycle: Lifecycle::Published,
            object: digest.clone(),
            created_at: Utc::now(),
        };
        state.tags.remove(&source_tag);
        state.records.remove(&draft.key);
        state.tags.insert(published_tag, digest);
        state.records.insert(published_key, record.clone());
        Ok(record)
    }

    async fn move_draft(&self, key: &RevisionKey, to: Lifecycle) -> Result<RevisionRecord> {
        if !matches!(to, Lifecycle::Draft | Lifecycle::Proposed) {
            return Err(Error::invalid(format!("a draft cannot be moved to `{to}`")));
        }
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let from = match to {
            Lifecycle::Proposed => Lifecycle::Draft,
            _ => Lifecycle::Proposed,
        };
        let from_tag = Self::tag_for(key, from)?;
        let to_tag = Self::tag_for(key, to)?;
        let source_digest = state
            .tags
            .get(&from_tag)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("draft `{key}`")))?;

        let bundle = self.pull_bundle(&self.digest_reference(&source_digest)).await?;
        let digest = self.push_bundle(&to_tag, key, to, &bundle).await?;
        self.delete_manifest(&source_digest).await.ok();

        let record = RevisionRecord {
            key: key.clone(),
            lifecycle: to,
            object: digest.clone(),
            created_at: Utc::now(),
        };
        state.tags.remove(&from_tag);
        state.tags.insert(to_tag, digest);
        state.records.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn set_deletion_proposed(
        &self,
        key: &RevisionKey,
        proposed: bool,
    ) -> Result<RevisionRecord> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let record = state
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))?;
        let marker_tag = Self::tag_for(key, Lifecycle::DeletionProposed)?;

        if proposed {
            let bundle = self.pull_bundle(&self.digest_reference(&record.object)).await?;
            let digest = self
                .push_bundle(&marker_tag, key, Lifecycle::DeletionProposed, &bundle)
                .await?;
            state.tags.insert(marker_tag, digest);
        } else if let Some(digest) = state.tags.remove(&marker_tag) {
            self.delete_manifest(&digest).await.ok();
        }

        let lifecycle = if proposed {
            Lifecycle::DeletionProposed
        } else {
            Lifecycle::Published
        };
        let updated = RevisionRecord {
            lifecycle,
            ..record
        };
        state.records.insert(key.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &RevisionKey) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        if !state.records.contains_key(key) {
            return Err(Error::not_found(key));
        }

        for lifecycle in [
            Lifecycle::Draft,
            Lifecycle::Proposed,
            Lifecycle::Published,
            Lifecycle::DeletionProposed,
        ] {
            let tag = Self::tag_for(key, lifecycle)?;
            if let Some(digest) = state.tags.remove(&tag) {
                self.delete_manifest(&digest).await?;
            }
        }
        state.records.remove(key);
        Ok(())
    }

    async fn refresh(&self) -> Result<ChangeSet> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }
}

//================================================================================================
// Functions
//================================================================================================

/// Resolves an upstream image to its bundle and manifest digest, for lock
/// materialization on clone.
pub async fn resolve_upstream(image: &str) -> Result<(Bundle, String)> {
    let reference: Reference = image
        .parse()
        .map_err(|e| Error::invalid(format!("malformed image reference `{image}`: {e}")))?;
    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let digest = tokio::time::timeout(
        REGISTRY_TIMEOUT,
        client.fetch_manifest_digest(&reference, &auth),
    )
    .await
    .map_err(|_| Error::unavailable(format!("digest fetch for `{image}` timed out")))?
    .map_err(|e| map_registry_error(&e.to_string()))?;

    let image_data = tokio::time::timeout(
        REGISTRY_TIMEOUT,
        client.pull(&reference, &auth, vec![LAYER_MEDIA_TYPE]),
    )
    .await
    .map_err(|_| Error::unavailable(format!("pull of `{image}` timed out")))?
    .map_err(|e| map_registry_error(&e.to_string()))?;

    let layer = image_data
        .layers
        .first()
        .ok_or_else(|| Error::invalid(format!("`{image}` carries no bundle layer")))?;
    Ok((unpack_bundle(&layer.data)?, digest))
}

/// Serializes a bundle as a gzipped tar, one entry per file.
fn pack_bundle(bundle: &Bundle) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in bundle.iter() {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents)
            .map_err(|e| Error::internal(format!("bundle packing failed at `{path}`: {e}")))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| Error::internal(format!("bundle packing failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::internal(format!("bundle compression failed: {e}")))
}

/// Restores a bundle from its gzipped-tar layer, rejecting entries that
/// escape the bundle root.
fn unpack_bundle(data: &[u8]) -> Result<Bundle> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut bundle = Bundle::new();
    let entries = archive
        .entries()
        .map_err(|e| Error::invalid(format!("malformed bundle layer: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::invalid(format!("malformed bundle layer: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::invalid(format!("malformed bundle entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::invalid(format!("truncated bundle entry `{path}`: {e}")))?;
        bundle.insert(path, contents)?;
    }
    Ok(bundle)
}

/// Decodes a tag into its revision key, or `None` for tags that are not
/// package revisions.
fn parse_tag(key: &RepoKey, tag: &str) -> Option<(RevisionKey, Lifecycle)> {
    let (lifecycle, rest) = if let Some(rest) = tag.strip_prefix(DRAFTS_PREFIX) {
        (Lifecycle::Draft, rest)
    } else if let Some(rest) = tag.strip_prefix(PROPOSED_PREFIX) {
        (Lifecycle::Proposed, rest)
    } else if let Some(rest) = tag.strip_prefix(DELETION_PREFIX) {
        (Lifecycle::DeletionProposed, rest)
    } else {
        (Lifecycle::Published, tag)
    };
    let (package, revision) = rest.split_once(SEPARATOR)?;
    let package = PackageName::new(package).ok()?;
    let revision = RevisionId::new(revision).ok()?;
    Some((
        RevisionKey::new(key.clone(), package, revision),
        lifecycle,
    ))
}

/// Derives revision records from a tag → digest map, applying the same
/// shadowing rules as the git backend: drafts win ties, deletion markers
/// upgrade `Published`.
fn build_records(
    key: &RepoKey,
    tags: &HashMap<String, String>,
    prior: &HashMap<RevisionKey, RevisionRecord>,
) -> HashMap<RevisionKey, RevisionRecord> {
    let mut records: HashMap<RevisionKey, RevisionRecord> = HashMap::new();
    let mut published: Vec<(RevisionKey, String)> = Vec::new();
    let mut deletion_proposed = std::collections::HashSet::new();

    for (tag, digest) in tags {
        let Some((rev_key, lifecycle)) = parse_tag(key, tag) else {
            continue;
        };
        match lifecycle {
            Lifecycle::Published => published.push((rev_key, digest.clone())),
            Lifecycle::DeletionProposed => {
                deletion_proposed.insert(rev_key);
            },
            lifecycle => {
                let created_at = prior
                    .get(&rev_key)
                    .filter(|r| r.object == *digest)
                    .map(|r| r.created_at)
                    .unwrap_or_else(Utc::now);
                records.insert(
                    rev_key.clone(),
                    RevisionRecord {
                        key: rev_key,
                        lifecycle,
                        object: digest.clone(),
                        created_at,
                    },
                );
            },
        }
    }

    for (rev_key, digest) in published {
        if records.contains_key(&rev_key) {
            continue;
        }
        let lifecycle = if deletion_proposed.contains(&rev_key) {
            Lifecycle::DeletionProposed
        } else {
            Lifecycle::Published
        };
        let created_at = prior
            .get(&rev_key)
            .filter(|r| r.object == digest)
            .map(|r| r.created_at)
            .unwrap_or_else(Utc::now);
        records.insert(
            rev_key.clone(),
            RevisionRecord {
                key: rev_key,
                lifecycle,
                object: digest,
                created_at,
            },
        );
    }
    records
}

fn map_registry_error(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication") {
        Error::Unauthorized(message.to_string())
    } else if lower.contains("404") || lower.contains("not found") {
        Error::not_found(message)
    } else {
        Error::unavailable(message.to_string())
    }
}

//================================================================================================
// Tests
//================================================================================================

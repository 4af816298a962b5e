//! # Package Revision Engine
//!
//! The engine owns the lifecycle state machine and is the only path by
//! which package revisions are mutated. Reads are served straight from the
//! [`RepoCache`]; every mutation runs on a *per-package lane*, a single
//! worker task draining a queue, so that all mutations of one package are
//! totally ordered no matter how many clients race.
//!
//! ## Operations
//!
//! | operation        | precondition           | postcondition |
//! |------------------|------------------------|---------------|
//! | `create_draft`   | repository registered  | new `Draft` |
//! | `clone_package`  | upstream resolvable    | new `Draft`, manifest carries upstream + lock |
//! | `update_resources` | `Draft`              | bundle replaced, render status recomputed |
//! | `propose`        | `Draft`, render ok     | `Proposed` |
//! | `reject`         | `Proposed`             | `Draft` |
//! | `approve`        | `Proposed`             | `Published`, id assigned when sentinel |
//! | `propose_delete` | `Published`            | `DeletionProposed` |
//! | `rescind_delete` | `DeletionProposed`     | `Published` |
//! | `delete`         | `Draft`/`DeletionProposed` | removed |
//!
//! ## Conflict handling
//!
//! Transient backend failures are retried with exponential backoff inside
//! the lane. When a backend rejects a write outright the engine refreshes
//! the package's repository, re-evaluates the operation's preconditions,
//! and retries once for label-only moves; content writes surface the
//! conflict to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::bundle::{self, Bundle};
use crate::cache::RepoCache;
use crate::core::{
    FunctionOutcome, Lifecycle, PackageName, RenderStatus, RepoKey, RevisionId, RevisionKey,
    RevisionRecord,
};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Upstream, UpstreamKind, UpstreamLock};
use crate::render::Renderer;
use crate::storage::{self, Backend, DraftHandle, Repository};

//================================================================================================
// Constants
//================================================================================================

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

//================================================================================================
// Types
//================================================================================================

/// The package revision engine.
pub struct Engine {
    cache: Arc<RepoCache>,
    renderer: Arc<Renderer>,
    lanes: StdMutex<HashMap<(RepoKey, PackageName), Lane>>,
    git_cache_root: PathBuf,
}

/// A package revision as surfaced to the API layer: the backend record plus
/// the engine's render bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRevision {
    /// The revision's record.
    pub record: RevisionRecord,
    /// The outcome of the last pipeline run, if one happened.
    pub render: Option<RenderStatus>,
}

/// One package's serialized mutation queue.
#[derive(Clone)]
struct Lane {
    tx: mpsc::Sender<Job>,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

//================================================================================================
// Impls
//================================================================================================

impl Lane {
    fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Lane { tx }
    }

    /// Queues a mutation and awaits its outcome.
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Box::pin(async move {
                tx.send(fut.await).ok();
            }))
            .await
            .map_err(|_| Error::internal("mutation lane is closed"))?;
        rx.await
            .map_err(|_| Error::internal("mutation lane dropped the operation"))?
    }
}

impl Engine {
    /// An engine over the given cache and renderer.
    pub fn new(cache: Arc<RepoCache>, renderer: Arc<Renderer>) -> Self {
        Engine {
            cache,
            renderer,
            lanes: StdMutex::new(HashMap::new()),
            git_cache_root: config::CONFIG.cache.root.join("git"),
        }
    }

    /// Overrides where upstream git mirrors are kept (used by tests).
    pub fn with_git_cache_root(mut self, root: PathBuf) -> Self {
        self.git_cache_root = root;
        self
    }

    /// The cache this engine serves reads from.
    pub fn cache(&self) -> &Arc<RepoCache> {
        &self.cache
    }

    /// Registers a repository, opening the backend its declaration names.
    pub async fn register_repository(&self, repository: Repository) -> Result<()> {
        let backend = storage::open(&repository)?;
        self.cache.register(repository, backend).await
    }

    /// Registers a repository with an explicitly constructed backend.
    pub async fn register_with_backend(
        &self,
        repository: Repository,
        backend: Arc<dyn Backend>,
    ) -> Result<()> {
        self.cache.register(repository, backend).await
    }

    /// Deregisters a repository, stopping its refresh task.
    pub async fn deregister_repository(&self, key: &RepoKey) -> Result<()> {
        self.cache.deregister(key).await
    }

    /// Lists revisions, optionally filtered by repository and package.
    pub async fn list(
        &self,
        repo: Option<&RepoKey>,
        package: Option<&PackageName>,
    ) -> Vec<PackageRevision> {
        let records = self.cache.list(repo, package).await;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let render = self.cache.render_status(&record.key).await.ok().flatten();
            out.push(PackageRevision { record, render });
        }
        out
    }

    /// One revision's record and render status.
    pub async fn get(&self, key: &RevisionKey) -> Result<PackageRevision> {
        let record = self.cache.get(key).await?;
        let render = self.cache.render_status(key).await?;
        Ok(PackageRevision { record, render })
    }

    /// One revision's full contents.
    pub async fn read_resources(&self, key: &RevisionKey) -> Result<Bundle> {
        self.cache.read(key).await
    }

    /// Creates an empty draft holding a fresh manifest.
    pub async fn create_draft(
        &self,
        repo: &RepoKey,
        package: &PackageName,
        revision: Option<RevisionId>,
    ) -> Result<PackageRevision> {
        let revision = revision.unwrap_or_else(RevisionId::draft);
        let cache = Arc::clone(&self.cache);
        let (repo, package) = (repo.clone(), package.clone());

        self.lane(&repo, &package)
            .run(async move {
                let entry = cache.entry(&repo).await?;
                let backend = Arc::clone(&entry.backend);

                let mut bundle = Bundle::new();
                bundle.insert(
                    crate::MANIFEST_FILE.as_str(),
                    Manifest::init(&package).to_bytes()?,
                )?;

                let draft = retry({
                    let backend = Arc::clone(&backend);
                    let (package, revision) = (package.clone(), revision.clone());
                    move || {
                        let backend = Arc::clone(&backend);
                        let (package, revision) = (package.clone(), revision.clone());
                        async move { backend.create_draft(&package, &revision).await }
                    }
                })
                .await?;

                let draft = retry({
                    let backend = Arc::clone(&backend);
                    let (draft, bundle) = (draft.clone(), bundle.clone());
                    move || {
                        let backend = Arc::clone(&backend);
                        let (draft, bundle) = (draft.clone(), bundle.clone());
                        async move {
                            backend
                                .write_draft(&draft, &bundle, "Initialize package")
                                .await
                        }
                    }
                })
                .await?;

                let record = RevisionRecord {
                    key: draft.key.clone(),
                    lifecycle: Lifecycle::Draft,
                    object: draft.object.clone(),
                    created_at: Utc::now(),
                };
                cache.apply_local(record.clone()).await;
                let status = RenderStatus::success();
                cache
                    .set_render_status(&draft.key, status.clone())
                    .await
                    .ok();
                Ok(PackageRevision {
                    record,
                    render: Some(status),
                })
            })
            .await
    }

    /// Clones an upstream package into `repo` as a new draft, pinning the
    /// upstream lock into the manifest before the first commit.
    pub async fn clone_package(
        &self,
        repo: &RepoKey,
        package: &PackageName,
        upstream: Upstream,
        revision: Option<RevisionId>,
    ) -> Result<PackageRevision> {
        let revision = revision.unwrap_or_else(RevisionId::draft);
        let cache = Arc::clone(&self.cache);
        let renderer = Arc::clone(&self.renderer);
        let git_cache_root = self.git_cache_root.clone();
        let (repo, package) = (repo.clone(), package.clone());

        self.lane(&repo, &package)
            .run(async move {
                let entry = cache.entry(&repo).await?;
                let backend = Arc::clone(&entry.backend);

                let (mut bundle, lock) =
                    resolve_upstream(&upstream, &git_cache_root).await?;

                // the lock is written exactly once, here, before the first
                // commit of the clone
                let mut manifest = match bundle.manifest_bytes() {
                    Some(bytes) => Manifest::parse(bytes)?,
                    None => Manifest::init(&package),
                };
                manifest.set_upstream(&upstream)?;
                manifest.set_upstream_lock(&lock)?;
                bundle.insert(crate::MANIFEST_FILE.as_str(), manifest.to_bytes()?)?;

                let draft = backend.create_draft(&package, &revision).await?;
                let (stored, status) = render_or_status(&renderer, &bundle).await;
                let message = format!("Clone {}", describe_upstream(&upstream));
                let draft = retry({
                    let backend = Arc::clone(&backend);
                    let (draft, stored, message) =
                        (draft.clone(), stored.clone(), message.clone());
                    move || {
                        let backend = Arc::clone(&backend);
                        let (draft, stored, message) =
                            (draft.clone(), stored.clone(), message.clone());
                        async move { backend.write_draft(&draft, &stored, &message).await }
                    }
                })
                .await?;

                let record = RevisionRecord {
                    key: draft.key.clone(),
                    lifecycle: Lifecycle::Draft,
                    object: draft.object.clone(),
                    created_at: Utc::now(),
                };
                cache.apply_local(record.clone()).await;
                cache
                    .set_render_status(&draft.key, status.clone())
                    .await
                    .ok();
                Ok(PackageRevision {
                    record,
                    render: Some(status),
                })
            })
            .await
    }

    /// Replaces a draft's bundle, re-running the declared pipeline.
    ///
    /// The upstream lock pinned at clone time survives whatever the caller
    /// sent. A failing pipeline does not reject the update; the failure is
    /// recorded and blocks `propose` instead.
    pub async fn update_resources(
        &self,
        key: &RevisionKey,
        resources: Bundle,
    ) -> Result<PackageRevision> {
        bundle::validate(&resources)?;
        let cache = Arc::clone(&self.cache);
        let renderer = Arc::clone(&self.renderer);
        let key = key.clone();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                if !record.lifecycle.mutable() {
                    return Err(Error::conflict(format!(
                        "revision `{key}` is {}; only drafts can be edited",
                        record.lifecycle
                    )));
                }
                let entry = cache.entry(&key.repo).await?;
                let backend = Arc::clone(&entry.backend);

                let resources = preserve_lock(&cache, &key, resources).await?;
                let (stored, status) = render_or_status(&renderer, &resources).await;

                let handle = DraftHandle {
                    key: key.clone(),
                    object: record.object.clone(),
                };
                let write = retry({
                    let backend = Arc::clone(&backend);
                    let (handle, stored) = (handle.clone(), stored.clone());
                    move || {
                        let backend = Arc::clone(&backend);
                        let (handle, stored) = (handle.clone(), stored.clone());
                        async move {
                            backend.write_draft(&handle, &stored, "Update resources").await
                        }
                    }
                })
                .await;

                let draft = match write {
                    Ok(draft) => draft,
                    Err(e @ Error::Conflict(_)) => {
                        // someone moved the draft under us; resync and report
                        cache.refresh_repo(&key.repo).await.ok();
                        return Err(e);
                    },
                    Err(e) => return Err(e),
                };

                let record = RevisionRecord {
                    key: draft.key.clone(),
                    lifecycle: Lifecycle::Draft,
                    object: draft.object.clone(),
                    created_at: record.created_at,
                };
                cache.apply_local(record.clone()).await;
                cache
                    .set_render_status(&draft.key, status.clone())
                    .await
                    .ok();
                Ok(PackageRevision {
                    record,
                    render: Some(status),
                })
            })
            .await
    }

    /// Submits a draft for review.
    pub async fn propose(&self, key: &RevisionKey) -> Result<PackageRevision> {
        let cache = Arc::clone(&self.cache);
        let renderer = Arc::clone(&self.renderer);
        let key = key.clone();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                check_transition(&record, Lifecycle::Proposed)?;

                // a draft whose pipeline failed cannot be proposed
                let status = match cache.render_status(&key).await? {
                    Some(status) => status,
                    None => {
                        // discovered externally; render now to find out
                        let bundle = cache.read(&key).await?;
                        let (_, status) = render_or_status(&renderer, &bundle).await;
                        cache.set_render_status(&key, status.clone()).await.ok();
                        status
                    },
                };
                if !status.ok {
                    return Err(Error::conflict(format!(
                        "revision `{key}` has a failing pipeline; fix it before proposing"
                    )));
                }

                let entry = cache.entry(&key.repo).await?;
                let record =
                    move_with_reconcile(&cache, &entry.backend, &key, Lifecycle::Proposed).await?;
                cache.apply_local(record.clone()).await;
                Ok(PackageRevision {
                    record,
                    render: Some(status),
                })
            })
            .await
    }

    /// Returns a proposed draft to its author.
    pub async fn reject(&self, key: &RevisionKey) -> Result<PackageRevision> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                check_transition(&record, Lifecycle::Draft)?;

                let entry = cache.entry(&key.repo).await?;
                let record =
                    move_with_reconcile(&cache, &entry.backend, &key, Lifecycle::Draft).await?;
                cache.apply_local(record.clone()).await;
                let render = cache.render_status(&key).await.ok().flatten();
                Ok(PackageRevision { record, render })
            })
            .await
    }

    /// Approves a proposed draft, publishing it under its assigned
    /// revision id.
    ///
    /// Drafts whose id is the `draft` sentinel (or any label outside the
    /// `v<integer>` sequence) receive the next integer id past the highest
    /// published one; ids that are already numeric publish as themselves.
    pub async fn approve(&self, key: &RevisionKey, approver: &str) -> Result<PackageRevision> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        let approver = approver.to_string();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                check_transition(&record, Lifecycle::Published)?;

                let entry = cache.entry(&key.repo).await?;
                let backend = Arc::clone(&entry.backend);
                let handle = DraftHandle {
                    key: key.clone(),
                    object: record.object.clone(),
                };

                let mut assigned = match key.revision.as_number() {
                    Some(_) => key.revision.clone(),
                    None => next_revision(&cache, &key.repo, &key.package).await,
                };

                // reconcile a racing publication once; a second conflict
                // goes back to the caller
                let mut reconciled = false;
                let published = loop {
                    let publish = retry({
                        let backend = Arc::clone(&backend);
                        let (handle, assigned, approver) =
                            (handle.clone(), assigned.clone(), approver.clone());
                        move || {
                            let backend = Arc::clone(&backend);
                            let (handle, assigned, approver) =
                                (handle.clone(), assigned.clone(), approver.clone());
                            async move {
                                backend.publish_draft(&handle, &assigned, &approver).await
                            }
                        }
                    })
                    .await;

                    match publish {
                        Ok(published) => break published,
                        Err(Error::Conflict(_))
                            if !reconciled && key.revision.as_number().is_none() =>
                        {
                            // an id raced into existence; resync and take
                            // the next one
                            reconciled = true;
                            cache.refresh_repo(&key.repo).await?;
                            let next = next_revision(&cache, &key.repo, &key.package).await;
                            if next == assigned {
                                return Err(Error::conflict(format!(
                                    "revision id `{assigned}` already exists for `{}`",
                                    key.package
                                )));
                            }
                            assigned = next;
                        },
                        Err(e) => return Err(e),
                    }
                };

                cache.remove_local(&key).await;
                cache.apply_local(published.clone()).await;
                Ok(PackageRevision {
                    record: published,
                    render: None,
                })
            })
            .await
    }

    /// Requests removal of a published revision.
    pub async fn propose_delete(&self, key: &RevisionKey) -> Result<PackageRevision> {
        self.set_deletion(key, true).await
    }

    /// Withdraws a deletion request, restoring `Published`.
    pub async fn rescind_delete(&self, key: &RevisionKey) -> Result<PackageRevision> {
        self.set_deletion(key, false).await
    }

    /// Removes a draft or a deletion-proposed revision from its backend.
    pub async fn delete(&self, key: &RevisionKey) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                if !record.lifecycle.deletable() {
                    return Err(Error::conflict(format!(
                        "revision `{key}` is {}; propose deletion first",
                        record.lifecycle
                    )));
                }
                let entry = cache.entry(&key.repo).await?;
                let backend = Arc::clone(&entry.backend);
                retry({
                    let backend = Arc::clone(&backend);
                    let key = key.clone();
                    move || {
                        let backend = Arc::clone(&backend);
                        let key = key.clone();
                        async move { backend.delete(&key).await }
                    }
                })
                .await?;
                cache.remove_local(&key).await;
                Ok(())
            })
            .await
    }

    async fn set_deletion(&self, key: &RevisionKey, proposed: bool) -> Result<PackageRevision> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();

        self.lane(&key.repo, &key.package)
            .run(async move {
                let record = cache.get(&key).await?;
                let target = if proposed {
                    Lifecycle::DeletionProposed
                } else {
                    Lifecycle::Published
                };
                if proposed {
                    check_transition(&record, target)?;
                } else if record.lifecycle != Lifecycle::DeletionProposed {
                    return Err(Error::conflict(format!(
                        "revision `{key}` is {}; no deletion to rescind",
                        record.lifecycle
                    )));
                }

                let entry = cache.entry(&key.repo).await?;
                let record = entry.backend.set_deletion_proposed(&key, proposed).await?;
                cache.apply_local(record.clone()).await;
                Ok(PackageRevision {
                    record,
                    render: None,
                })
            })
            .await
    }

    fn lane(&self, repo: &RepoKey, package: &PackageName) -> Lane {
        let mut lanes = self.lanes.lock().expect("lane map poisoned");
        lanes
            .entry((repo.clone(), package.clone()))
            .or_insert_with(Lane::new)
            .clone()
    }
}

//================================================================================================
// Functions
//================================================================================================

/// Resolves an upstream locator to its contents and pinned lock.
async fn resolve_upstream(
    upstream: &Upstream,
    git_cache_root: &std::path::Path,
) -> Result<(Bundle, UpstreamLock)> {
    match upstream.kind {
        UpstreamKind::Git => {
            let git = upstream
                .git
                .as_ref()
                .ok_or_else(|| Error::invalid("git upstream lacks its locator"))?;
            let (bundle, commit) = storage::git::resolve_upstream(
                &git.repo,
                &git.reference,
                &git.directory,
                git_cache_root,
            )
            .await?;
            Ok((bundle, UpstreamLock::git(git, commit)))
        },
        UpstreamKind::Oci => {
            let oci = upstream
                .oci
                .as_ref()
                .ok_or_else(|| Error::invalid("oci upstream lacks its locator"))?;
            let (bundle, digest) = storage::oci::resolve_upstream(&oci.image).await?;
            Ok((bundle, UpstreamLock::oci(&oci.image, digest)))
        },
    }
}

fn describe_upstream(upstream: &Upstream) -> String {
    match (&upstream.git, &upstream.oci) {
        (Some(git), _) => format!("{}@{}", git.repo, git.reference),
        (_, Some(oci)) => oci.image.clone(),
        _ => "upstream".to_string(),
    }
}

/// Restores the stored manifest lock (and, if the caller dropped the
/// manifest entirely, the stored manifest) into an incoming bundle.
async fn preserve_lock(
    cache: &Arc<RepoCache>,
    key: &RevisionKey,
    mut resources: Bundle,
) -> Result<Bundle> {
    let stored = cache.read(key).await?;
    let Some(stored_manifest) = stored.manifest_bytes() else {
        return Ok(resources);
    };

    match resources.manifest_bytes() {
        None => {
            resources.insert(crate::MANIFEST_FILE.as_str(), stored_manifest.to_vec())?;
        },
        Some(incoming) => {
            let stored_lock = Manifest::parse(stored_manifest)?.upstream_lock()?;
            if let Some(lock) = stored_lock {
                let mut manifest = Manifest::parse(incoming)?;
                if manifest.upstream_lock()?.as_ref() != Some(&lock) {
                    manifest.set_upstream_lock(&lock)?;
                    resources.insert(crate::MANIFEST_FILE.as_str(), manifest.to_bytes()?)?;
                }
            }
        },
    }
    Ok(resources)
}

/// Runs the pipeline, folding transport failures into a failing status so
/// a draft is never lost to a rendering problem.
async fn render_or_status(renderer: &Arc<Renderer>, bundle: &Bundle) -> (Bundle, RenderStatus) {
    match renderer.render(bundle).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "pipeline execution failed");
            (
                bundle.clone(),
                RenderStatus {
                    ok: false,
                    results: vec![FunctionOutcome {
                        image: "pipeline".to_string(),
                        exit_code: -1,
                        message: e.to_string(),
                    }],
                },
            )
        },
    }
}

fn check_transition(record: &RevisionRecord, to: Lifecycle) -> Result<()> {
    if record.lifecycle.can_transition(to) {
        Ok(())
    } else {
        Err(Error::conflict(format!(
            "revision `{}` is {}; cannot move to {to}",
            record.key, record.lifecycle
        )))
    }
}

/// The next integer revision id for a package: one past the highest
/// published `v<n>`. Ids outside that form are skipped, not errors.
async fn next_revision(cache: &Arc<RepoCache>, repo: &RepoKey, package: &PackageName) -> RevisionId {
    let highest = cache
        .list(Some(repo), Some(package))
        .await
        .into_iter()
        .filter(|r| {
            matches!(
                r.lifecycle,
                Lifecycle::Published | Lifecycle::DeletionProposed
            )
        })
        .filter_map(|r| r.key.revision.as_number())
        .max()
        .unwrap_or(0);
    RevisionId::from_number(highest + 1)
}

/// Moves a draft between lifecycle locations, reconciling once on
/// conflict: refresh, recheck the precondition, retry.
async fn move_with_reconcile(
    cache: &Arc<RepoCache>,
    backend: &Arc<dyn Backend>,
    key: &RevisionKey,
    to: Lifecycle,
) -> Result<RevisionRecord> {
    match backend.move_draft(key, to).await {
        Ok(record) => Ok(record),
        Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => {
            cache.refresh_repo(&key.repo).await?;
            let record = cache.get(key).await?;
            check_transition(&record, to)?;
            backend.move_draft(key, to).await
        },
        Err(e) => Err(e),
    }
}

/// Retries transient failures with exponential backoff.
async fn retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "transient backend failure; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            },
            other => return other,
        }
    }
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_BODY_BUDGET;
    use crate::render::{Evaluated, FunctionEvaluator};
    use crate::storage::{BackendSpec, ChangeSet};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// An in-memory backend faithful to the trait contract, for exercising
    /// the engine without a remote.
    struct MemBackend {
        key: RepoKey,
        state: StdMutex<MemState>,
        gen: AtomicU64,
    }

    #[derive(Default)]
    struct MemState {
        revisions: HashMap<RevisionKey, (Lifecycle, Bundle, String)>,
    }

    impl MemBackend {
        fn new(key: RepoKey) -> Arc<Self> {
            Arc::new(MemBackend {
                key,
                state: StdMutex::new(MemState::default()),
                gen: AtomicU64::new(1),
            })
        }

        fn next_object(&self) -> String {
            format!("object-{}", self.gen.fetch_add(1, Ordering::Relaxed))
        }

        fn record(&self, key: &RevisionKey, lifecycle: Lifecycle, object: &str) -> RevisionRecord {
            RevisionRecord {
                key: key.clone(),
                lifecycle,
                object: object.to_string(),
                created_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl Backend for MemBackend {
        fn key(&self) -> &RepoKey {
            &self.key
        }

        async fn list(&self) -> Result<Vec<RevisionRecord>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .revisions
                .iter()
                .map(|(k, (l, _, o))| self.record(k, *l, o))
                .collect())
        }

        async fn read(&self, key: &RevisionKey) -> Result<Bundle> {
            let state = self.state.lock().unwrap();
            state
                .revisions
                .get(key)
                .map(|(_, b, _)| b.clone())
                .ok_or_else(|| Error::not_found(key))
        }

        async fn create_draft(
            &self,
            package: &PackageName,
            revision: &RevisionId,
        ) -> Result<DraftHandle> {
            let key = RevisionKey::new(self.key.clone(), package.clone(), revision.clone());
            let mut state = self.state.lock().unwrap();
            if state.revisions.contains_key(&key) {
                return Err(Error::conflict("draft exists"));
            }
            let object = self.next_object();
            state
                .revisions
                .insert(key.clone(), (Lifecycle::Draft, Bundle::new(), object.clone()));
            Ok(DraftHandle { key, object })
        }

        async fn write_draft(
            &self,
            draft: &DraftHandle,
            resources: &Bundle,
            _message: &str,
        ) -> Result<DraftHandle> {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .revisions
                .get_mut(&draft.key)
                .ok_or_else(|| Error::not_found(&draft.key))?;
            let object = self.next_object();
            entry.1 = resources.clone();
            entry.2 = object.clone();
            Ok(DraftHandle {
                key: draft.key.clone(),
                object,
            })
        }

        async fn publish_draft(
            &self,
            draft: &DraftHandle,
            revision: &RevisionId,
            _approver: &str,
        ) -> Result<RevisionRecord> {
            let published =
                RevisionKey::new(self.key.clone(), draft.key.package.clone(), revision.clone());
            let mut state = self.state.lock().unwrap();
            if state
                .revisions
                .get(&published)
                .is_some_and(|(l, _, _)| !matches!(l, Lifecycle::Draft | Lifecycle::Proposed))
            {
                return Err(Error::conflict("revision already published"));
            }
            let (_, bundle, _) = state
                .revisions
                .remove(&draft.key)
                .ok_or_else(|| Error::not_found(&draft.key))?;
            let object = self.next_object();
            state
                .revisions
                .insert(published.clone(), (Lifecycle::Published, bundle, object.clone()));
            Ok(self.record(&published, Lifecycle::Published, &object))
        }

        async fn move_draft(&self, key: &RevisionKey, to: Lifecycle) -> Result<RevisionRecord> {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .revisions
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key))?;
            entry.0 = to;
            let object = entry.2.clone();
            Ok(self.record(key, to, &object))
        }

        async fn set_deletion_proposed(
            &self,
            key: &RevisionKey,
            proposed: bool,
        ) -> Result<RevisionRecord> {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .revisions
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key))?;
            entry.0 = if proposed {
                Lifecycle::DeletionProposed
            } else {
                Lifecycle::Published
            };
            let (lifecycle, object) = (entry.0, entry.2.clone());
            Ok(self.record(key, lifecycle, &object))
        }

        async fn delete(&self, key: &RevisionKey) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state
                .revisions
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(key))
        }

        async fn refresh(&self) -> Result<ChangeSet> {
            Ok(ChangeSet::default())
        }
    }

    struct OkEvaluator;

    #[async_trait]
    impl FunctionEvaluator for OkEvaluator {
        async fn evaluate(
            &self,
            _image: &str,
            resource_list: Vec<u8>,
            _config: Option<Vec<u8>>,
        ) -> Result<Evaluated> {
            Ok(Evaluated {
                resource_list,
                log: Vec::new(),
                exit_code: 0,
                message: String::new(),
            })
        }
    }

    struct FailEvaluator;

    #[async_trait]
    impl FunctionEvaluator for FailEvaluator {
        async fn evaluate(
            &self,
            _image: &str,
            _resource_list: Vec<u8>,
            _config: Option<Vec<u8>>,
        ) -> Result<Evaluated> {
            Ok(Evaluated {
                resource_list: Vec::new(),
                log: b"exit status 1".to_vec(),
                exit_code: 1,
                message: "function rejected the input".to_string(),
            })
        }
    }

    async fn engine_with(evaluator: Arc<dyn FunctionEvaluator>) -> (Engine, RepoKey) {
        let key = RepoKey::new("default", "blueprints");
        let cache = RepoCache::new(DEFAULT_BODY_BUDGET);
        let engine = Engine::new(cache, Arc::new(Renderer::new(evaluator)));
        let repository = Repository {
            key: key.clone(),
            spec: BackendSpec::Git {
                url: "https://example.invalid/repo.git".into(),
                directory: String::new(),
            },
            credentials: None,
            deployment: false,
            poll_interval: Some(Duration::from_secs(3600)),
        };
        engine
            .register_with_backend(repository, MemBackend::new(key.clone()))
            .await
            .unwrap();
        (engine, key)
    }

    fn pkg(name: &str) -> PackageName {
        PackageName::new(name).unwrap()
    }

    #[tokio::test]
    async fn init_creates_a_draft_with_a_manifest() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let revision = engine.create_draft(&repo, &pkg("basens"), None).await.unwrap();

        assert_eq!(revision.record.lifecycle, Lifecycle::Draft);
        assert!(revision.record.key.revision.is_draft());

        let bundle = engine.read_resources(&revision.record.key).await.unwrap();
        let manifest = Manifest::parse(bundle.manifest_bytes().unwrap()).unwrap();
        assert!(manifest.upstream().unwrap().is_none());
    }

    #[tokio::test]
    async fn propose_approve_assigns_first_revision() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let draft = engine.create_draft(&repo, &pkg("basens"), None).await.unwrap();
        let key = draft.record.key.clone();

        engine.propose(&key).await.unwrap();
        let published = engine.approve(&key, "alice").await.unwrap();

        assert_eq!(published.record.lifecycle, Lifecycle::Published);
        assert_eq!(published.record.key.revision.as_str(), "v1");

        // the draft entry is gone; only the published revision remains
        let listed = engine.list(Some(&repo), Some(&pkg("basens"))).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.key.revision.as_str(), "v1");
    }

    #[tokio::test]
    async fn sequential_approvals_never_share_an_id() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let package = pkg("basens");

        for expected in ["v1", "v2"] {
            let draft = engine
                .create_draft(&repo, &package, None)
                .await
                .unwrap();
            let key = draft.record.key.clone();
            engine.propose(&key).await.unwrap();
            let published = engine.approve(&key, "alice").await.unwrap();
            assert_eq!(published.record.key.revision.as_str(), expected);
        }
    }

    #[tokio::test]
    async fn non_numeric_ids_sit_outside_the_sequence() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let package = pkg("basens");

        // publish a revision under a label outside the numeric sequence
        let draft = engine
            .create_draft(&repo, &package, Some(RevisionId::new("stable").unwrap()))
            .await
            .unwrap();
        let key = draft.record.key.clone();
        engine.propose(&key).await.unwrap();
        let published = engine.approve(&key, "alice").await.unwrap();
        // a non-numeric draft id is replaced by an assigned integer
        assert_eq!(published.record.key.revision.as_str(), "v1");

        let draft = engine.create_draft(&repo, &package, None).await.unwrap();
        let key = draft.record.key.clone();
        engine.propose(&key).await.unwrap();
        let published = engine.approve(&key, "alice").await.unwrap();
        assert_eq!(published.record.key.revision.as_str(), "v2");
    }

    #[tokio::test]
    async fn failing_pipeline_blocks_propose() {
        let (engine, repo) = engine_with(Arc::new(FailEvaluator)).await;
        let draft = engine.create_draft(&repo, &pkg("basens"), None).await.unwrap();
        let key = draft.record.key.clone();

        let mut bundle = engine.read_resources(&key).await.unwrap();
        bundle
            .insert(
                "Pkgfile",
                "\
apiVersion: orchard.dev/v1
kind: Pkgfile
metadata:
  name: basens
pipeline:
  functions:
    - image: broken:v1
",
            )
            .unwrap();

        // the update itself succeeds; the failure is recorded
        let updated = engine.update_resources(&key, bundle).await.unwrap();
        let render = updated.render.unwrap();
        assert!(!render.ok);
        assert_eq!(render.results[0].exit_code, 1);

        match engine.propose(&key).await {
            Err(Error::Conflict(_)) => {},
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn published_revisions_cannot_be_edited_or_deleted_directly() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let draft = engine.create_draft(&repo, &pkg("basens"), None).await.unwrap();
        let key = draft.record.key.clone();
        engine.propose(&key).await.unwrap();
        let published = engine.approve(&key, "alice").await.unwrap();
        let published_key = published.record.key.clone();

        assert!(matches!(
            engine
                .update_resources(&published_key, Bundle::new())
                .await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            engine.delete(&published_key).await,
            Err(Error::Conflict(_))
        ));

        engine.propose_delete(&published_key).await.unwrap();
        engine.delete(&published_key).await.unwrap();
        assert!(engine.get(&published_key).await.is_err());
    }

    #[tokio::test]
    async fn reject_returns_a_proposal_to_draft() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let draft = engine.create_draft(&repo, &pkg("basens"), None).await.unwrap();
        let key = draft.record.key.clone();

        engine.propose(&key).await.unwrap();
        let rejected = engine.reject(&key).await.unwrap();
        assert_eq!(rejected.record.lifecycle, Lifecycle::Draft);

        // and the round trip can happen again
        engine.propose(&key).await.unwrap();
    }

    #[tokio::test]
    async fn lock_survives_resource_edits() {
        let (engine, repo) = engine_with(Arc::new(OkEvaluator)).await;
        let draft = engine.create_draft(&repo, &pkg("clone"), None).await.unwrap();
        let key = draft.record.key.clone();

        // simulate a clone by writing a locked manifest
        let mut bundle = Bundle::new();
        bundle
            .insert(
                "Pkgfile",
                "\
apiVersion: orchard.dev/v1
kind: Pkgfile
metadata:
  name: clone
upstreamLock:
  type: git
  git:
    repo: https://example.com/up.git
    ref: basens/v1
    directory: basens
    commit: 1111111111111111111111111111111111111111
",
            )
            .unwrap();
        engine.update_resources(&key, bundle).await.unwrap();

        // a later edit tries to tamper with the lock
        let mut tampered = Bundle::new();
        tampered
            .insert(
                "Pkgfile",
                "\
apiVersion: orchard.dev/v1
kind: Pkgfile
metadata:
  name: clone
upstreamLock:
  type: git
  git:
    repo: https://example.com/up.git
    ref: basens/v1
    directory: basens
    commit: 2222222222222222222222222222222222222222
",
            )
            .unwrap();
        engine.update_resources(&key, tampered).await.unwrap();

        let bundle = engine.read_resources(&key).await.unwrap();
        let manifest = Manifest::parse(bundle.manifest_bytes().unwrap()).unwrap();
        let lock = manifest.upstream_lock().unwrap().unwrap();
        assert_eq!(
            lock.git.unwrap().commit,
            "1111111111111111111111111111111111111111"
        );
    }
}

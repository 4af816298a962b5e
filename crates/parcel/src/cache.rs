//! # Repository Cache
//!
//! An in-memory materialized view of every package revision across all
//! registered repositories. Listing and lookup are served from the index
//! without touching a backend; resource bodies are loaded lazily and
//! memoized by the immutable object (commit or digest) they were read from.
//!
//! ## Refresh
//!
//! Each registered repository gets a background task that invokes the
//! backend's `refresh` on a fixed interval (configurable per repository)
//! and applies the resulting diff to the index. Watchers subscribed to the
//! cache receive an add/update/remove event per applied change. The task's
//! stop signal is tied to deregistration.
//!
//! ## Memory discipline
//!
//! Cached resource bodies are evicted least-recently-used once their total
//! size exceeds the configured budget. Eviction never touches metadata, so
//! listing stays index-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock};

use crate::bundle::Bundle;
use crate::core::{PackageName, RenderStatus, RepoKey, RevisionKey, RevisionRecord};
use crate::error::{Error, Result};
use crate::storage::{Backend, ChangeSet, Repository};

//================================================================================================
// Constants
//================================================================================================

/// Default budget for cached resource bodies, in bytes.
pub const DEFAULT_BODY_BUDGET: usize = 256 * 1024 * 1024;

const EVENT_CAPACITY: usize = 1024;

//================================================================================================
// Types
//================================================================================================

/// The materialized view of all registered repositories.
pub struct RepoCache {
    repos: RwLock<HashMap<RepoKey, Arc<RepoEntry>>>,
    events: broadcast::Sender<CacheEvent>,
    body_budget: usize,
    body_bytes: AtomicUsize,
    clock: AtomicU64,
}

/// One registered repository: its declaration, backend, and revision index.
pub struct RepoEntry {
    /// The repository declaration this entry was registered with.
    pub repository: Repository,
    /// The backend serving the repository.
    pub backend: Arc<dyn Backend>,
    revisions: RwLock<HashMap<RevisionKey, CachedRevision>>,
    stop: watch::Sender<bool>,
}

/// A lazily loaded revision: metadata always present, body on demand.
struct CachedRevision {
    record: RevisionRecord,
    render: Option<RenderStatus>,
    body: Option<CachedBody>,
}

struct CachedBody {
    /// The object the body was read from; a record moving past it
    /// invalidates the memo.
    object: String,
    bundle: Bundle,
    bytes: usize,
    last_used: u64,
}

/// A change applied to the materialized view.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// What happened to the revision.
    pub kind: EventKind,
    /// The revision's record after (or, for removals, before) the change.
    pub record: RevisionRecord,
}

/// The kind of a cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The revision appeared.
    Added,
    /// The revision's lifecycle or content changed.
    Updated,
    /// The revision disappeared.
    Removed,
}

//================================================================================================
// Impls
//================================================================================================

impl RepoCache {
    /// Creates a cache with the given resource-body budget.
    pub fn new(body_budget: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(RepoCache {
            repos: RwLock::new(HashMap::new()),
            events,
            body_budget,
            body_bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        })
    }

    /// Subscribes to the cache's change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Registers a repository and starts its background refresh task.
    ///
    /// The initial refresh runs before this returns so a registration is
    /// immediately listable; failure to reach the backend is logged and the
    /// repository stays registered for the poller to catch up with.
    pub async fn register(
        self: &Arc<Self>,
        repository: Repository,
        backend: Arc<dyn Backend>,
    ) -> Result<()> {
        let key = repository.key.clone();
        {
            let repos = self.repos.read().await;
            if repos.contains_key(&key) {
                return Err(Error::conflict(format!(
                    "repository `{key}` is already registered"
                )));
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let entry = Arc::new(RepoEntry {
            repository,
            backend,
            revisions: RwLock::new(HashMap::new()),
            stop,
        });
        self.repos.write().await.insert(key.clone(), entry.clone());

        if let Err(e) = self.refresh_entry(&entry).await {
            tracing::warn!(repo = %key, error = %e, "initial refresh failed; poller will retry");
        }

        let cache = Arc::clone(self);
        let period = entry
            .repository
            .poll_interval
            .unwrap_or_else(|| Duration::from_secs(config::CONFIG.repo.poll_interval));
        tokio::spawn(refresh_loop(cache, entry, period, stop_rx));
        tracing::info!(repo = %key, "repository registered");
        Ok(())
    }

    /// Stops a repository's refresh task and drops its entries, emitting a
    /// removal event per revision.
    pub async fn deregister(&self, key: &RepoKey) -> Result<()> {
        let entry = self
            .repos
            .write()
            .await
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("repository `{key}`")))?;
        entry.stop.send(true).ok();

        let revisions = entry.revisions.read().await;
        for cached in revisions.values() {
            if let Some(body) = &cached.body {
                self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
            }
            self.emit(EventKind::Removed, cached.record.clone());
        }
        tracing::info!(repo = %key, "repository deregistered");
        Ok(())
    }

    /// The registered repositories.
    pub async fn repositories(&self) -> Vec<Repository> {
        self.repos
            .read()
            .await
            .values()
            .map(|e| e.repository.clone())
            .collect()
    }

    /// The entry for a repository, for callers that mutate through its
    /// backend.
    pub async fn entry(&self, key: &RepoKey) -> Result<Arc<RepoEntry>> {
        self.repos
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("repository `{key}`")))
    }

    /// Lists revision records, optionally filtered by repository and
    /// package.
    pub async fn list(
        &self,
        repo: Option<&RepoKey>,
        package: Option<&PackageName>,
    ) -> Vec<RevisionRecord> {
        let repos = self.repos.read().await;
        let mut out = Vec::new();
        for (key, entry) in repos.iter() {
            if repo.is_some_and(|r| r != key) {
                continue;
            }
            let revisions = entry.revisions.read().await;
            out.extend(
                revisions
                    .values()
                    .filter(|c| package.is_none_or(|p| &c.record.key.package == p))
                    .map(|c| c.record.clone()),
            );
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// The record for one revision.
    pub async fn get(&self, key: &RevisionKey) -> Result<RevisionRecord> {
        let entry = self.entry(&key.repo).await?;
        let revisions = entry.revisions.read().await;
        revisions
            .get(key)
            .map(|c| c.record.clone())
            .ok_or_else(|| Error::not_found(key))
    }

    /// The last recorded render outcome for a revision.
    pub async fn render_status(&self, key: &RevisionKey) -> Result<Option<RenderStatus>> {
        let entry = self.entry(&key.repo).await?;
        let revisions = entry.revisions.read().await;
        revisions
            .get(key)
            .map(|c| c.render.clone())
            .ok_or_else(|| Error::not_found(key))
    }

    /// Records the outcome of a pipeline run over a draft.
    pub async fn set_render_status(&self, key: &RevisionKey, status: RenderStatus) -> Result<()> {
        let entry = self.entry(&key.repo).await?;
        let mut revisions = entry.revisions.write().await;
        let cached = revisions
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key))?;
        cached.render = Some(status);
        Ok(())
    }

    /// Reads a revision's resources, memoizing the body by object id.
    pub async fn read(&self, key: &RevisionKey) -> Result<Bundle> {
        let entry = self.entry(&key.repo).await?;

        {
            let mut revisions = entry.revisions.write().await;
            let cached = revisions
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key))?;
            if let Some(body) = &mut cached.body {
                if body.object == cached.record.object {
                    body.last_used = self.clock.fetch_add(1, Ordering::Relaxed);
                    return Ok(body.bundle.clone());
                }
            }
        }

        let bundle = entry.backend.read(key).await?;

        {
            let mut revisions = entry.revisions.write().await;
            if let Some(cached) = revisions.get_mut(key) {
                if let Some(old) = cached.body.take() {
                    self.body_bytes.fetch_sub(old.bytes, Ordering::Relaxed);
                }
                let bytes = bundle.total_bytes();
                cached.body = Some(CachedBody {
                    object: cached.record.object.clone(),
                    bundle: bundle.clone(),
                    bytes,
                    last_used: self.clock.fetch_add(1, Ordering::Relaxed),
                });
                self.body_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
        self.evict().await;
        Ok(bundle)
    }

    /// Applies a mutation the engine just performed, so the caller observes
    /// its own write before the next poll.
    pub async fn apply_local(&self, record: RevisionRecord) {
        let Ok(entry) = self.entry(&record.key.repo).await else {
            return;
        };
        let mut revisions = entry.revisions.write().await;
        match revisions.get_mut(&record.key) {
            Some(cached) => {
                let changed = cached.record.object != record.object;
                let kind = if changed || cached.record.lifecycle != record.lifecycle {
                    EventKind::Updated
                } else {
                    return;
                };
                if changed {
                    if let Some(body) = cached.body.take() {
                        self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
                    }
                    cached.render = None;
                }
                cached.record = record.clone();
                drop(revisions);
                self.emit(kind, record);
            },
            None => {
                revisions.insert(
                    record.key.clone(),
                    CachedRevision {
                        record: record.clone(),
                        render: None,
                        body: None,
                    },
                );
                drop(revisions);
                self.emit(EventKind::Added, record);
            },
        }
    }

    /// Drops a revision the engine just deleted.
    pub async fn remove_local(&self, key: &RevisionKey) {
        let Ok(entry) = self.entry(&key.repo).await else {
            return;
        };
        let mut revisions = entry.revisions.write().await;
        if let Some(cached) = revisions.remove(key) {
            if let Some(body) = &cached.body {
                self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
            }
            drop(revisions);
            self.emit(EventKind::Removed, cached.record);
        }
    }

    /// Refreshes one repository now, applying the backend's diff.
    pub async fn refresh_repo(&self, key: &RepoKey) -> Result<ChangeSet> {
        let entry = self.entry(key).await?;
        self.refresh_entry(&entry).await
    }

    async fn refresh_entry(&self, entry: &Arc<RepoEntry>) -> Result<ChangeSet> {
        let change = entry.backend.refresh().await?;
        if change.is_empty() {
            return Ok(change);
        }

        let mut revisions = entry.revisions.write().await;
        for record in &change.added {
            revisions.insert(
                record.key.clone(),
                CachedRevision {
                    record: record.clone(),
                    render: None,
                    body: None,
                },
            );
        }
        for record in &change.updated {
            match revisions.get_mut(&record.key) {
                Some(cached) => {
                    if cached.record.object != record.object {
                        if let Some(body) = cached.body.take() {
                            self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
                        }
                        cached.render = None;
                    }
                    cached.record = record.clone();
                },
                None => {
                    revisions.insert(
                        record.key.clone(),
                        CachedRevision {
                            record: record.clone(),
                            render: None,
                            body: None,
                        },
                    );
                },
            }
        }
        let mut removed = Vec::new();
        for key in &change.removed {
            if let Some(cached) = revisions.remove(key) {
                if let Some(body) = &cached.body {
                    self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
                }
                removed.push(cached.record);
            }
        }
        drop(revisions);

        for record in &change.added {
            self.emit(EventKind::Added, record.clone());
        }
        for record in &change.updated {
            self.emit(EventKind::Updated, record.clone());
        }
        for record in removed {
            self.emit(EventKind::Removed, record);
        }
        Ok(change)
    }

    fn emit(&self, kind: EventKind, record: RevisionRecord) {
        // send fails only when nobody is subscribed
        self.events.send(CacheEvent { kind, record }).ok();
    }

    /// Drops least-recently-used bodies until the budget is met. Metadata
    /// is never evicted.
    async fn evict(&self) {
        while self.body_bytes.load(Ordering::Relaxed) > self.body_budget {
            let mut oldest: Option<(Arc<RepoEntry>, RevisionKey, u64)> = None;
            let repos = self.repos.read().await;
            for entry in repos.values() {
                let revisions = entry.revisions.read().await;
                for (key, cached) in revisions.iter() {
                    if let Some(body) = &cached.body {
                        if oldest.as_ref().is_none_or(|(_, _, t)| body.last_used < *t) {
                            oldest = Some((entry.clone(), key.clone(), body.last_used));
                        }
                    }
                }
            }
            drop(repos);

            let Some((entry, key, _)) = oldest else {
                break;
            };
            let mut revisions = entry.revisions.write().await;
            if let Some(body) = revisions.get_mut(&key).and_then(|c| c.body.take()) {
                self.body_bytes.fetch_sub(body.bytes, Ordering::Relaxed);
                tracing::debug!(revision = %key, bytes = body.bytes, "evicted cached resources");
            }
        }
    }
}

/// The background poller for one repository.
async fn refresh_loop(
    cache: Arc<RepoCache>,
    entry: Arc<RepoEntry>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let key = entry.repository.key.clone();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the registration already refreshed once
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!(repo = %key, "refresh task stopping");
                break;
            }
            _ = interval.tick() => {
                match cache.refresh_entry(&entry).await {
                    Ok(change) if !change.is_empty() => {
                        tracing::debug!(
                            repo = %key,
                            added = change.added.len(),
                            updated = change.updated.len(),
                            removed = change.removed.len(),
                            "refresh applied changes"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(repo = %key, error = %e, "refresh failed"),
                }
            }
        }
    }
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Lifecycle, RevisionId};
    use crate::storage::{BackendSpec, ChangeSet, DraftHandle};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    /// A backend the tests drive by hand: `refresh` drains scripted
    /// change sets, `read` counts invocations.
    struct ScriptedBackend {
        key: RepoKey,
        changes: StdMutex<Vec<ChangeSet>>,
        reads: AtomicUsize,
        bundle: Bundle,
    }

    impl ScriptedBackend {
        fn new(key: RepoKey, changes: Vec<ChangeSet>) -> Self {
            let mut bundle = Bundle::new();
            bundle.insert("Pkgfile", "kind: Pkgfile\n").unwrap();
            ScriptedBackend {
                key,
                changes: StdMutex::new(changes),
                reads: AtomicUsize::new(0),
                bundle,
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn key(&self) -> &RepoKey {
            &self.key
        }

        async fn list(&self) -> Result<Vec<RevisionRecord>> {
            Ok(Vec::new())
        }

        async fn read(&self, _key: &RevisionKey) -> Result<Bundle> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Ok(self.bundle.clone())
        }

        async fn create_draft(
            &self,
            _package: &PackageName,
            _revision: &RevisionId,
        ) -> Result<DraftHandle> {
            unimplemented!("not exercised")
        }

        async fn write_draft(
            &self,
            _draft: &DraftHandle,
            _resources: &Bundle,
            _message: &str,
        ) -> Result<DraftHandle> {
            unimplemented!("not exercised")
        }

        async fn publish_draft(
            &self,
            _draft: &DraftHandle,
            _revision: &RevisionId,
            _approver: &str,
        ) -> Result<RevisionRecord> {
            unimplemented!("not exercised")
        }

        async fn move_draft(&self, _key: &RevisionKey, _to: Lifecycle) -> Result<RevisionRecord> {
            unimplemented!("not exercised")
        }

        async fn set_deletion_proposed(
            &self,
            _key: &RevisionKey,
            _proposed: bool,
        ) -> Result<RevisionRecord> {
            unimplemented!("not exercised")
        }

        async fn delete(&self, _key: &RevisionKey) -> Result<()> {
            unimplemented!("not exercised")
        }

        async fn refresh(&self) -> Result<ChangeSet> {
            let mut changes = self.changes.lock().unwrap();
            if changes.is_empty() {
                Ok(ChangeSet::default())
            } else {
                Ok(changes.remove(0))
            }
        }
    }

    fn repository(key: &RepoKey) -> Repository {
        Repository {
            key: key.clone(),
            spec: BackendSpec::Git {
                url: "https://example.invalid/repo.git".into(),
                directory: String::new(),
            },
            credentials: None,
            deployment: false,
            poll_interval: Some(Duration::from_secs(3600)),
        }
    }

    fn record(key: &RepoKey, rev: &str, object: &str) -> RevisionRecord {
        RevisionRecord {
            key: RevisionKey::new(
                key.clone(),
                PackageName::new("pkg").unwrap(),
                RevisionId::new(rev).unwrap(),
            ),
            lifecycle: Lifecycle::Published,
            object: object.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_applies_initial_refresh_and_emits_events() {
        let key = RepoKey::new("default", "r");
        let added = record(&key, "v1", "aaaa");
        let backend = Arc::new(ScriptedBackend::new(
            key.clone(),
            vec![ChangeSet {
                added: vec![added.clone()],
                ..Default::default()
            }],
        ));

        let cache = RepoCache::new(DEFAULT_BODY_BUDGET);
        let mut events = cache.subscribe();
        cache
            .register(repository(&key), backend)
            .await
            .unwrap();

        let listed = cache.list(Some(&key), None).await;
        assert_eq!(listed, vec![added.clone()]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.record, added);
    }

    #[tokio::test]
    async fn read_memoizes_by_object() {
        let key = RepoKey::new("default", "r");
        let added = record(&key, "v1", "aaaa");
        let backend = Arc::new(ScriptedBackend::new(
            key.clone(),
            vec![ChangeSet {
                added: vec![added.clone()],
                ..Default::default()
            }],
        ));

        let cache = RepoCache::new(DEFAULT_BODY_BUDGET);
        cache
            .register(repository(&key), backend.clone())
            .await
            .unwrap();

        cache.read(&added.key).await.unwrap();
        cache.read(&added.key).await.unwrap();
        assert_eq!(backend.reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn eviction_keeps_metadata() {
        let key = RepoKey::new("default", "r");
        let added = record(&key, "v1", "aaaa");
        let backend = Arc::new(ScriptedBackend::new(
            key.clone(),
            vec![ChangeSet {
                added: vec![added.clone()],
                ..Default::default()
            }],
        ));

        // budget below the body size forces immediate eviction
        let cache = RepoCache::new(1);
        cache
            .register(repository(&key), backend.clone())
            .await
            .unwrap();

        cache.read(&added.key).await.unwrap();
        cache.read(&added.key).await.unwrap();
        // body was evicted between the reads, so the backend is hit twice
        assert_eq!(backend.reads.load(Ordering::Relaxed), 2);
        // but the listing is intact
        assert_eq!(cache.list(Some(&key), None).await.len(), 1);
    }

    #[tokio::test]
    async fn deregister_stops_serving() {
        let key = RepoKey::new("default", "r");
        let backend = Arc::new(ScriptedBackend::new(key.clone(), Vec::new()));
        let cache = RepoCache::new(DEFAULT_BODY_BUDGET);
        cache
            .register(repository(&key), backend)
            .await
            .unwrap();
        cache.deregister(&key).await.unwrap();
        assert!(cache.entry(&key).await.is_err());
    }
}

//! End-to-end clone: upstream resolution, lock materialization, and the
//! propose/approve path over a real git remote.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{remote_refs, RemoteFixture};
use parcel::cache::{RepoCache, DEFAULT_BODY_BUDGET};
use parcel::core::{Lifecycle, PackageName, RepoKey};
use parcel::engine::Engine;
use parcel::manifest::{Manifest, Upstream};
use parcel::render::{Evaluated, FunctionEvaluator, Renderer};
use parcel::storage::git::GitBackend;
use parcel::storage::{BackendSpec, Repository};
use parcel::Result;

struct PassEvaluator;

#[async_trait]
impl FunctionEvaluator for PassEvaluator {
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

async fn engine_over(remote: &RemoteFixture) -> anyhow::Result<(Engine, RepoKey)> {
    let key = RepoKey::new("default", "deployments");
    let cache_root = remote.dir.path().join("cache");
    let backend = GitBackend::open_at(
        key.clone(),
        remote.url(),
        String::new(),
        None,
        &cache_root,
    )?;

    let cache = RepoCache::new(DEFAULT_BODY_BUDGET);
    let engine = Engine::new(cache, Arc::new(Renderer::new(Arc::new(PassEvaluator))))
        .with_git_cache_root(remote.dir.path().join("upstream-cache"));

    let repository = Repository {
        key: key.clone(),
        spec: BackendSpec::Git {
            url: remote.url(),
            directory: String::new(),
        },
        credentials: None,
        deployment: false,
        poll_interval: Some(Duration::from_secs(3600)),
    };
    engine
        .register_with_backend(repository, Arc::new(backend))
        .await?;
    Ok((engine, key))
}

#[tokio::test]
async fn clone_pins_the_upstream_lock() -> anyhow::Result<()> {
    // the upstream lives in its own remote, published as basens/v1
    let upstream_remote = RemoteFixture::new()?;
    let seeded_commit = upstream_remote.seed_package(
        "basens",
        "v1",
        &[
            ("Pkgfile", "apiVersion: orchard.dev/v1\nkind: Pkgfile\nmetadata:\n  name: basens\n"),
            ("namespace.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n"),
        ],
    )?;

    let target_remote = RemoteFixture::new()?;
    let (engine, repo) = engine_over(&target_remote).await?;

    let package = PackageName::new("basens-clone")?;
    let upstream = Upstream::git(upstream_remote.url(), "basens/v1", "basens");
    let revision = engine
        .clone_package(&repo, &package, upstream, None)
        .await?;
    assert_eq!(revision.record.lifecycle, Lifecycle::Draft);

    let bundle = engine.read_resources(&revision.record.key).await?;
    assert_eq!(
        bundle.get("namespace.yaml"),
        Some("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n".as_bytes())
    );

    let manifest = Manifest::parse(bundle.manifest_bytes().unwrap())?;
    let upstream = manifest.upstream()?.unwrap().git.unwrap();
    assert_eq!(upstream.reference, "basens/v1");

    let lock = manifest.upstream_lock()?.unwrap().git.unwrap();
    assert_eq!(lock.reference, "basens/v1");
    assert_eq!(lock.commit.len(), 40);
    assert!(lock.commit.chars().all(|c| c.is_ascii_hexdigit()));
    // the lock pins the exact tagged commit
    assert_eq!(lock.commit, seeded_commit);
    Ok(())
}

#[tokio::test]
async fn cloned_draft_promotes_to_v1() -> anyhow::Result<()> {
    let upstream_remote = RemoteFixture::new()?;
    upstream_remote.seed_package(
        "basens",
        "v1",
        &[("namespace.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n")],
    )?;

    let target_remote = RemoteFixture::new()?;
    let (engine, repo) = engine_over(&target_remote).await?;

    let package = PackageName::new("basens-clone")?;
    let upstream = Upstream::git(upstream_remote.url(), "basens/v1", "basens");
    let draft = engine
        .clone_package(&repo, &package, upstream, None)
        .await?;
    let key = draft.record.key.clone();

    engine.propose(&key).await.unwrap();
    let published = engine.approve(&key, "alice").await.unwrap();
    assert_eq!(published.record.lifecycle, Lifecycle::Published);
    assert_eq!(published.record.key.revision.as_str(), "v1");

    // the draft branch is gone; the approved tag exists
    let refs = remote_refs(&target_remote.path)?;
    assert!(refs.contains(&"refs/tags/basens-clone/v1".to_string()));
    assert!(!refs.iter().any(|r| r.starts_with("refs/heads/")));
    Ok(())
}

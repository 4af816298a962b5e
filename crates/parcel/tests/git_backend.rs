//! End-to-end tests of the git backend against a local bare remote.

mod common;

use common::{remote_refs, RemoteFixture};
use parcel::bundle::Bundle;
use parcel::core::{Lifecycle, PackageName, RepoKey, RevisionId, RevisionKey};
use parcel::storage::git::GitBackend;
use parcel::storage::Backend;
use parcel::Error;

fn key() -> RepoKey {
    RepoKey::new("default", "blueprints")
}

fn backend(remote: &RemoteFixture) -> anyhow::Result<GitBackend> {
    let cache = remote.dir.path().join("cache");
    Ok(GitBackend::open_at(
        key(),
        remote.url(),
        String::new(),
        None,
        &cache,
    )?)
}

#[tokio::test]
async fn empty_remote_lists_nothing() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    let backend = backend(&remote)?;
    assert!(backend.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn external_tag_surfaces_as_published() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    let backend = backend(&remote)?;
    assert!(backend.list().await?.is_empty());

    // an external push of pkg/v1 appears on the next refresh
    remote.seed_package(
        "pkg",
        "v1",
        &[("namespace.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n")],
    )?;
    let change = backend.refresh().await?;
    assert_eq!(change.added.len(), 1);

    let records = backend.list().await?;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.lifecycle, Lifecycle::Published);
    assert_eq!(record.key.package.as_str(), "pkg");
    assert_eq!(record.key.revision.as_str(), "v1");
    Ok(())
}

#[tokio::test]
async fn published_reads_are_stable_and_byte_identical() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    let contents = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n";
    remote.seed_package("basens", "v1", &[("namespace.yaml", contents)])?;

    let backend = backend(&remote)?;
    let revision = RevisionKey::new(
        key(),
        PackageName::new("basens")?,
        RevisionId::new("v1")?,
    );

    let first = backend.read(&revision).await?;
    let second = backend.read(&revision).await?;
    assert_eq!(first, second);
    assert_eq!(first.get("namespace.yaml"), Some(contents.as_bytes()));
    Ok(())
}

#[tokio::test]
async fn draft_write_propose_publish_lifecycle() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    let backend = backend(&remote)?;
    let package = PackageName::new("basens-clone")?;

    let draft = backend.create_draft(&package, &RevisionId::draft()).await?;
    assert!(remote_refs(&remote.path)?
        .contains(&"refs/heads/drafts/basens-clone/draft".to_string()));

    let mut bundle = Bundle::new();
    bundle.insert("Pkgfile", "apiVersion: orchard.dev/v1\nkind: Pkgfile\n")?;
    bundle.insert(
        "namespace.yaml",
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n",
    )?;
    let draft = backend.write_draft(&draft, &bundle, "Update resources").await?;

    // the working tree round-trips through the draft branch
    let read = backend.read(&draft.key).await?;
    assert_eq!(read, bundle);

    let proposed = backend.move_draft(&draft.key, Lifecycle::Proposed).await?;
    assert_eq!(proposed.lifecycle, Lifecycle::Proposed);
    let refs = remote_refs(&remote.path)?;
    assert!(refs.contains(&"refs/heads/proposed/basens-clone/draft".to_string()));
    assert!(!refs.contains(&"refs/heads/drafts/basens-clone/draft".to_string()));

    let published = backend
        .publish_draft(&draft, &RevisionId::new("v1")?, "alice")
        .await?;
    assert_eq!(published.lifecycle, Lifecycle::Published);
    assert_eq!(published.key.revision.as_str(), "v1");

    // the tag exists and every draft location is gone
    let refs = remote_refs(&remote.path)?;
    assert!(refs.contains(&"refs/tags/basens-clone/v1".to_string()));
    assert!(!refs.iter().any(|r| r.starts_with("refs/heads/")));

    // the published bytes are the drafted bytes
    let read = backend.read(&published.key).await?;
    assert_eq!(read, bundle);
    Ok(())
}

#[tokio::test]
async fn publishing_over_an_existing_tag_conflicts() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    remote.seed_package("pkg", "v1", &[("a.yaml", "kind: A\n")])?;

    let backend = backend(&remote)?;
    let package = PackageName::new("pkg")?;
    let draft = backend.create_draft(&package, &RevisionId::draft()).await?;

    match backend
        .publish_draft(&draft, &RevisionId::new("v1")?, "alice")
        .await
    {
        Err(Error::Conflict(_)) => {},
        other => panic!("expected conflict, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn first_draft_starts_from_latest_published_content() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    remote.seed_package("pkg", "v1", &[("a.yaml", "kind: A\n")])?;

    let backend = backend(&remote)?;
    let package = PackageName::new("pkg")?;
    let draft = backend.create_draft(&package, &RevisionId::draft()).await?;

    let read = backend.read(&draft.key).await?;
    assert_eq!(read.get("a.yaml"), Some("kind: A\n".as_bytes()));
    Ok(())
}

#[tokio::test]
async fn deletion_marker_and_delete_remove_the_tag() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    remote.seed_package("pkg", "v1", &[("a.yaml", "kind: A\n")])?;

    let backend = backend(&remote)?;
    let revision = RevisionKey::new(key(), PackageName::new("pkg")?, RevisionId::new("v1")?);

    let marked = backend.set_deletion_proposed(&revision, true).await?;
    assert_eq!(marked.lifecycle, Lifecycle::DeletionProposed);

    backend.delete(&revision).await?;
    assert!(backend.list().await?.is_empty());
    assert!(remote_refs(&remote.path)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn refresh_converges_with_external_removal() -> anyhow::Result<()> {
    let remote = RemoteFixture::new()?;
    remote.seed_package("pkg", "v1", &[("a.yaml", "kind: A\n")])?;

    let backend = backend(&remote)?;
    assert_eq!(backend.list().await?.len(), 1);

    // an external actor deletes the tag out from under us
    let repo = gix::open(&remote.path)?;
    repo.find_reference("refs/tags/pkg/v1")?.delete()?;

    let change = backend.refresh().await?;
    assert_eq!(change.removed.len(), 1);
    assert!(backend.list().await?.is_empty());
    Ok(())
}

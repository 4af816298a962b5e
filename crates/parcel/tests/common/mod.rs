//! Shared fixtures: a throwaway bare "remote" seeded by writing git
//! objects directly, so backend tests exercise real fetch, push, and tree
//! plumbing without any network.

use std::path::{Path, PathBuf};

use gix::objs::tree::{self, EntryKind};
use gix::objs::{Commit, Tag, Tree};
use gix::refs::transaction::PreviousValue;
use gix::ObjectId;
use tempfile::TempDir;

/// A temporary bare repository acting as the remote under test.
pub struct RemoteFixture {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl RemoteFixture {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("remote.git");
        std::fs::create_dir_all(&path)?;
        gix::init_bare(&path)?;
        Ok(RemoteFixture { path, dir })
    }

    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Commits `files` under `package/` and publishes the commit as the
    /// annotated tag `refs/tags/{package}/{revision}`.
    pub fn seed_package(
        &self,
        package: &str,
        revision: &str,
        files: &[(&str, &str)],
    ) -> anyhow::Result<String> {
        let repo = gix::open(&self.path)?;

        let mut entries = Vec::new();
        for (name, contents) in files {
            let oid = repo.write_blob(contents.as_bytes())?.detach();
            entries.push(tree::Entry {
                mode: EntryKind::Blob.into(),
                filename: (*name).into(),
                oid,
            });
        }
        entries.sort_unstable();
        let package_tree = repo.write_object(Tree { entries })?.detach();

        let root_tree = repo
            .write_object(Tree {
                entries: vec![tree::Entry {
                    mode: EntryKind::Tree.into(),
                    filename: package.into(),
                    oid: package_tree,
                }],
            })?
            .detach();

        let commit = write_commit(&repo, root_tree, &format!("seed {package}/{revision}"))?;

        let tag = Tag {
            target: commit,
            target_kind: gix::objs::Kind::Commit,
            name: format!("{package}/{revision}").into(),
            tagger: Some(signature()),
            message: "seeded\n".into(),
            pgp_signature: None,
        };
        let tag_id = repo.write_object(tag)?.detach();
        repo.reference(
            format!("refs/tags/{package}/{revision}"),
            tag_id,
            PreviousValue::Any,
            "seed",
        )?;
        Ok(commit.to_string())
    }
}

pub fn signature() -> gix::actor::Signature {
    gix::actor::Signature {
        name: "fixture".into(),
        email: "fixture@localhost".into(),
        time: gix::date::Time {
            seconds: 0,
            offset: 0,
        },
    }
}

fn write_commit(repo: &gix::Repository, tree: ObjectId, message: &str) -> anyhow::Result<ObjectId> {
    let sig = signature();
    let commit = Commit {
        tree,
        parents: vec![].into(),
        author: sig.clone(),
        committer: sig,
        encoding: None,
        message: format!("{message}\n").into(),
        extra_headers: Vec::new(),
    };
    Ok(repo.write_object(commit)?.detach())
}

/// Lists the remote's refs with the git binary, for asserting on what a
/// mutation actually left behind.
pub fn remote_refs(path: &Path) -> anyhow::Result<Vec<String>> {
    let output = std::process::Command::new("git")
        .args(["ls-remote", &path.to_string_lossy()])
        .output()?;
    anyhow::ensure!(output.status.success(), "ls-remote failed");
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.split_once('\t').map(|(_, name)| name.to_string()))
        .filter(|name| !name.ends_with("^{}"))
        .collect())
}

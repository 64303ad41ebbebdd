//! Git fixtures for tests: a one-commit repository whose change refs and
//! remotes can be shaped per test.

use std::io::Write;
use std::path::Path;

use gix::bstr::ByteSlice;
use gix::object::tree::EntryKind;
use gix_ref::transaction::PreviousValue;

use crate::review::CommitId;

pub(crate) struct RepoFixture {
    td: tempfile::TempDir,
    repo: gix::Repository,
    commit: gix::ObjectId,
    pub(crate) head: CommitId,
}

impl RepoFixture {
    /// Repository with a single commit containing `path`, checked out on disk.
    pub(crate) fn new(path: &str, contents: &str) -> Self {
        let td = tempfile::tempdir().expect("tempdir");
        let repo = gix::init(td.path()).expect("init repo");

        let workdir = repo.workdir().expect("workdir");
        let full_path = workdir.join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir parent");
        }
        std::fs::write(&full_path, contents).expect("write file");

        let blob_id = repo
            .write_blob(contents.as_bytes())
            .expect("write blob")
            .detach();
        let mut editor = gix::object::tree::Editor::new(&repo.empty_tree()).expect("tree editor");
        editor
            .upsert(path.as_bytes().as_bstr(), EntryKind::Blob, blob_id)
            .expect("upsert tree entry");
        let tree_id = editor.write().expect("write tree").detach();

        let sig = gix_actor::Signature {
            name: "gerrit-review-test".into(),
            email: "gerrit-review-test@localhost".into(),
            time: gix_date::Time {
                seconds: 0,
                offset: 0,
            },
        };
        let commit = gix::objs::Commit {
            tree: tree_id,
            parents: Default::default(),
            author: sig.clone(),
            committer: sig,
            encoding: None,
            message: "test commit\n".into(),
            extra_headers: Default::default(),
        };
        let commit = repo
            .write_object(commit)
            .expect("write commit")
            .detach();

        repo.reference("HEAD", commit, PreviousValue::Any, "test commit")
            .expect("update HEAD");

        let head = commit.to_string().parse().expect("commit id");
        Self {
            td,
            repo,
            commit,
            head,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.td.path()
    }

    /// Points `name` (e.g. `refs/changes/34/1234/2`) at the fixture commit.
    pub(crate) fn add_ref(&self, name: &str) {
        self.repo
            .reference(name, self.commit, PreviousValue::Any, "test ref")
            .expect("create ref");
    }
}

/// Adds a remote to the repository's config. Pointing it at the repository
/// itself lets `ls-remote` see the fixture's own change refs.
pub(crate) fn write_remote(root: &Path, name: &str, url: &Path) {
    let mut config = std::fs::OpenOptions::new()
        .append(true)
        .open(root.join(".git").join("config"))
        .expect("open git config");
    write!(
        config,
        "[remote \"{name}\"]\n\turl = {}\n\tfetch = +refs/heads/*:refs/remotes/{name}/*\n",
        url.display()
    )
    .expect("write remote");
}

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tower_lsp::lsp_types::Range;

use crate::change::{self, ChangeRef};
use crate::error::Result;
use crate::gerrit::GerritClient;
use crate::git::{GitCli, Remote};
use crate::position::{Buffer, map_to_range};
use crate::prompt::{self, Prompter};
use crate::review::{Comment, CommentsByFile, CommitId};

/// The patchset a load resolved to, before its comments arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTarget {
    pub repo_root: PathBuf,
    pub commit: CommitId,
    pub change: ChangeRef,
}

/// A loaded review. Immutable; a reload builds a new one.
#[derive(Debug)]
pub struct ReviewSession {
    pub target: ReviewTarget,
    /// Comments for every patchset of the change.
    pub comments: CommentsByFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Highlight {
    pub range: Range,
    pub hover: String,
    pub unresolved: bool,
}

/// Highlights for one visible buffer. Empty means "clear".
#[derive(Debug, Clone)]
pub struct BufferHighlights {
    pub path: PathBuf,
    pub highlights: Vec<Highlight>,
}

impl ReviewSession {
    pub fn new(target: ReviewTarget, comments: CommentsByFile) -> Self {
        Self { target, comments }
    }

    pub fn change(&self) -> ChangeRef {
        self.target.change
    }

    /// `/` separated path of `path` inside the repo, as the review service keys files.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let root = &self.target.repo_root;
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            // git reports the root with symlinks resolved; editors may not.
            Err(_) => path.canonicalize().ok()?.strip_prefix(root).ok()?.to_path_buf(),
        };
        let parts: Vec<String> = rel
            .components()
            .map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Option<_>>()?;
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// Comments of `file` on the active patchset.
    pub fn active_comments<'a>(&'a self, file: &str) -> impl Iterator<Item = &'a Comment> + 'a {
        let patchset = self.target.change.patchset;
        self.comments
            .get(file)
            .into_iter()
            .flatten()
            .filter(move |c| c.patchset == patchset)
    }

    /// Repository files with at least one comment on the active patchset.
    pub fn files_with_comments(&self) -> Vec<String> {
        self.commented_keys(is_repo_file)
    }

    /// Keys like `/COMMIT_MSG` and `/PATCHSET_LEVEL` that have comments on the
    /// active patchset but no file in the working tree.
    pub fn change_level_keys(&self) -> Vec<String> {
        self.commented_keys(|key| !is_repo_file(key))
    }

    fn commented_keys(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        self.comments
            .keys()
            .filter(|key| keep(key) && self.active_comments(key).next().is_some())
            .cloned()
            .collect()
    }

    /// Highlights for one buffer. Comments pointing past the buffer's end
    /// are stale and skipped individually.
    pub fn highlights(&self, buffer: &Buffer, hide_resolved: bool) -> Vec<Highlight> {
        let Some(file) = self.relative_path(buffer.path()) else {
            return Vec::new();
        };
        let mut highlights = Vec::new();
        for comment in self.active_comments(&file) {
            if hide_resolved && !comment.unresolved {
                continue;
            }
            let range = map_to_range(comment, buffer);
            if range.start.line >= buffer.line_count() {
                tracing::debug!(
                    file = %file,
                    line = range.start.line,
                    lines = buffer.line_count(),
                    "skipping stale comment"
                );
                continue;
            }
            highlights.push(Highlight {
                range,
                hover: comment.hover_text(),
                unresolved: comment.unresolved,
            });
        }
        highlights
    }
}

/// Gerrit keys its pseudo files (commit message, patchset-level comments)
/// with a leading `/`; real paths are relative to the repository root.
fn is_repo_file(key: &str) -> bool {
    !key.starts_with('/')
}

#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Empty,
    Loading {
        target: ReviewTarget,
        /// Restored if the fetch fails.
        previous: Option<Arc<ReviewSession>>,
    },
    Loaded(Arc<ReviewSession>),
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(Arc<ReviewSession>),
    /// A selection prompt was dismissed.
    Cancelled,
    /// A newer load started before this one finished; its result was dropped.
    Superseded,
}

/// Owns the active review and runs the load workflow:
/// remote → HEAD → change ref → comments.
pub struct SessionManager {
    git: GitCli,
    gerrit: GerritClient,
    preferred_remote: Option<String>,
    hide_resolved: bool,
    state: RwLock<SessionState>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(git: GitCli, gerrit: GerritClient) -> Self {
        Self {
            git,
            gerrit,
            preferred_remote: None,
            hide_resolved: false,
            state: RwLock::new(SessionState::Empty),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_preferred_remote(mut self, remote: Option<String>) -> Self {
        self.preferred_remote = remote;
        self
    }

    pub fn with_hide_resolved(mut self, hide_resolved: bool) -> Self {
        self.hide_resolved = hide_resolved;
        self
    }

    pub fn hide_resolved(&self) -> bool {
        self.hide_resolved
    }

    pub fn gerrit(&self) -> &GerritClient {
        &self.gerrit
    }

    pub async fn current(&self) -> Option<Arc<ReviewSession>> {
        match &*self.state.read().await {
            SessionState::Loaded(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Picks a git root among the workspace candidates, then loads it.
    pub async fn load_workspace(
        &self,
        candidates: &[PathBuf],
        prompter: &dyn Prompter,
    ) -> Result<LoadOutcome> {
        let roots = self.git.locate_roots(candidates).await?;
        let Some(root) = prompt::choose(
            prompter,
            "Select git repo with the code review.",
            roots,
            |r| r.display().to_string(),
        )
        .await
        else {
            return Ok(LoadOutcome::Cancelled);
        };
        self.load(&root, prompter).await
    }

    /// Loads the review for HEAD of `root`. On error the previous session,
    /// if any, stays active.
    pub async fn load(&self, root: &Path, prompter: &dyn Prompter) -> Result<LoadOutcome> {
        let remotes = self.git.list_remotes(root).await?;
        let Some(remote) = self.pick_remote(remotes, prompter).await else {
            return Ok(LoadOutcome::Cancelled);
        };
        tracing::debug!(remote = %remote.name, url = %remote.url, "using remote");
        let commit = self.git.current_commit(root).await?;
        let Some(change) =
            change::resolve_change(&self.git, root, &remote.name, &commit, prompter).await?
        else {
            return Ok(LoadOutcome::Cancelled);
        };

        let target = ReviewTarget {
            repo_root: root.to_path_buf(),
            commit,
            change,
        };
        let generation = self.begin_loading(target.clone()).await;

        match self.gerrit.fetch_comments(change.change).await {
            Ok(comments) => Ok(self
                .finish_loading(generation, ReviewSession::new(target, comments))
                .await),
            Err(err) => {
                self.abort_loading(generation).await;
                Err(err)
            }
        }
    }

    async fn pick_remote(&self, remotes: Vec<Remote>, prompter: &dyn Prompter) -> Option<Remote> {
        if let Some(name) = &self.preferred_remote
            && let Some(remote) = remotes.iter().find(|r| &r.name == name)
        {
            return Some(remote.clone());
        }
        prompt::choose(
            prompter,
            "Select git remote with the code review.",
            remotes,
            |r| r.name.clone(),
        )
        .await
    }

    fn is_latest(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Marks `target` as loading and returns its generation. Loads that
    /// are cancelled or fail before this point never invalidate older ones.
    async fn begin_loading(&self, target: ReviewTarget) -> u64 {
        let mut state = self.state.write().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = match std::mem::take(&mut *state) {
            SessionState::Empty => None,
            SessionState::Loading { previous, .. } => previous,
            SessionState::Loaded(session) => Some(session),
        };
        tracing::info!(change = %target.change, commit = %target.commit, "loading review");
        *state = SessionState::Loading { target, previous };
        generation
    }

    async fn finish_loading(&self, generation: u64, session: ReviewSession) -> LoadOutcome {
        let mut state = self.state.write().await;
        if !self.is_latest(generation) {
            tracing::debug!(generation, "dropping superseded review");
            return LoadOutcome::Superseded;
        }
        let session = Arc::new(session);
        tracing::info!(
            change = %session.change(),
            files = session.comments.len(),
            "review loaded"
        );
        *state = SessionState::Loaded(session.clone());
        LoadOutcome::Loaded(session)
    }

    async fn abort_loading(&self, generation: u64) {
        let mut state = self.state.write().await;
        if !self.is_latest(generation) {
            return;
        }
        if let SessionState::Loading { target, previous } = std::mem::take(&mut *state) {
            tracing::warn!(change = %target.change, "review load failed");
            *state = match previous {
                Some(session) => SessionState::Loaded(session),
                None => SessionState::Empty,
            };
        }
    }

    /// Highlights for every visible buffer, or `None` when no review is loaded.
    pub async fn on_visible_buffers_changed(
        &self,
        buffers: &[Buffer],
    ) -> Option<Vec<BufferHighlights>> {
        let session = self.current().await?;
        Some(
            buffers
                .iter()
                .map(|buffer| BufferHighlights {
                    path: buffer.path().to_path_buf(),
                    highlights: session.highlights(buffer, self.hide_resolved),
                })
                .collect(),
        )
    }
}

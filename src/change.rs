use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::error::{ReviewError, Result};
use crate::git::GitCli;
use crate::prompt::{self, Prompter};
use crate::review::CommitId;

/// Restricts `ls-remote` to numeric patchset refs, skipping e.g. `.../meta`.
pub const CHANGE_REF_GLOB: &str = "refs/changes/*/*/[0-9]*";

const CHANGE_REF_PREFIX: &str = "refs/changes/";

/// A patchset of a change, as encoded in `refs/changes/<shard>/<change>/<patchset>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeRef {
    pub change: u64,
    pub patchset: u32,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed change ref '{0}'")]
pub struct MalformedRef(pub String);

impl FromStr for ChangeRef {
    type Err = MalformedRef;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || MalformedRef(s.to_string());
        let rest = s.strip_prefix(CHANGE_REF_PREFIX).ok_or_else(malformed)?;
        let mut parts = rest.split('/');
        let (Some(shard), Some(change), Some(patchset), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if ![shard, change, patchset].iter().all(|p| is_number(p)) {
            return Err(malformed());
        }
        Ok(Self {
            change: change.parse().map_err(|_| malformed())?,
            patchset: patchset.parse().map_err(|_| malformed())?,
        })
    }
}

impl fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CHANGE_REF_PREFIX}{:02}/{}/{}",
            self.change % 100,
            self.change,
            self.patchset
        )
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Change refs in an `ls-remote` listing that point at exactly `commit`.
///
/// Lines look like `46c82b4cd241a447834ed2f5a6be16777b7a990b\trefs/changes/80/116780/3`.
/// The sha must match in full; refs that don't parse are dropped.
pub fn matching_changes(listing: &str, commit: &CommitId) -> Vec<ChangeRef> {
    let mut changes = Vec::new();
    for line in listing.lines() {
        let Some((sha, name)) = line.split_once('\t') else {
            continue;
        };
        if !sha.trim().eq_ignore_ascii_case(commit.as_str()) {
            continue;
        }
        match name.trim().parse::<ChangeRef>() {
            Ok(change) if !changes.contains(&change) => changes.push(change),
            Ok(_) => {}
            Err(err) => tracing::debug!(%err, "skipping ref"),
        }
    }
    changes
}

/// Finds the change whose patchset ref on `remote` points at `commit`.
///
/// When the commit sits on several change refs the user picks one;
/// `Ok(None)` means that prompt was cancelled.
pub async fn resolve_change(
    git: &GitCli,
    root: &Path,
    remote: &str,
    commit: &CommitId,
    prompter: &dyn Prompter,
) -> Result<Option<ChangeRef>> {
    let listing = git.ls_remote_changes(root, remote).await?;
    let changes = matching_changes(&listing, commit);
    if changes.is_empty() {
        return Err(ReviewError::NoChangeForCommit {
            commit: commit.to_string(),
        });
    }
    Ok(prompt::choose(
        prompter,
        "Pick the change you want to load comments for.",
        changes,
        ToString::to_string,
    )
    .await)
}

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::gerrit::ChangeInfo;
use crate::position::{Buffer, map_to_range};
use crate::prompt::TerminalPrompter;
use crate::session::{LoadOutcome, ReviewSession};

pub fn run(config: AppConfig, paths: Vec<PathBuf>) -> Result<()> {
    let candidates = if paths.is_empty() {
        vec![std::env::current_dir().context("get current directory")?]
    } else {
        paths
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        let manager = config.session_manager();
        let outcome = manager
            .load_workspace(&candidates, &TerminalPrompter)
            .await
            .context("Unable to load code review")?;
        let LoadOutcome::Loaded(session) = outcome else {
            return Ok(());
        };

        let info = match manager.gerrit().fetch_change(session.change().change).await {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::warn!(%err, "change metadata unavailable");
                None
            }
        };

        print!("{}", render(&session, info.as_ref(), manager.hide_resolved()));
        Ok(())
    })
}

fn render(session: &ReviewSession, info: Option<&ChangeInfo>, hide_resolved: bool) -> String {
    let change = session.change();
    let mut out = format!("change {}/{}", change.change, change.patchset);
    if let Some(info) = info {
        let _ = write!(out, ": {}", info.subject);
        if !info.is_current(&session.target.commit) {
            out.push_str(" (not the current patchset)");
        }
        if let Some(patchset) = info.patchset_of(&session.target.commit)
            && patchset != change.patchset
        {
            let _ = write!(out, " (server has this commit as patchset {patchset})");
        }
    }
    out.push('\n');

    for key in session.change_level_keys() {
        for comment in session.active_comments(&key) {
            if hide_resolved && !comment.unresolved {
                continue;
            }
            let _ = writeln!(out, "{key}: {}", comment.hover_text());
        }
    }

    for file in session.files_with_comments() {
        let path = session.target.repo_root.join(&file);
        let (buffer, unreadable) = match std::fs::read_to_string(&path) {
            Ok(text) => (Buffer::new(path, &text), false),
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "cannot read commented file");
                (Buffer::new(path, ""), true)
            }
        };
        for comment in session.active_comments(&file) {
            if hide_resolved && !comment.unresolved {
                continue;
            }
            let range = map_to_range(comment, &buffer);
            let note = if unreadable {
                " (unreadable)"
            } else if range.start.line >= buffer.line_count() {
                " (stale)"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "{file}:{}:{}: {}{note}",
                range.start.line + 1,
                range.start.character + 1,
                comment.hover_text()
            );
        }
    }
    out
}

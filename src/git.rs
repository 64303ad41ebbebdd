use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{ReviewError, Result};
use crate::review::CommitId;

/// Default ceiling for captured git stdout. `ls-remote` on a large Gerrit
/// project lists every patchset of every change.
pub const DEFAULT_MAX_OUTPUT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

/// Runs `git -C <root> ...` subprocesses.
#[derive(Debug, Clone)]
pub struct GitCli {
    max_output: usize,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT)
    }
}

impl GitCli {
    pub fn new(max_output: usize) -> Self {
        Self { max_output }
    }

    /// Top level of the working tree containing `path`, or `None` when `path`
    /// is not inside one.
    pub async fn git_root(&self, path: &Path) -> Option<PathBuf> {
        if !path.exists() {
            return None;
        }
        let out = self
            .run(path, &["rev-parse", "--show-toplevel"])
            .await
            .ok()?;
        let root = PathBuf::from(out);
        root.is_dir().then_some(root)
    }

    /// Resolves every candidate to its git root, dropping those outside a
    /// working tree. Duplicates collapse into the first occurrence.
    pub async fn locate_roots(&self, candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            match self.git_root(candidate).await {
                Some(root) if !roots.contains(&root) => roots.push(root),
                Some(_) => {}
                None => tracing::debug!(path = %candidate.display(), "not a git working tree"),
            }
        }
        if roots.is_empty() {
            return Err(ReviewError::NoRepositoryFound);
        }
        Ok(roots)
    }

    pub async fn current_commit(&self, root: &Path) -> Result<CommitId> {
        let out = self.run(root, &["rev-parse", "HEAD"]).await?;
        out.parse().map_err(|stderr| ReviewError::GitCommandFailed {
            command: "rev-parse HEAD".to_string(),
            stderr,
        })
    }

    pub async fn list_remotes(&self, root: &Path) -> Result<Vec<Remote>> {
        let out = self.run(root, &["remote", "-v"]).await?;
        let remotes = parse_remotes(&out);
        if remotes.is_empty() {
            return Err(ReviewError::NoRemoteFound {
                root: root.to_path_buf(),
            });
        }
        Ok(remotes)
    }

    /// Raw `<sha>\t<ref>` listing of the numeric patchset refs on `remote`,
    /// in version order.
    pub async fn ls_remote_changes(&self, root: &Path, remote: &str) -> Result<String> {
        self.run(
            root,
            &[
                "ls-remote",
                // No peeled tags or pseudo-refs like HEAD.
                "--refs",
                "--sort=version:refname",
                remote,
                crate::change::CHANGE_REF_GLOB,
            ],
        )
        .await
    }

    async fn run(&self, root: &Path, args: &[&str]) -> Result<String> {
        let command = args.join(" ");
        let failed = |stderr: String| ReviewError::GitCommandFailed {
            command: command.clone(),
            stderr,
        };

        let mut child = self
            .git_cmd(root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| failed(format!("spawn git: {err}")))?;

        let stdout = child.stdout.take().ok_or_else(|| failed("no stdout".into()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| failed("no stderr".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        // Read one byte past the ceiling so overflow is detectable.
        let mut out = Vec::new();
        let mut limited = stdout.take(self.max_output as u64 + 1);
        limited
            .read_to_end(&mut out)
            .await
            .map_err(|e| failed(format!("read stdout: {e}")))?;

        if out.len() > self.max_output {
            let _ = child.kill().await;
            return Err(failed(format!(
                "output exceeds {} bytes",
                self.max_output
            )));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| failed(format!("wait for git: {e}")))?;
        if !status.success() {
            let err = stderr_task.await.unwrap_or_default();
            return Err(failed(String::from_utf8_lossy(&err).trim().to_string()));
        }

        let out = String::from_utf8_lossy(&out);
        Ok(out.trim_end_matches(['\n', '\r']).to_string())
    }

    fn git_cmd(&self, root: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(root);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Parses `git remote -v` output, keeping only the fetch direction.
///
/// ```text
/// origin  https://android.googlesource.com/platform/build (fetch)
/// origin  https://android.googlesource.com/platform/build (push)
/// ```
pub fn parse_remotes(output: &str) -> Vec<Remote> {
    let mut remotes: Vec<Remote> = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(url), Some("(fetch)")) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if remotes.iter().any(|r| r.name == name) {
            continue;
        }
        remotes.push(Remote {
            name: name.to_string(),
            url: url.to_string(),
        });
    }
    remotes
}

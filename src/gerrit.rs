use std::collections::{BTreeMap, HashMap};

use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{ReviewError, Result};
use crate::review::{Comment, CommentLocation, CommentsByFile, CommitId, TextRange};

/// Gerrit prefixes every JSON body with this to defeat JSON hijacking.
pub const MAGIC_PREFIX: &str = ")]}'";

#[derive(Debug, Deserialize)]
struct CommentInfo {
    patch_set: Option<u32>,
    line: Option<u32>,
    range: Option<CommentRange>,
    author: Option<AccountInfo>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    unresolved: bool,
}

#[derive(Debug, Deserialize)]
struct CommentRange {
    start_line: u32,
    start_character: u32,
    end_line: u32,
    end_character: u32,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    name: Option<String>,
    username: Option<String>,
}

impl CommentInfo {
    fn into_comment(self) -> Option<Comment> {
        let location = match (self.range, self.line) {
            (Some(r), _) => CommentLocation::Range(TextRange {
                start_line: r.start_line,
                start_character: r.start_character,
                end_line: r.end_line,
                end_character: r.end_character,
            }),
            // Gerrit uses line 0 for file comments on some versions.
            (None, Some(line)) if line > 0 => CommentLocation::Line(line),
            (None, _) => CommentLocation::File,
        };
        Some(Comment {
            patchset: self.patch_set?,
            location,
            author: self.author.and_then(|a| a.name.or(a.username)),
            message: self.message,
            unresolved: self.unresolved,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionInfo {
    #[serde(rename = "_number")]
    pub number: u32,
}

/// Change metadata from `GET /changes/{n}?o=ALL_REVISIONS&o=CURRENT_COMMIT`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeInfo {
    #[serde(default)]
    pub subject: String,
    pub current_revision: Option<String>,
    #[serde(default)]
    pub revisions: HashMap<String, RevisionInfo>,
}

impl ChangeInfo {
    /// Patchset number whose revision is `commit`.
    pub fn patchset_of(&self, commit: &CommitId) -> Option<u32> {
        self.revisions.get(commit.as_str()).map(|r| r.number)
    }

    pub fn is_current(&self, commit: &CommitId) -> bool {
        self.current_revision.as_deref() == Some(commit.as_str())
    }
}

/// Strips the magic prefix; a body without it is not a Gerrit response.
pub fn strip_magic_prefix(body: &str) -> Result<&str> {
    body.strip_prefix(MAGIC_PREFIX).ok_or_else(|| {
        let head: String = body.chars().take(16).collect();
        ReviewError::Protocol(format!("missing {MAGIC_PREFIX} prefix in body starting {head:?}"))
    })
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(strip_magic_prefix(body)?)
        .map_err(|err| ReviewError::Protocol(format!("invalid json: {err}")))
}

/// Parses a `/changes/{n}/comments` body. Comments without a patchset are
/// dropped since they can never be shown.
pub fn parse_comments(body: &str) -> Result<CommentsByFile> {
    let raw: BTreeMap<String, Vec<CommentInfo>> = parse_body(body)?;
    Ok(raw
        .into_iter()
        .map(|(path, infos)| {
            let comments = infos
                .into_iter()
                .filter_map(CommentInfo::into_comment)
                .collect();
            (path, comments)
        })
        .collect())
}

/// Read-only client for the Gerrit REST API.
#[derive(Debug, Clone)]
pub struct GerritClient {
    base: Option<String>,
    http: reqwest::Client,
}

impl GerritClient {
    pub fn new(base: Option<String>) -> Self {
        Self {
            base: base.filter(|b| !b.trim().is_empty()),
            http: reqwest::Client::new(),
        }
    }

    /// Every comment on the change, for all patchsets, keyed by file path.
    pub async fn fetch_comments(&self, change: u64) -> Result<CommentsByFile> {
        let body = self.get(&format!("changes/{change}/comments")).await?;
        parse_comments(&body)
    }

    pub async fn fetch_change(&self, change: u64) -> Result<ChangeInfo> {
        let body = self
            .get(&format!("changes/{change}?o=ALL_REVISIONS&o=CURRENT_COMMIT"))
            .await?;
        parse_body(&body)
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = self.url(path)?;
        tracing::debug!(%url, "gerrit request");
        let unavailable = |err: reqwest::Error| ReviewError::ReviewServiceUnavailable(err.to_string());
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        let response = response.error_for_status().map_err(unavailable)?;
        response.text().await.map_err(unavailable)
    }

    fn url(&self, path: &str) -> Result<Url> {
        let base = self
            .base
            .as_deref()
            .ok_or(ReviewError::ReviewServiceMisconfigured)?;
        Url::parse(&format!("{}/{path}", base.trim_end_matches('/')))
            .map_err(|_| ReviewError::ReviewServiceMisconfigured)
    }
}

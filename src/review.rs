use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Full 40-character hex sha of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(String);

impl CommitId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl FromStr for CommitId {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
      Ok(Self(s.to_ascii_lowercase()))
    } else {
      Err(format!("'{s}' is not a full commit sha"))
    }
  }
}

impl fmt::Display for CommitId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Selected span of a range comment, as sent by the review service:
/// lines are 1-based, characters 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
  pub start_line: u32,
  pub start_character: u32,
  pub end_line: u32,
  pub end_character: u32,
}

/// Where a comment is anchored. Decided once when the response is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentLocation {
  Range(TextRange),
  /// 1-based line.
  Line(u32),
  File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
  pub patchset: u32,
  pub location: CommentLocation,
  pub author: Option<String>,
  pub message: String,
  pub unresolved: bool,
}

impl Comment {
  /// Text shown when hovering the highlight, e.g. `Bob: fix`.
  pub fn hover_text(&self) -> String {
    match &self.author {
      Some(author) => format!("{author}: {}", self.message),
      None => self.message.clone(),
    }
  }
}

/// All comments of a change, across every patchset, keyed by repo-relative path.
pub type CommentsByFile = BTreeMap<String, Vec<Comment>>;

use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::{Position, Range};

use crate::review::{Comment, CommentLocation};

/// An open document: its path and the UTF-16 length of every line.
///
/// Mirrors editor semantics: `"a\n"` has two lines and an empty document has one.
#[derive(Debug, Clone)]
pub struct Buffer {
    path: PathBuf,
    line_lengths: Vec<u32>,
}

impl Buffer {
    pub fn new(path: impl Into<PathBuf>, text: &str) -> Self {
        let line_lengths = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).encode_utf16().count() as u32)
            .collect();
        Self {
            path: path.into(),
            line_lengths,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line_count(&self) -> u32 {
        self.line_lengths.len() as u32
    }

    /// Whole span of `line`. Lines past the end get an empty span.
    pub fn line_span(&self, line: u32) -> Range {
        let len = self.line_lengths.get(line as usize).copied().unwrap_or(0);
        Range::new(Position::new(line, 0), Position::new(line, len))
    }
}

/// Buffer range a comment highlights.
///
/// Remote lines are 1-based and become 0-based; characters pass through.
/// File comments are anchored on the first line. Nothing is checked against
/// the buffer's length here.
pub fn map_to_range(comment: &Comment, buffer: &Buffer) -> Range {
    match comment.location {
        CommentLocation::Range(r) => Range::new(
            Position::new(r.start_line.saturating_sub(1), r.start_character),
            Position::new(r.end_line.saturating_sub(1), r.end_character),
        ),
        CommentLocation::Line(line) => buffer.line_span(line.saturating_sub(1)),
        CommentLocation::File => buffer.line_span(0),
    }
}

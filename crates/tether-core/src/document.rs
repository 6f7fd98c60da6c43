//! Document model seen by the session layer.
//!
//! The editor owns text storage; tether only needs the small surface in
//! [`DocumentHost`]. [`Buffer`] and [`Documents`] are an in-memory host used by
//! the CLI and the tests.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::anchor::{AnchorId, AnchorTable, Gravity, Position, ResolvedAnchor, TextEdit};
use crate::error::{Error, Result};

/// Opaque handle for an open document (an editor buffer number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

impl DocumentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cursor location reported by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub document: DocumentId,
    pub position: Position,
}

/// Interface consumed from the editor.
///
/// Ranges returned by [`DocumentHost::selection`] and
/// [`DocumentHost::operator_range`] are inclusive on both ends, the way an
/// editor reports the marks of the last visual selection or motion.
pub trait DocumentHost {
    /// Anchor table of a document.
    fn anchors(&self, document: DocumentId) -> Result<&AnchorTable>;

    /// Mutable anchor table of a document.
    fn anchors_mut(&mut self, document: DocumentId) -> Result<&mut AnchorTable>;

    /// Number of lines in a document.
    fn line_count(&self, document: DocumentId) -> Result<usize>;

    /// Length of a line in `char`s, or `None` past the last line.
    fn line_len(&self, document: DocumentId, line: usize) -> Result<Option<usize>>;

    /// Text in `[begin, end)`.
    fn text_between(&self, document: DocumentId, begin: Position, end: Position)
    -> Result<String>;

    /// Where the cursor currently is.
    fn cursor(&self) -> Cursor;

    /// Bounds of the last visual selection in a document.
    fn selection(&self, document: DocumentId) -> Result<Option<(Position, Position)>>;

    /// Bounds of the last operator motion in a document.
    fn operator_range(&self, document: DocumentId) -> Result<Option<(Position, Position)>>;

    /// Register a tracked point, rejecting coordinates outside the document.
    fn create_anchor(&mut self, document: DocumentId, position: Position) -> Result<AnchorId> {
        self.create_anchor_with_gravity(document, position, Gravity::Right)
    }

    fn create_anchor_with_gravity(
        &mut self,
        document: DocumentId,
        position: Position,
        gravity: Gravity,
    ) -> Result<AnchorId> {
        match self.line_len(document, position.line)? {
            Some(len) if position.column <= len => {
                Ok(self.anchors_mut(document)?.insert_with_gravity(position, gravity))
            }
            _ => Err(Error::InvalidLocation { document, position }),
        }
    }

    /// Current coordinates and liveness of an anchor.
    fn resolve_anchor(&self, document: DocumentId, id: AnchorId) -> Result<Option<ResolvedAnchor>> {
        Ok(self.anchors(document)?.resolve(id))
    }
}

/// Line-based text buffer that keeps its anchors in sync with edits.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    lines: Vec<String>,
    anchors: AnchorTable,
}

impl Buffer {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(str::to_string).collect(),
            anchors: AnchorTable::new(),
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, line: usize) -> Option<&str> {
        self.lines.get(line).map(String::as_str)
    }

    pub fn line_len(&self, line: usize) -> Option<usize> {
        self.line(line).map(|l| l.chars().count())
    }

    pub fn anchors(&self) -> &AnchorTable {
        &self.anchors
    }

    pub fn anchors_mut(&mut self) -> &mut AnchorTable {
        &mut self.anchors
    }

    fn contains(&self, pos: Position) -> bool {
        self.line_len(pos.line).is_some_and(|len| pos.column <= len)
    }

    fn byte_offset(line: &str, column: usize) -> usize {
        line.char_indices()
            .nth(column)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    /// Text in `[begin, end)`. Both ends must be valid positions.
    pub fn text_between(&self, begin: Position, end: Position) -> Option<String> {
        if begin > end || !self.contains(begin) || !self.contains(end) {
            return None;
        }

        let first = &self.lines[begin.line];
        let start = Self::byte_offset(first, begin.column);
        if begin.line == end.line {
            let stop = Self::byte_offset(first, end.column);
            return Some(first[start..stop].to_string());
        }

        let mut out = first[start..].to_string();
        for line in &self.lines[begin.line + 1..end.line] {
            out.push('\n');
            out.push_str(line);
        }
        let last = &self.lines[end.line];
        out.push('\n');
        out.push_str(&last[..Self::byte_offset(last, end.column)]);
        Some(out)
    }

    /// Apply an edit and move anchors accordingly.
    ///
    /// Returns `false` without touching the buffer if the range is invalid.
    pub fn apply_edit(&mut self, edit: &TextEdit) -> bool {
        if edit.start > edit.end || !self.contains(edit.start) || !self.contains(edit.end) {
            return false;
        }

        let head = {
            let line = &self.lines[edit.start.line];
            line[..Self::byte_offset(line, edit.start.column)].to_string()
        };
        let tail = {
            let line = &self.lines[edit.end.line];
            line[Self::byte_offset(line, edit.end.column)..].to_string()
        };

        let joined = format!("{}{}{}", head, edit.text, tail);
        let replacement: Vec<String> = joined.split('\n').map(str::to_string).collect();
        drop(self.lines.splice(edit.start.line..=edit.end.line, replacement));

        self.anchors.apply_edit(edit);
        true
    }
}

/// In-memory set of open documents plus editor cursor/mark state.
#[derive(Debug)]
pub struct Documents {
    next_id: u64,
    buffers: FxHashMap<DocumentId, Buffer>,
    cursor: Cursor,
    selections: FxHashMap<DocumentId, (Position, Position)>,
    operator_ranges: FxHashMap<DocumentId, (Position, Position)>,
}

impl Default for Documents {
    fn default() -> Self {
        Self::new()
    }
}

impl Documents {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffers: FxHashMap::default(),
            cursor: Cursor {
                document: DocumentId(0),
                position: Position::default(),
            },
            selections: FxHashMap::default(),
            operator_ranges: FxHashMap::default(),
        }
    }

    /// Open a document and make it current.
    pub fn open(&mut self, text: &str) -> DocumentId {
        let id = DocumentId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, Buffer::from_text(text));
        self.cursor = Cursor {
            document: id,
            position: Position::default(),
        };
        id
    }

    /// Drop a document. Anchors go with it.
    pub fn close(&mut self, document: DocumentId) -> Option<Buffer> {
        self.selections.remove(&document);
        self.operator_ranges.remove(&document);
        self.buffers.remove(&document)
    }

    pub fn buffer(&self, document: DocumentId) -> Result<&Buffer> {
        self.buffers
            .get(&document)
            .ok_or(Error::UnknownDocument(document))
    }

    fn buffer_mut(&mut self, document: DocumentId) -> Result<&mut Buffer> {
        self.buffers
            .get_mut(&document)
            .ok_or(Error::UnknownDocument(document))
    }

    /// Apply an edit to a document.
    pub fn edit(&mut self, document: DocumentId, edit: &TextEdit) -> Result<()> {
        if self.buffer_mut(document)?.apply_edit(edit) {
            Ok(())
        } else {
            Err(Error::InvalidLocation {
                document,
                position: edit.start,
            })
        }
    }

    pub fn set_cursor(&mut self, document: DocumentId, position: Position) {
        self.cursor = Cursor { document, position };
    }

    pub fn set_selection(&mut self, document: DocumentId, begin: Position, end: Position) {
        self.selections.insert(document, (begin, end));
    }

    pub fn set_operator_range(&mut self, document: DocumentId, begin: Position, end: Position) {
        self.operator_ranges.insert(document, (begin, end));
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.buffers.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl DocumentHost for Documents {
    fn anchors(&self, document: DocumentId) -> Result<&AnchorTable> {
        Ok(self.buffer(document)?.anchors())
    }

    fn anchors_mut(&mut self, document: DocumentId) -> Result<&mut AnchorTable> {
        Ok(self.buffer_mut(document)?.anchors_mut())
    }

    fn line_count(&self, document: DocumentId) -> Result<usize> {
        Ok(self.buffer(document)?.line_count())
    }

    fn line_len(&self, document: DocumentId, line: usize) -> Result<Option<usize>> {
        Ok(self.buffer(document)?.line_len(line))
    }

    fn text_between(
        &self,
        document: DocumentId,
        begin: Position,
        end: Position,
    ) -> Result<String> {
        self.buffer(document)?
            .text_between(begin, end)
            .ok_or(Error::InvalidLocation {
                document,
                position: end,
            })
    }

    fn cursor(&self) -> Cursor {
        self.cursor
    }

    fn selection(&self, document: DocumentId) -> Result<Option<(Position, Position)>> {
        self.buffer(document)?;
        Ok(self.selections.get(&document).copied())
    }

    fn operator_range(&self, document: DocumentId) -> Result<Option<(Position, Position)>> {
        self.buffer(document)?;
        Ok(self.operator_ranges.get(&document).copied())
    }
}

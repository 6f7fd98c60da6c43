//! Insertion-ordered map from spans to execution records.

use crate::anchor::{AnchorTable, Position};
use crate::record::ExecutionRecord;
use crate::span::Span;

/// Spans submitted from one document, oldest first.
///
/// Lookups by cursor walk the list newest first, so a later execution shadows
/// an earlier one it overlaps. This holds for crossing spans as well as
/// nested ones.
#[derive(Debug, Default)]
pub struct SpanRegistry {
    entries: Vec<(Span, ExecutionRecord)>,
}

impl SpanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an execution. Re-inserting a span replaces its record and moves
    /// it to the newest position.
    pub fn insert(&mut self, span: Span, record: ExecutionRecord) {
        self.entries.retain(|(existing, _)| *existing != span);
        self.entries.push((span, record));
    }

    pub fn get(&self, span: &Span) -> Option<&ExecutionRecord> {
        self.entries
            .iter()
            .find(|(s, _)| s == span)
            .map(|(_, record)| record)
    }

    pub fn get_mut(&mut self, span: &Span) -> Option<&mut ExecutionRecord> {
        self.entries
            .iter_mut()
            .find(|(s, _)| s == span)
            .map(|(_, record)| record)
    }

    /// Record for the execute request with this message id.
    pub fn record_by_msg_mut(&mut self, msg_id: &str) -> Option<&mut ExecutionRecord> {
        self.entries
            .iter_mut()
            .rev()
            .find(|(_, record)| record.msg_id == msg_id)
            .map(|(_, record)| record)
    }

    /// Most recently created live span containing `point`.
    pub fn find_innermost(&self, anchors: &AnchorTable, point: Position) -> Option<Span> {
        self.iter_rev()
            .map(|(span, _)| *span)
            .find(|span| span.contains(anchors, point))
    }

    /// Drop a span and its record, releasing its anchors. Unknown spans are
    /// ignored.
    pub fn remove(&mut self, anchors: &mut AnchorTable, span: &Span) -> Option<ExecutionRecord> {
        let idx = self.entries.iter().position(|(s, _)| s == span)?;
        let (span, record) = self.entries.remove(idx);
        span.release(anchors);
        Some(record)
    }

    /// Release every span.
    pub fn clear(&mut self, anchors: &mut AnchorTable) {
        for (span, _) in self.entries.drain(..) {
            span.release(anchors);
        }
    }

    /// Newest first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &(Span, ExecutionRecord)> {
        self.entries.iter().rev()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &(Span, ExecutionRecord)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

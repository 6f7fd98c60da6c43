//! Code regions delimited by a pair of anchors.

use crate::anchor::{AnchorId, AnchorTable, Gravity, Position};
use crate::document::{DocumentHost, DocumentId};
use crate::error::{Error, Result};

/// Region `[begin, end)` of one document, tracked across edits.
///
/// A span only holds anchor ids; the positions live in the document's
/// [`AnchorTable`]. Release it with [`Span::release`] once its execution
/// record is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    document: DocumentId,
    begin: AnchorId,
    end: AnchorId,
}

impl Span {
    /// Anchor `[begin, end)` in `document`. Reversed bounds are swapped.
    pub fn create(
        host: &mut impl DocumentHost,
        document: DocumentId,
        begin: Position,
        end: Position,
    ) -> Result<Self> {
        let (begin, end) = if begin <= end { (begin, end) } else { (end, begin) };

        let begin_id = host.create_anchor(document, begin)?;
        let end_id = match host.create_anchor_with_gravity(document, end, Gravity::Left) {
            Ok(id) => id,
            Err(e) => {
                host.anchors_mut(document)?.release(begin_id);
                return Err(e);
            }
        };

        Ok(Self {
            document,
            begin: begin_id,
            end: end_id,
        })
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Current bounds, or `None` once either anchor is dead or released.
    pub fn bounds(&self, anchors: &AnchorTable) -> Option<(Position, Position)> {
        let begin = anchors.resolve(self.begin).filter(|a| a.is_live)?;
        let end = anchors.resolve(self.end).filter(|a| a.is_live)?;
        Some((begin.position, end.position))
    }

    pub fn is_live(&self, anchors: &AnchorTable) -> bool {
        self.bounds(anchors).is_some()
    }

    /// `begin <= point < end` on a live span.
    pub fn contains(&self, anchors: &AnchorTable, point: Position) -> bool {
        self.bounds(anchors)
            .is_some_and(|(begin, end)| begin <= point && point < end)
    }

    /// Text currently covered by the span.
    pub fn text(&self, host: &impl DocumentHost) -> Result<String> {
        let (begin, end) = self
            .bounds(host.anchors(self.document)?)
            .ok_or(Error::SpanDeleted(self.document))?;
        host.text_between(self.document, begin, end)
    }

    /// Give both anchors back to the document.
    pub fn release(self, anchors: &mut AnchorTable) {
        anchors.release(self.begin);
        anchors.release(self.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::TextEdit;
    use crate::document::Documents;

    fn pos(line: usize, column: usize) -> Position {
        Position::new(line, column)
    }

    #[test]
    fn test_contains_is_end_exclusive() {
        let mut docs = Documents::new();
        let doc = docs.open("a = 1 + 1\nb = 2");
        let span = Span::create(&mut docs, doc, pos(0, 4), pos(0, 9)).unwrap();
        let anchors = docs.anchors(doc).unwrap();

        assert!(span.contains(anchors, pos(0, 4)));
        assert!(span.contains(anchors, pos(0, 8)));
        assert!(!span.contains(anchors, pos(0, 9)));
        assert!(!span.contains(anchors, pos(0, 3)));
    }

    #[test]
    fn test_reversed_bounds_are_ordered() {
        let mut docs = Documents::new();
        let doc = docs.open("first\nsecond");
        let span = Span::create(&mut docs, doc, pos(1, 3), pos(0, 2)).unwrap();

        assert_eq!(
            span.bounds(docs.anchors(doc).unwrap()),
            Some((pos(0, 2), pos(1, 3)))
        );
        assert_eq!(span.text(&docs).unwrap(), "rst\nsec");
    }

    #[test]
    fn test_failed_end_anchor_releases_begin() {
        let mut docs = Documents::new();
        let doc = docs.open("x");

        let result = Span::create(&mut docs, doc, pos(0, 0), pos(4, 0));

        assert!(matches!(result, Err(Error::InvalidLocation { .. })));
        assert!(docs.anchors(doc).unwrap().is_empty());
    }

    #[test]
    fn test_span_follows_edits() {
        let mut docs = Documents::new();
        let doc = docs.open("print(1+1)");
        let span = Span::create(&mut docs, doc, pos(0, 6), pos(0, 9)).unwrap();

        docs.edit(doc, &TextEdit::insert(pos(0, 0), "x = 0\n")).unwrap();

        assert_eq!(span.text(&docs).unwrap(), "1+1");
        assert!(span.contains(docs.anchors(doc).unwrap(), pos(1, 7)));
    }

    #[test]
    fn test_deleted_span_is_not_live() {
        let mut docs = Documents::new();
        let doc = docs.open("keep\ndrop me\nkeep");
        let span = Span::create(&mut docs, doc, pos(1, 0), pos(1, 7)).unwrap();

        docs.edit(doc, &TextEdit::delete(pos(0, 4), pos(1, 7))).unwrap();

        let anchors = docs.anchors(doc).unwrap();
        assert!(!span.is_live(anchors));
        assert!(!span.contains(anchors, pos(0, 0)));
        assert!(matches!(span.text(&docs), Err(Error::SpanDeleted(_))));
    }

    #[test]
    fn test_release_frees_anchors() {
        let mut docs = Documents::new();
        let doc = docs.open("abc");
        let span = Span::create(&mut docs, doc, pos(0, 0), pos(0, 3)).unwrap();
        assert_eq!(docs.anchors(doc).unwrap().len(), 2);

        span.release(docs.anchors_mut(doc).unwrap());

        assert!(docs.anchors(doc).unwrap().is_empty());
        assert!(!span.is_live(docs.anchors(doc).unwrap()));
    }
}

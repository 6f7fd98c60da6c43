//! Integration tests for span tracking across document edits.
//!
//! Drives the public document, span and span registry API the way an editor
//! host would, without a kernel.

use tether_core::{
    DocumentHost, Documents, ExecutionRecord, Position, Span, SpanRegistry, TextEdit,
};

fn pos(line: usize, column: usize) -> Position {
    Position::new(line, column)
}

/// A sequence of edits that never touches the anchored text shifts the
/// anchor by the net line and column deltas.
#[test]
fn test_anchor_follows_unrelated_edits() {
    let mut docs = Documents::new();
    let doc = docs.open("alpha\nbeta gamma\ndelta");

    let anchor = docs.create_anchor(doc, pos(1, 5)).unwrap();

    // Before the anchor on an earlier line: two lines added.
    docs.edit(doc, &TextEdit::insert(pos(0, 5), "\none\ntwo"))
        .unwrap();
    // Before the anchor on its own line: three columns added.
    docs.edit(doc, &TextEdit::insert(pos(3, 0), ">> "))
        .unwrap();
    // After the anchor: no effect.
    docs.edit(doc, &TextEdit::delete(pos(4, 0), pos(4, 5)))
        .unwrap();
    // Join the anchor's line onto the previous one.
    docs.edit(doc, &TextEdit::delete(pos(2, 3), pos(3, 0)))
        .unwrap();

    let resolved = docs.resolve_anchor(doc, anchor).unwrap().unwrap();
    assert!(resolved.is_live);
    assert_eq!(resolved.position, pos(2, 11));
    assert_eq!(
        docs.buffer(doc).unwrap().line(2),
        Some("two>> beta gamma")
    );
}

#[test]
fn test_deleting_the_anchored_text_tombstones() {
    let mut docs = Documents::new();
    let doc = docs.open("keep this\ndrop this line\nkeep that");

    let inside = docs.create_anchor(doc, pos(1, 5)).unwrap();
    let after = docs.create_anchor(doc, pos(2, 0)).unwrap();

    docs.edit(doc, &TextEdit::delete(pos(1, 0), pos(2, 0)))
        .unwrap();

    assert!(!docs.resolve_anchor(doc, inside).unwrap().unwrap().is_live);
    let after = docs.resolve_anchor(doc, after).unwrap().unwrap();
    assert!(after.is_live);
    assert_eq!(after.position, pos(1, 0));
}

#[test]
fn test_nested_then_outer_edit_lifecycle() {
    let mut docs = Documents::new();
    let doc = docs.open("for i in range(3):\n    total += i\nprint(total)");
    let mut registry = SpanRegistry::new();

    let block = Span::create(&mut docs, doc, pos(0, 0), pos(1, 14)).unwrap();
    registry.insert(block, ExecutionRecord::new(block.text(&docs).unwrap(), "m-1"));
    let inner = Span::create(&mut docs, doc, pos(1, 4), pos(1, 14)).unwrap();
    registry.insert(inner, ExecutionRecord::new(inner.text(&docs).unwrap(), "m-2"));

    // Both contain the cursor; the later one wins.
    assert_eq!(
        registry.find_innermost(docs.anchors(doc).unwrap(), pos(1, 8)),
        Some(inner)
    );

    // Rewriting the loop body kills the inner span but not the block.
    docs.edit(doc, &TextEdit::replace(pos(1, 4), pos(1, 14), "total -= i"))
        .unwrap();
    let anchors = docs.anchors(doc).unwrap();
    assert!(!inner.is_live(anchors));
    assert!(block.is_live(anchors));
    assert_eq!(registry.find_innermost(anchors, pos(1, 8)), Some(block));

    // Nothing matches past the block.
    assert_eq!(registry.find_innermost(anchors, pos(2, 3)), None);

    let anchors = docs.anchors_mut(doc).unwrap();
    registry.remove(anchors, &inner);
    registry.remove(anchors, &inner);
    registry.clear(anchors);
    assert!(anchors.is_empty());
}

/// Edits touching only the text right after a span leave it alone.
#[test]
fn test_span_survives_edits_at_its_end() {
    let mut docs = Documents::new();
    let doc = docs.open("x = 1\ny = 2");

    let span = Span::create(&mut docs, doc, pos(0, 0), pos(0, 5)).unwrap();

    // Join the next line onto the span's line.
    docs.edit(doc, &TextEdit::delete(pos(0, 5), pos(1, 0)))
        .unwrap();
    assert!(span.is_live(docs.anchors(doc).unwrap()));
    assert_eq!(span.text(&docs).unwrap(), "x = 1");

    // Typing straight after the span does not extend it.
    docs.edit(doc, &TextEdit::insert(pos(0, 5), "; "))
        .unwrap();
    assert_eq!(span.text(&docs).unwrap(), "x = 1");
    assert_eq!(docs.buffer(doc).unwrap().line(0), Some("x = 1; y = 2"));
}

#[test]
fn test_out_of_bounds_anchor_is_rejected() {
    let mut docs = Documents::new();
    let doc = docs.open("short");

    assert!(docs.create_anchor(doc, pos(0, 5)).is_ok());
    assert!(matches!(
        docs.create_anchor(doc, pos(0, 6)),
        Err(tether_core::Error::InvalidLocation { .. })
    ));
    assert!(matches!(
        Span::create(&mut docs, doc, pos(0, 0), pos(3, 0)),
        Err(tether_core::Error::InvalidLocation { .. })
    ));
}

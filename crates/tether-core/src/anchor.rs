//! Edit-tracking positions.
//!
//! An [`AnchorTable`] is owned by a document and holds every tracked point in
//! it. Callers only keep [`AnchorId`]s: the table never extends an anchor's
//! lifetime past [`AnchorTable::release`], and a released id stays dead even
//! after its slot is reused (ids carry a generation).
//!
//! Edits are described as a [`TextEdit`] replacing `[start, end)` with new
//! text. For each live anchor at `p`:
//!
//! - `p < start`: unchanged
//! - `start <= p < end`: the character under the anchor was deleted, so the
//!   anchor is tombstoned instead of being moved
//! - `p >= end`: shifted by the net line/column effect of the edit
//!
//! A pure insertion at `p` shifts the anchor to the end of the inserted text.
//!
//! Span ends use [`Gravity::Left`]. An end anchor sits on the character
//! after the span, so it counts as a boundary instead: it stays put for
//! edits starting at `p`, is tombstoned only when `start < p < end`, and
//! follows the replacement text when `p == end`. Deleting the newline right
//! after a span leaves the span intact.

use std::cmp::Ordering;
use std::fmt;

/// Zero-based line/column coordinate. Columns count `char`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.line
            .cmp(&other.line)
            .then_with(|| self.column.cmp(&other.column))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which side of an edit starting exactly at an anchor the anchor keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gravity {
    /// Tracks the character at the anchor.
    #[default]
    Right,
    /// Tracks the boundary after the character before the anchor.
    Left,
}

/// Replace the text in `[start, end)` with `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub start: Position,
    pub end: Position,
    pub text: String,
}

impl TextEdit {
    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self {
            start: at,
            end: at,
            text: text.into(),
        }
    }

    pub fn delete(start: Position, end: Position) -> Self {
        Self {
            start,
            end,
            text: String::new(),
        }
    }

    pub fn replace(start: Position, end: Position, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    /// Position just past the inserted text once the edit is applied.
    pub fn inserted_end(&self) -> Position {
        let mut lines = self.text.split('\n');
        let first = lines.next().unwrap_or_default();
        match lines.enumerate().last() {
            Some((idx, last)) => Position::new(self.start.line + idx + 1, last.chars().count()),
            None => Position::new(self.start.line, self.start.column + first.chars().count()),
        }
    }

    /// Where `pos` ends up after this edit, or `None` if it was deleted.
    pub fn map_position(&self, pos: Position) -> Option<Position> {
        self.map_with_gravity(pos, Gravity::Right)
    }

    /// [`map_position`](Self::map_position) for an anchor of the given gravity.
    pub fn map_with_gravity(&self, pos: Position, gravity: Gravity) -> Option<Position> {
        let unchanged = match gravity {
            Gravity::Right => pos < self.start,
            Gravity::Left => pos <= self.start,
        };
        if unchanged {
            return Some(pos);
        }
        if pos < self.end {
            return None;
        }

        let new_end = self.inserted_end();
        if pos.line == self.end.line {
            Some(Position::new(
                new_end.line,
                new_end.column + (pos.column - self.end.column),
            ))
        } else {
            Some(Position::new(
                pos.line - self.end.line + new_end.line,
                pos.column,
            ))
        }
    }
}

/// Handle to a tracked point inside one document's [`AnchorTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnchorId {
    index: u32,
    generation: u32,
}

/// Current state of an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAnchor {
    pub position: Position,
    pub is_live: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    gravity: Gravity,
    point: Option<ResolvedAnchor>,
}

/// Arena of anchors belonging to a single document.
#[derive(Debug, Default, Clone)]
pub struct AnchorTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    tracked: usize,
}

impl AnchorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `position`. Bounds are the document's responsibility.
    pub fn insert(&mut self, position: Position) -> AnchorId {
        self.insert_with_gravity(position, Gravity::Right)
    }

    pub fn insert_with_gravity(&mut self, position: Position, gravity: Gravity) -> AnchorId {
        let point = Some(ResolvedAnchor {
            position,
            is_live: true,
        });
        self.tracked += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.gravity = gravity;
            slot.point = point;
            return AnchorId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            gravity,
            point,
        });
        AnchorId {
            index,
            generation: 0,
        }
    }

    /// Look up an anchor. Released or foreign ids resolve to `None`.
    pub fn resolve(&self, id: AnchorId) -> Option<ResolvedAnchor> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.point)
    }

    /// Stop tracking an anchor. Returns `false` if it was already released.
    pub fn release(&mut self, id: AnchorId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.point.is_none() {
            return false;
        }

        slot.point = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.tracked -= 1;
        true
    }

    /// Update every live anchor for an edit that was just applied.
    pub fn apply_edit(&mut self, edit: &TextEdit) {
        for slot in &mut self.slots {
            let gravity = slot.gravity;
            let Some(point) = slot.point.as_mut().filter(|p| p.is_live) else {
                continue;
            };
            match edit.map_with_gravity(point.position, gravity) {
                Some(position) => point.position = position,
                None => point.is_live = false,
            }
        }
    }

    /// Number of anchors currently tracked (live or tombstoned).
    pub fn len(&self) -> usize {
        self.tracked
    }

    pub fn is_empty(&self) -> bool {
        self.tracked == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: usize, column: usize) -> Position {
        Position::new(line, column)
    }

    #[test]
    fn test_position_ordering() {
        assert!(pos(0, 9) < pos(1, 0));
        assert!(pos(2, 1) < pos(2, 3));
        assert_eq!(pos(4, 4).cmp(&pos(4, 4)), Ordering::Equal);
    }

    #[test]
    fn test_edit_before_anchor_on_same_line_shifts_column() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(0, 5));

        table.apply_edit(&TextEdit::insert(pos(0, 1), "abc"));
        assert_eq!(table.resolve(id).unwrap().position, pos(0, 8));

        table.apply_edit(&TextEdit::delete(pos(0, 0), pos(0, 2)));
        assert_eq!(table.resolve(id).unwrap().position, pos(0, 6));
    }

    #[test]
    fn test_newline_insertion_moves_anchor_down() {
        let mut table = AnchorTable::new();
        let same_line = table.insert(pos(1, 4));
        let later_line = table.insert(pos(3, 2));

        table.apply_edit(&TextEdit::insert(pos(1, 2), "x\nyy\n"));

        assert_eq!(table.resolve(same_line).unwrap().position, pos(3, 2));
        assert_eq!(table.resolve(later_line).unwrap().position, pos(5, 2));
    }

    #[test]
    fn test_joining_lines_rebases_column() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(2, 3));

        // Delete from the end of line 0 to the start of line 2.
        table.apply_edit(&TextEdit::delete(pos(0, 4), pos(2, 0)));

        assert_eq!(table.resolve(id).unwrap().position, pos(0, 7));
    }

    #[test]
    fn test_edit_after_anchor_is_ignored() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(1, 1));

        table.apply_edit(&TextEdit::replace(pos(1, 2), pos(4, 0), "zzz"));
        table.apply_edit(&TextEdit::insert(pos(7, 0), "tail"));

        assert_eq!(table.resolve(id).unwrap().position, pos(1, 1));
    }

    #[test]
    fn test_net_delta_over_edit_sequence() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(3, 6));

        let edits = [
            TextEdit::insert(pos(0, 0), "header\n\n"),
            TextEdit::delete(pos(1, 0), pos(2, 0)),
            TextEdit::insert(pos(4, 0), "ab"),
            TextEdit::replace(pos(4, 0), pos(4, 2), "abcd"),
        ];
        for edit in &edits {
            table.apply_edit(edit);
        }

        // +1 line net, then +4 columns on the anchor's line.
        assert_eq!(
            table.resolve(id).unwrap(),
            ResolvedAnchor {
                position: pos(4, 10),
                is_live: true,
            }
        );
    }

    #[test]
    fn test_deleting_anchor_character_tombstones_it() {
        let mut table = AnchorTable::new();
        let inside = table.insert(pos(1, 3));
        let at_start = table.insert(pos(1, 1));
        let at_end = table.insert(pos(1, 5));

        table.apply_edit(&TextEdit::delete(pos(1, 1), pos(1, 5)));

        assert!(!table.resolve(inside).unwrap().is_live);
        assert!(!table.resolve(at_start).unwrap().is_live);
        let end = table.resolve(at_end).unwrap();
        assert!(end.is_live);
        assert_eq!(end.position, pos(1, 1));
    }

    #[test]
    fn test_tombstone_is_sticky() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(0, 2));

        table.apply_edit(&TextEdit::delete(pos(0, 0), pos(0, 4)));
        let dead = table.resolve(id).unwrap();
        table.apply_edit(&TextEdit::insert(pos(0, 0), "restored"));

        assert_eq!(table.resolve(id).unwrap(), dead);
    }

    #[test]
    fn test_insertion_at_anchor_pushes_it_right() {
        let mut table = AnchorTable::new();
        let id = table.insert(pos(0, 2));

        table.apply_edit(&TextEdit::insert(pos(0, 2), "++"));

        assert_eq!(table.resolve(id).unwrap().position, pos(0, 4));
    }

    #[test]
    fn test_left_gravity_tracks_boundary() {
        let mut table = AnchorTable::new();
        // End of "x = 1" on line 0, followed by "\ny = 2".
        let end = table.insert_with_gravity(pos(0, 5), Gravity::Left);
        let point = table.insert(pos(0, 5));

        // Typing right at the boundary leaves it before the new text.
        table.apply_edit(&TextEdit::insert(pos(0, 5), " # one"));
        assert_eq!(table.resolve(end).unwrap().position, pos(0, 5));
        assert_eq!(table.resolve(point).unwrap().position, pos(0, 11));

        // Joining the next line deletes the character after the boundary.
        table.apply_edit(&TextEdit::delete(pos(0, 5), pos(1, 0)));
        assert!(table.resolve(end).unwrap().is_live);
        assert!(!table.resolve(point).unwrap().is_live);
    }

    #[test]
    fn test_left_gravity_follows_replaced_tail() {
        let mut table = AnchorTable::new();
        let end = table.insert_with_gravity(pos(1, 14), Gravity::Left);
        let inside = table.insert_with_gravity(pos(1, 8), Gravity::Left);

        table.apply_edit(&TextEdit::replace(pos(1, 4), pos(1, 14), "t -= i"));

        assert_eq!(table.resolve(end).unwrap().position, pos(1, 10));
        assert!(!table.resolve(inside).unwrap().is_live);
    }

    #[test]
    fn test_release_invalidates_reused_slot() {
        let mut table = AnchorTable::new();
        let old = table.insert(pos(0, 0));
        assert!(table.release(old));
        assert!(!table.release(old));

        let new = table.insert(pos(5, 5));
        assert_eq!(table.len(), 1);
        assert!(table.resolve(old).is_none());
        assert_eq!(table.resolve(new).unwrap().position, pos(5, 5));
    }
}

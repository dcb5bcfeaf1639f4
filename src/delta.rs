//! Rich-text delta data model.
//!
//! A [`Delta`] is the sole content and edit representation: an ordered
//! sequence of retain/insert/delete operations over a position cursor.
//! Wire format (JSON array of single-key objects):
//! ```text
//! [{"insert":"Hello"}]
//! [{"retain":1},{"insert":"B"}]
//! [{"retain":2,"attributes":{"bold":true}},{"delete":3}]
//! ```
//!
//! Construction through [`Delta::push`] normalizes as it goes: zero-length
//! operations are dropped, adjacent operations of the same kind and
//! attributes merge, and an insert landing directly after a delete is
//! swapped in front of it (the two orders are equivalent; one canonical
//! form keeps equality structural). Deltas received off the wire are not
//! trusted to be canonical — run them through [`Delta::normalize`] first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Formatting attributes attached to a retain or insert.
///
/// A `null` value removes the attribute when composed over existing
/// formatting. Ordered map so serialized form and equality are stable.
pub type Attributes = BTreeMap<String, Value>;

/// Drop an empty attribute map down to `None`.
pub(crate) fn non_empty(attrs: Attributes) -> Option<Attributes> {
    if attrs.is_empty() { None } else { Some(attrs) }
}

/// The payload of an insert: a text run or a single embed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertContent {
    /// A run of text, measured in characters.
    Text(String),
    /// An embedded object (image, mention, ...), always length 1.
    Embed(serde_json::Map<String, Value>),
}

/// One operation in a delta.
///
/// Serde matches variants by their distinguishing key, which reproduces
/// the single-key JSON object form on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaOp {
    /// Advance the cursor `retain` units, optionally restyling them.
    Retain {
        retain: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    /// Insert text or an embed at the cursor.
    Insert {
        insert: InsertContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    /// Remove `delete` units at the cursor.
    Delete { delete: u64 },
}

impl DeltaOp {
    /// Plain retain.
    pub fn retain(n: u64) -> Self {
        DeltaOp::Retain { retain: n, attributes: None }
    }

    /// Retain with a formatting override.
    pub fn retain_attr(n: u64, attributes: Attributes) -> Self {
        DeltaOp::Retain { retain: n, attributes: non_empty(attributes) }
    }

    /// Plain text insert.
    pub fn insert(text: impl Into<String>) -> Self {
        DeltaOp::Insert { insert: InsertContent::Text(text.into()), attributes: None }
    }

    /// Text insert with formatting.
    pub fn insert_attr(text: impl Into<String>, attributes: Attributes) -> Self {
        DeltaOp::Insert {
            insert: InsertContent::Text(text.into()),
            attributes: non_empty(attributes),
        }
    }

    /// Embed insert (length 1).
    pub fn embed(object: serde_json::Map<String, Value>) -> Self {
        DeltaOp::Insert { insert: InsertContent::Embed(object), attributes: None }
    }

    /// Delete.
    pub fn delete(n: u64) -> Self {
        DeltaOp::Delete { delete: n }
    }

    /// Length of this op in cursor units. Text inserts are measured in
    /// characters; embeds count as one unit.
    pub fn length(&self) -> u64 {
        match self {
            DeltaOp::Retain { retain, .. } => *retain,
            DeltaOp::Delete { delete } => *delete,
            DeltaOp::Insert { insert: InsertContent::Text(s), .. } => s.chars().count() as u64,
            DeltaOp::Insert { insert: InsertContent::Embed(_), .. } => 1,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, DeltaOp::Insert { .. })
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, DeltaOp::Retain { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, DeltaOp::Delete { .. })
    }

    /// Attributes carried by this op, if any.
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            DeltaOp::Retain { attributes, .. } | DeltaOp::Insert { attributes, .. } => {
                attributes.as_ref()
            }
            DeltaOp::Delete { .. } => None,
        }
    }
}

/// An ordered sequence of operations. See the module docs for the
/// normalization rules enforced by [`Delta::push`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    ops: Vec<DeltaOp>,
}

impl Delta {
    /// The empty delta (identity for compose and transform).
    pub fn new() -> Self {
        Delta { ops: Vec::new() }
    }

    /// The operations in order.
    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append an op, merging and reordering per the canonical form.
    pub fn push(&mut self, op: DeltaOp) {
        if op.length() == 0 {
            return;
        }
        // Merge adjacent deletes.
        if let DeltaOp::Delete { delete: add } = &op {
            if let Some(DeltaOp::Delete { delete: last }) = self.ops.last_mut() {
                *last += *add;
                return;
            }
        }
        let mut index = self.ops.len();
        // Insert before delete at the same position: the orders are
        // equivalent, inserts go first canonically.
        if op.is_insert() && matches!(self.ops.last(), Some(DeltaOp::Delete { .. })) {
            index -= 1;
        }
        if index > 0 {
            let merged = match (&self.ops[index - 1], &op) {
                (
                    DeltaOp::Insert { insert: InsertContent::Text(a), attributes: attr_a },
                    DeltaOp::Insert { insert: InsertContent::Text(b), attributes: attr_b },
                ) if attr_a == attr_b => Some(DeltaOp::Insert {
                    insert: InsertContent::Text(format!("{a}{b}")),
                    attributes: attr_a.clone(),
                }),
                (
                    DeltaOp::Retain { retain: a, attributes: attr_a },
                    DeltaOp::Retain { retain: b, attributes: attr_b },
                ) if attr_a == attr_b => {
                    Some(DeltaOp::Retain { retain: a + b, attributes: attr_a.clone() })
                }
                _ => None,
            };
            if let Some(merged) = merged {
                self.ops[index - 1] = merged;
                return;
            }
        }
        self.ops.insert(index, op);
    }

    /// Builder-style plain retain.
    pub fn retain(mut self, n: u64) -> Self {
        self.push(DeltaOp::retain(n));
        self
    }

    /// Builder-style retain with attributes.
    pub fn retain_attr(mut self, n: u64, attributes: Attributes) -> Self {
        self.push(DeltaOp::retain_attr(n, attributes));
        self
    }

    /// Builder-style text insert.
    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(DeltaOp::insert(text));
        self
    }

    /// Builder-style text insert with attributes.
    pub fn insert_attr(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(DeltaOp::insert_attr(text, attributes));
        self
    }

    /// Builder-style delete.
    pub fn delete(mut self, n: u64) -> Self {
        self.push(DeltaOp::delete(n));
        self
    }

    /// Drop a trailing plain retain; it carries no information.
    pub fn chop(mut self) -> Self {
        if let Some(DeltaOp::Retain { attributes: None, .. }) = self.ops.last() {
            self.ops.pop();
        }
        self
    }

    /// Rebuild through `push` to reach the canonical form. Wire input must
    /// pass through here before structural equality or engine use.
    pub fn normalize(self) -> Self {
        let mut out = Delta::new();
        for op in self.ops {
            out.push(op);
        }
        out.chop()
    }

    /// Total length in cursor units.
    pub fn length(&self) -> u64 {
        self.ops.iter().map(DeltaOp::length).sum()
    }

    /// Length of the state this delta applies to (retains + deletes).
    pub fn base_length(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| !op.is_insert())
            .map(DeltaOp::length)
            .sum()
    }

    /// Length of the state after this delta applies (retains + inserts).
    pub fn target_length(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| !op.is_delete())
            .map(DeltaOp::length)
            .sum()
    }

    /// Sub-delta covering `[start, end)` in cursor units.
    pub fn slice(&self, start: u64, end: u64) -> Delta {
        let mut iter = OpIter::new(&self.ops);
        let mut out = Delta::new();
        let mut index = 0u64;
        while index < end && iter.has_next() {
            let available = iter.peek_length();
            if index < start {
                let skip = available.min(start - index);
                iter.next_op(skip);
                index += skip;
            } else {
                let take = available.min(end - index);
                out.push(iter.next_op(take));
                index += take;
            }
        }
        out
    }

    /// Concatenated text of all text inserts. Embeds contribute nothing;
    /// meaningful for document content, which is insert-only.
    pub fn text(&self) -> String {
        let mut s = String::new();
        for op in &self.ops {
            if let DeltaOp::Insert { insert: InsertContent::Text(t), .. } = op {
                s.push_str(t);
            }
        }
        s
    }
}

impl FromIterator<DeltaOp> for Delta {
    fn from_iter<I: IntoIterator<Item = DeltaOp>>(iter: I) -> Self {
        let mut delta = Delta::new();
        for op in iter {
            delta.push(op);
        }
        delta
    }
}

/// Coarse op kind, used by the engine to steer pairwise iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Retain,
    Insert,
    Delete,
}

/// Cursor over a delta's ops that can split an op mid-way.
///
/// When exhausted it yields implicit plain retains, so pairwise walks over
/// two deltas of different base lengths stay total.
pub(crate) struct OpIter<'a> {
    ops: &'a [DeltaOp],
    index: usize,
    offset: u64,
}

impl<'a> OpIter<'a> {
    pub fn new(ops: &'a [DeltaOp]) -> Self {
        OpIter { ops, index: 0, offset: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    pub fn peek_kind(&self) -> OpKind {
        match self.ops.get(self.index) {
            Some(DeltaOp::Insert { .. }) => OpKind::Insert,
            Some(DeltaOp::Delete { .. }) => OpKind::Delete,
            Some(DeltaOp::Retain { .. }) | None => OpKind::Retain,
        }
    }

    /// Remaining length of the current op, or `u64::MAX` when exhausted.
    pub fn peek_length(&self) -> u64 {
        match self.ops.get(self.index) {
            Some(op) => op.length() - self.offset,
            None => u64::MAX,
        }
    }

    /// Take up to `max` units from the current op, splitting if needed.
    pub fn next_op(&mut self, max: u64) -> DeltaOp {
        let Some(op) = self.ops.get(self.index) else {
            return DeltaOp::retain(max);
        };
        let remaining = op.length() - self.offset;
        let take = max.min(remaining);
        let offset = self.offset;
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        match op {
            DeltaOp::Retain { attributes, .. } => {
                DeltaOp::Retain { retain: take, attributes: attributes.clone() }
            }
            DeltaOp::Delete { .. } => DeltaOp::delete(take),
            DeltaOp::Insert { insert: InsertContent::Text(s), attributes } => {
                let piece: String = s
                    .chars()
                    .skip(offset as usize)
                    .take(take as usize)
                    .collect();
                DeltaOp::Insert { insert: InsertContent::Text(piece), attributes: attributes.clone() }
            }
            DeltaOp::Insert { insert: InsertContent::Embed(obj), attributes } => DeltaOp::Insert {
                insert: InsertContent::Embed(obj.clone()),
                attributes: attributes.clone(),
            },
        }
    }
}

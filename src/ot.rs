//! Operational transformation over rich-text deltas.
//!
//! Pure functions, no I/O. The three primitives and the catch-up fold:
//!
//! ```text
//!        a                      compose(a, transform(a, b, false))
//!     * ----> *                          ==
//!     |       |                 compose(b, transform(b, a, true))
//!   b |       | transform(a, b, ..)
//!     v       v
//!     * ----> *
//! ```
//!
//! The diamond property above is what lets two sites apply concurrent
//! edits in either order and converge. `transform_multiple` threads one
//! client op through an ordered list of already-committed ops; each
//! committed op is the earlier one and wins positional ties, so a client
//! insertion lands after any concurrent insertion already committed at
//! the same position.
//!
//! All functions are total over structurally valid deltas; malformed wire
//! input is rejected at decode time, before it reaches the engine.

use serde_json::Value;

use crate::delta::{Attributes, Delta, DeltaOp, OpIter, OpKind, non_empty};

// ─── Attribute algebra ────────────────────────────────────────────────

/// Compose attribute maps: `b` overrides `a`. With `keep_null` the null
/// markers survive (needed over a retain, where null means "remove"); over
/// an insert they are resolved away.
pub fn compose_attributes(
    a: Option<&Attributes>,
    b: Option<&Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut out: Attributes = b.cloned().unwrap_or_default();
    if let Some(a) = a {
        for (key, value) in a {
            if !out.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    if !keep_null {
        out.retain(|_, v| !v.is_null());
    }
    non_empty(out)
}

/// Transform `b`'s attributes against concurrent `a`. Without priority,
/// `b` wins wholesale; with priority, `a`'s keys shadow `b`'s.
pub fn transform_attributes(
    a: Option<&Attributes>,
    b: Option<&Attributes>,
    a_priority: bool,
) -> Option<Attributes> {
    let Some(a) = a else { return b.cloned() };
    let Some(b) = b else { return None };
    if !a_priority {
        return Some(b.clone());
    }
    let out: Attributes = b
        .iter()
        .filter(|(k, _)| !a.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    non_empty(out)
}

/// Attributes that undo `attr` given the `base` formatting it replaced.
pub fn invert_attributes(
    attr: Option<&Attributes>,
    base: Option<&Attributes>,
) -> Option<Attributes> {
    let attr = attr.cloned().unwrap_or_default();
    let base = base.cloned().unwrap_or_default();
    let mut out: Attributes = base
        .iter()
        .filter(|(k, v)| attr.get(*k).is_some_and(|a| a != *v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in &attr {
        if base.get(key) != Some(value) && !base.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }
    non_empty(out)
}

// ─── Delta primitives ─────────────────────────────────────────────────

/// Apply `d` after `base`, producing one equivalent delta.
///
/// Associative, not commutative. When `base` is a full document
/// (insert-only), the result is the updated document.
pub fn compose(base: &Delta, d: &Delta) -> Delta {
    let mut base_iter = OpIter::new(base.ops());
    let mut d_iter = OpIter::new(d.ops());
    let mut out = Delta::new();

    while base_iter.has_next() || d_iter.has_next() {
        if d_iter.peek_kind() == OpKind::Insert {
            out.push(d_iter.next_op(u64::MAX));
        } else if base_iter.peek_kind() == OpKind::Delete {
            out.push(base_iter.next_op(u64::MAX));
        } else {
            let len = base_iter.peek_length().min(d_iter.peek_length());
            let base_op = base_iter.next_op(len);
            let d_op = d_iter.next_op(len);
            match d_op {
                DeltaOp::Retain { attributes: d_attrs, .. } => {
                    let keep_null = base_op.is_retain();
                    let attributes =
                        compose_attributes(base_op.attributes(), d_attrs.as_ref(), keep_null);
                    match base_op {
                        DeltaOp::Retain { .. } => {
                            out.push(DeltaOp::Retain { retain: len, attributes })
                        }
                        DeltaOp::Insert { insert, .. } => {
                            out.push(DeltaOp::Insert { insert, attributes })
                        }
                        DeltaOp::Delete { .. } => unreachable!("delete handled above"),
                    }
                }
                DeltaOp::Delete { .. } => {
                    // Deleting a fresh insert cancels both; deleting
                    // retained content passes the delete through.
                    if base_op.is_retain() {
                        out.push(d_op);
                    }
                }
                DeltaOp::Insert { .. } => unreachable!("insert handled above"),
            }
        }
    }
    out.chop()
}

/// Rebase `b` so it applies after concurrent `a` (same base state).
///
/// `a_priority` breaks positional ties between inserts: when true, `a`'s
/// insertion appears first and `b`'s shifts past it.
pub fn transform(a: &Delta, b: &Delta, a_priority: bool) -> Delta {
    let mut a_iter = OpIter::new(a.ops());
    let mut b_iter = OpIter::new(b.ops());
    let mut out = Delta::new();

    while a_iter.has_next() || b_iter.has_next() {
        if a_iter.peek_kind() == OpKind::Insert
            && (a_priority || b_iter.peek_kind() != OpKind::Insert)
        {
            out.push(DeltaOp::retain(a_iter.next_op(u64::MAX).length()));
        } else if b_iter.peek_kind() == OpKind::Insert {
            out.push(b_iter.next_op(u64::MAX));
        } else {
            let len = a_iter.peek_length().min(b_iter.peek_length());
            let a_op = a_iter.next_op(len);
            let b_op = b_iter.next_op(len);
            if a_op.is_delete() {
                // a already removed this span; nothing left for b to touch.
                continue;
            } else if b_op.is_delete() {
                out.push(b_op);
            } else {
                let attributes =
                    transform_attributes(a_op.attributes(), b_op.attributes(), a_priority);
                out.push(DeltaOp::Retain { retain: len, attributes });
            }
        }
    }
    out.chop()
}

/// The delta that undoes `d` against the `base` state it applied to:
/// `compose(compose(base, d), invert(d, base)) == base`.
pub fn invert(d: &Delta, base: &Delta) -> Delta {
    let mut out = Delta::new();
    let mut base_index = 0u64;
    for op in d.ops() {
        match op {
            DeltaOp::Insert { .. } => {
                out.push(DeltaOp::delete(op.length()));
            }
            DeltaOp::Retain { retain, attributes: None } => {
                out.push(DeltaOp::retain(*retain));
                base_index += retain;
            }
            DeltaOp::Retain { retain, attributes: Some(attrs) } => {
                let slice = base.slice(base_index, base_index + retain);
                for base_op in slice.ops() {
                    let inverted = invert_attributes(Some(attrs), base_op.attributes());
                    out.push(DeltaOp::Retain {
                        retain: base_op.length(),
                        attributes: inverted,
                    });
                }
                base_index += retain;
            }
            DeltaOp::Delete { delete } => {
                let slice = base.slice(base_index, base_index + delete);
                for base_op in slice.ops() {
                    out.push(base_op.clone());
                }
                base_index += delete;
            }
        }
    }
    out.chop()
}

/// Thread `incoming` through an ordered run of committed deltas that all
/// share its base version. Each committed delta is the earlier op and
/// wins positional ties; the result is safe to apply after the last of
/// them.
pub fn transform_multiple(incoming: &Delta, committed: &[Delta]) -> Delta {
    committed
        .iter()
        .fold(incoming.clone(), |acc, earlier| transform(earlier, &acc, true))
}

/// Content sanity check used by the write path: document content must be
/// insert-only (its cursor position equals its total length).
pub fn is_document(content: &Delta) -> bool {
    content.ops().iter().all(DeltaOp::is_insert)
}

//! Transform, compose and invert: the operation algebra.
//!
//! ```text
//!            d
//!        a /   \ b
//!         /     \
//!        da     db
//!     b'  \     /  a'
//!          \   /
//!           d'          apply(apply(d, a), b') == apply(apply(d, b), a')
//! ```
//!
//! All functions walk both component lists in lockstep, consuming the
//! shorter span at each step. Operations are treated as ending in an
//! implicit retain, so an operation never needs to spell out the tail of
//! the document it leaves untouched.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems

use serde::{Deserialize, Serialize};

use crate::attributes::Attributes;
use crate::document::Document;
use crate::error::OtError;
use crate::operation::{Component, ComponentIter, Operation};

/// Tie-break for two inserts at the same position.
///
/// `Left` places the first operation's insert before the second's; `Right`
/// places it after. Every replica must use the same side for the same pair
/// of operations or the replicas diverge. Also decides which side's formatting wins
/// when both format the same span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Left,
    Right,
}

impl Priority {
    pub fn flip(self) -> Self {
        match self {
            Priority::Left => Priority::Right,
            Priority::Right => Priority::Left,
        }
    }
}

/// Transform two concurrent operations on the same document.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after `a`.
pub fn transform(a: &Operation, b: &Operation, priority: Priority) -> (Operation, Operation) {
    let mut a_iter = ComponentIter::new(a);
    let mut b_iter = ComponentIter::new(b);
    let mut a_prime = Operation::new();
    let mut b_prime = Operation::new();
    let a_wins = priority == Priority::Left;

    while a_iter.has_next() || b_iter.has_next() {
        if a_iter.peek_is_insert() && (a_wins || !b_iter.peek_is_insert()) {
            let insert = a_iter.next(usize::MAX);
            b_prime.push(Component::retain(insert.len()));
            a_prime.push(insert);
        } else if b_iter.peek_is_insert() {
            let insert = b_iter.next(usize::MAX);
            a_prime.push(Component::retain(insert.len()));
            b_prime.push(insert);
        } else {
            let len = a_iter.peek_len().min(b_iter.peek_len());
            match (a_iter.next(len), b_iter.next(len)) {
                // Both removed the span: nothing left to do on either side.
                (Component::Delete { .. }, Component::Delete { .. }) => {}
                (Component::Delete { .. }, Component::Retain { .. }) => {
                    a_prime.push(Component::Delete { len });
                }
                (Component::Retain { .. }, Component::Delete { .. }) => {
                    b_prime.push(Component::Delete { len });
                }
                (
                    Component::Retain { attributes: x, .. },
                    Component::Retain { attributes: y, .. },
                ) => {
                    a_prime.push(Component::Retain {
                        len,
                        attributes: Attributes::transform(&y, &x, !a_wins),
                    });
                    b_prime.push(Component::Retain {
                        len,
                        attributes: Attributes::transform(&x, &y, a_wins),
                    });
                }
                // Inserts are consumed by the branches above.
                (Component::Insert { .. }, _) | (_, Component::Insert { .. }) => {}
            }
        }
    }

    a_prime.chop();
    b_prime.chop();
    (a_prime, b_prime)
}

/// Merge two sequential operations into one equivalent operation.
pub fn compose(first: &Operation, second: &Operation) -> Operation {
    let mut a_iter = ComponentIter::new(first);
    let mut b_iter = ComponentIter::new(second);
    let mut out = Operation::new();

    while a_iter.has_next() || b_iter.has_next() {
        if b_iter.peek_is_insert() {
            out.push(b_iter.next(usize::MAX));
        } else if a_iter.peek_is_delete() {
            out.push(a_iter.next(usize::MAX));
        } else {
            let len = a_iter.peek_len().min(b_iter.peek_len());
            match (a_iter.next(len), b_iter.next(len)) {
                (
                    Component::Retain { attributes: x, .. },
                    Component::Retain { attributes: y, .. },
                ) => out.push(Component::Retain {
                    len,
                    attributes: Attributes::compose(&x, &y, true),
                }),
                (
                    Component::Insert {
                        content,
                        attributes: x,
                    },
                    Component::Retain { attributes: y, .. },
                ) => out.push(Component::Insert {
                    content,
                    attributes: Attributes::compose(&x, &y, false),
                }),
                (Component::Retain { .. }, Component::Delete { .. }) => {
                    out.push(Component::Delete { len });
                }
                // Inserted by `first`, deleted by `second`: cancels out.
                (Component::Insert { .. }, Component::Delete { .. }) => {}
                (Component::Delete { .. }, _) | (_, Component::Insert { .. }) => {}
            }
        }
    }

    out.chop();
    out
}

/// Build the operation that undoes `op` when applied after it.
///
/// `base` is the document `op` was applied to.
pub fn invert(op: &Operation, base: &Document) -> Result<Operation, OtError> {
    if op.base_len() > base.len() {
        return Err(OtError::LengthMismatch {
            base_len: op.base_len(),
            doc_len: base.len(),
        });
    }

    let mut inverted = Operation::new();
    let mut base_index = 0;
    for component in op.components() {
        match component {
            Component::Insert { content, .. } => {
                inverted.push(Component::Delete { len: content.len() });
            }
            Component::Retain { len, attributes } if attributes.is_empty() => {
                inverted.push(Component::retain(*len));
                base_index += len;
            }
            Component::Retain { len, attributes } => {
                for original in base.slice(base_index, *len).into_components() {
                    let base_attributes = original.attributes().cloned().unwrap_or_default();
                    inverted.push(Component::Retain {
                        len: original.len(),
                        attributes: Attributes::invert(attributes, &base_attributes),
                    });
                }
                base_index += len;
            }
            Component::Delete { len } => {
                for original in base.slice(base_index, *len).into_components() {
                    inverted.push(original);
                }
                base_index += len;
            }
        }
    }

    inverted.chop();
    Ok(inverted)
}

impl Operation {
    /// See [`transform`].
    pub fn transform(&self, other: &Operation, priority: Priority) -> (Operation, Operation) {
        transform(self, other, priority)
    }

    /// See [`compose`].
    pub fn compose(&self, next: &Operation) -> Operation {
        compose(self, next)
    }

    /// See [`invert`].
    pub fn invert(&self, base: &Document) -> Result<Operation, OtError> {
        invert(self, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;

    fn doc(text: &str) -> Document {
        Document::from_text(text)
    }

    fn converge(base: &Document, a: &Operation, b: &Operation) -> (Document, Document) {
        let (a_prime, b_prime) = transform(a, b, Priority::Left);
        let via_a = base.apply(a).unwrap().apply(&b_prime).unwrap();
        let via_b = base.apply(b).unwrap().apply(&a_prime).unwrap();
        (via_a, via_b)
    }

    #[test]
    fn test_transform_concurrent_inserts_same_position() {
        let base = doc("");
        let a = Operation::new().insert("Hello");
        let b = Operation::new().insert("World");

        let (a_left, _) = transform(&a, &b, Priority::Left);
        assert_eq!(base.apply(&b).unwrap().apply(&a_left).unwrap().text(), "HelloWorld");

        let (a_right, _) = transform(&a, &b, Priority::Right);
        assert_eq!(base.apply(&b).unwrap().apply(&a_right).unwrap().text(), "WorldHello");
    }

    #[test]
    fn test_transform_insert_vs_delete() {
        let base = doc("abcdef");
        let a = Operation::new().retain(2).insert("XY");
        let b = Operation::new().retain(1).delete(3);
        let (via_a, via_b) = converge(&base, &a, &b);
        assert_eq!(via_a, via_b);
        assert_eq!(via_a.text(), "aXYef");
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let base = doc("0123456789");
        let a = Operation::new().retain(2).delete(5);
        let b = Operation::new().retain(4).delete(5);
        let (via_a, via_b) = converge(&base, &a, &b);
        assert_eq!(via_a, via_b);
        assert_eq!(via_a.text(), "019");
    }

    #[test]
    fn test_transform_identical_deletes_leave_empty_residual() {
        let a = Operation::new().delete(5);
        let b = Operation::new().delete(5);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Right);
        assert!(a_prime.components().is_empty());
        assert!(b_prime.components().is_empty());
    }

    #[test]
    fn test_transform_attribute_conflict() {
        let base = doc("abc");
        let a = Operation::new().retain_with(3, Attributes::new().with("color", "red"));
        let b = Operation::new().retain_with(3, Attributes::new().with("color", "blue"));
        let (via_a, via_b) = converge(&base, &a, &b);
        assert_eq!(via_a, via_b);
        let attrs = via_a.as_operation().components()[0].attributes().unwrap().clone();
        assert_eq!(attrs.get("color"), Some(&AttributeValue::Text("red".into())));
    }

    #[test]
    fn test_transform_with_noop() {
        let a = Operation::new().retain(2).insert("x");
        let (a_prime, b_prime) = transform(&a, &Operation::new(), Priority::Right);
        assert_eq!(a_prime, a);
        assert!(b_prime.is_noop());
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let first = Operation::new().retain(1).insert("abc");
        let second = Operation::new().retain(2).delete(2);
        let composed = compose(&first, &second);
        assert_eq!(composed, Operation::new().retain(1).insert("a"));

        let base = doc("zz");
        assert_eq!(
            base.apply(&first).unwrap().apply(&second).unwrap(),
            base.apply(&composed).unwrap()
        );
    }

    #[test]
    fn test_compose_formats_inserted_text() {
        let first = Operation::new().insert("hi");
        let second = Operation::new().retain_with(2, Attributes::new().with("bold", true));
        let composed = compose(&first, &second);
        assert_eq!(
            composed,
            Operation::new().insert_with("hi", Attributes::new().with("bold", true))
        );
    }

    #[test]
    fn test_compose_delete_then_insert() {
        let base = doc("hello");
        let first = Operation::new().delete(5);
        let second = Operation::new().insert("bye");
        let composed = compose(&first, &second);
        assert_eq!(base.apply(&composed).unwrap().text(), "bye");
    }

    #[test]
    fn test_invert_restores_base() {
        let bold = Attributes::new().with("bold", true);
        let base = Document::from_operation(
            Operation::new().insert("plain ").insert_with("bold", bold),
        )
        .unwrap();
        let op = Operation::new()
            .retain(2)
            .delete(3)
            .insert("XY")
            .retain_with(5, Attributes::new().with("bold", AttributeValue::Null).with("italic", true));

        let applied = base.apply(&op).unwrap();
        let inverse = invert(&op, &base).unwrap();
        assert_eq!(applied.apply(&inverse).unwrap(), base);
    }

    #[test]
    fn test_invert_rejects_overlong_operation() {
        let op = Operation::new().delete(10);
        assert!(matches!(
            invert(&op, &doc("abc")),
            Err(OtError::LengthMismatch { base_len: 10, doc_len: 3 })
        ));
    }

    #[test]
    fn test_priority_flip() {
        assert_eq!(Priority::Left.flip(), Priority::Right);
        assert_eq!(Priority::Right.flip(), Priority::Left);
    }
}

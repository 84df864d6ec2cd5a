//! Operation representation: an ordered list of retain / insert / delete
//! components describing one text mutation.
//!
//! ```text
//!  pre-image   H e l l o _ W o r l d
//!              └ retain 6 ┘└ del 5 ┘
//!  operation   Retain(6) Insert("Rust") Delete(5)
//!  post-image  H e l l o _ R u s t
//! ```
//!
//! Lengths count Unicode scalar values; an embed counts as one position.
//! Operations built through the builder methods are kept canonical:
//! no zero-length components, adjacent compatible components merged,
//! and an insert next to a delete always placed before it.

use serde::{Deserialize, Serialize};

use crate::attributes::Attributes;
use crate::error::OtError;

/// A non-text object occupying one position (image, mention, formula…).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub kind: String,
    pub value: String,
}

impl Embed {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Inserted content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Text(String),
    Embed(Embed),
}

impl Content {
    /// Length in document positions.
    pub fn len(&self) -> usize {
        match self {
            Content::Text(s) => s.chars().count(),
            Content::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-range `[start, start + len)` of this content.
    pub(crate) fn slice(&self, start: usize, len: usize) -> Content {
        match self {
            Content::Text(s) => Content::Text(s.chars().skip(start).take(len).collect()),
            Content::Embed(e) => Content::Embed(e.clone()),
        }
    }
}

/// One primitive of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Component {
    /// Skip `len` positions, applying `attributes` to them
    Retain { len: usize, attributes: Attributes },
    /// Insert `content` at the cursor
    Insert { content: Content, attributes: Attributes },
    /// Remove `len` positions
    Delete { len: usize },
}

impl Component {
    pub fn retain(len: usize) -> Self {
        Component::Retain {
            len,
            attributes: Attributes::new(),
        }
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Component::Insert {
            content: Content::Text(text.into()),
            attributes: Attributes::new(),
        }
    }

    pub fn delete(len: usize) -> Self {
        Component::Delete { len }
    }

    /// Positions covered: retained, inserted or deleted.
    pub fn len(&self) -> usize {
        match self {
            Component::Retain { len, .. } | Component::Delete { len } => *len,
            Component::Insert { content, .. } => content.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Component::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Component::Delete { .. })
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, Component::Retain { .. })
    }

    /// Formatting carried by the component (empty for deletes).
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Component::Retain { attributes, .. } | Component::Insert { attributes, .. } => {
                Some(attributes)
            }
            Component::Delete { .. } => None,
        }
    }
}

/// An ordered sequence of components describing one mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    components: Vec<Component>,
}

impl Operation {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Wrap components exactly as given, without normalising them.
    ///
    /// Used at decode boundaries; call [`Operation::validate`] before trusting
    /// the result.
    pub fn from_components(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn retain(self, len: usize) -> Self {
        self.retain_with(len, Attributes::new())
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.push(Component::Retain { len, attributes });
        self
    }

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, Attributes::new())
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(Component::Insert {
            content: Content::Text(text.into()),
            attributes: strip_nulls(attributes),
        });
        self
    }

    pub fn insert_embed(mut self, embed: Embed, attributes: Attributes) -> Self {
        self.push(Component::Insert {
            content: Content::Embed(embed),
            attributes: strip_nulls(attributes),
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Component::Delete { len });
        self
    }

    /// Append a component, keeping the operation canonical.
    pub fn push(&mut self, component: Component) {
        if component.is_empty() {
            return;
        }

        if let (Some(Component::Delete { len }), Component::Delete { len: more }) =
            (self.components.last_mut(), &component)
        {
            if let Some(total) = len.checked_add(*more) {
                *len = total;
                return;
            }
        }

        // Inserts always precede a trailing delete.
        let mut index = self.components.len();
        if component.is_insert() && matches!(self.components.last(), Some(Component::Delete { .. })) {
            index -= 1;
        }

        if index > 0 {
            if let Some(merged) = merge(&self.components[index - 1], &component) {
                self.components[index - 1] = merged;
                return;
            }
        }

        self.components.insert(index, component);
    }

    /// Drop a trailing attribute-less retain (it is implicit).
    pub fn chop(&mut self) {
        if let Some(Component::Retain { attributes, .. }) = self.components.last() {
            if attributes.is_empty() {
                self.components.pop();
            }
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    /// Positions consumed from the pre-image (retains + deletes).
    ///
    /// Saturates at `usize::MAX`; [`Operation::validate`] rejects such operations.
    pub fn base_len(&self) -> usize {
        self.components
            .iter()
            .filter(|c| !c.is_insert())
            .map(Component::len)
            .fold(0, usize::saturating_add)
    }

    /// Explicit positions produced in the post-image (retains + inserts).
    pub fn target_len(&self) -> usize {
        self.components
            .iter()
            .filter(|c| !c.is_delete())
            .map(Component::len)
            .fold(0, usize::saturating_add)
    }

    /// Net change in document length.
    pub fn len_delta(&self) -> isize {
        let (target, base) = (self.target_len(), self.base_len());
        if target >= base {
            isize::try_from(target - base).unwrap_or(isize::MAX)
        } else {
            isize::try_from(base - target).map_or(isize::MIN, |d| -d)
        }
    }

    /// True when applying the operation changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(|c| match c {
            Component::Retain { attributes, .. } => attributes.is_empty(),
            _ => false,
        })
    }

    pub fn is_insert_only(&self) -> bool {
        self.components.iter().all(Component::is_insert)
    }

    /// Reject operations that could not have come from the builder:
    /// zero-length components anywhere, or lengths whose totals do not fit
    /// in a `usize`.
    pub fn validate(&self) -> Result<(), OtError> {
        let mut base: usize = 0;
        let mut target: usize = 0;
        for (index, component) in self.components.iter().enumerate() {
            let len = component.len();
            if len == 0 {
                return Err(OtError::EmptyComponent { index });
            }
            let sums = match component {
                Component::Retain { .. } => base.checked_add(len).zip(target.checked_add(len)),
                Component::Insert { .. } => Some(base).zip(target.checked_add(len)),
                Component::Delete { .. } => base.checked_add(len).zip(Some(target)),
            };
            let Some((b, t)) = sums else {
                return Err(OtError::LengthOverflow { index });
            };
            base = b;
            target = t;
        }
        Ok(())
    }
}

fn merge(prev: &Component, next: &Component) -> Option<Component> {
    match (prev, next) {
        (
            Component::Retain { len: a, attributes: x },
            Component::Retain { len: b, attributes: y },
        ) if x == y => Some(Component::Retain {
            len: a.checked_add(*b)?,
            attributes: x.clone(),
        }),
        (
            Component::Insert {
                content: Content::Text(a),
                attributes: x,
            },
            Component::Insert {
                content: Content::Text(b),
                attributes: y,
            },
        ) if x == y => Some(Component::Insert {
            content: Content::Text(format!("{a}{b}")),
            attributes: x.clone(),
        }),
        _ => None,
    }
}

fn strip_nulls(attributes: Attributes) -> Attributes {
    attributes
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Cursor over an operation's components that can split them.
///
/// Past the end it yields an endless attribute-less retain, which is how the
/// implicit trailing retain participates in transform and compose.
pub(crate) struct ComponentIter<'a> {
    components: &'a [Component],
    index: usize,
    offset: usize,
}

impl<'a> ComponentIter<'a> {
    pub(crate) fn new(op: &'a Operation) -> Self {
        Self {
            components: &op.components,
            index: 0,
            offset: 0,
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.index < self.components.len()
    }

    pub(crate) fn peek_len(&self) -> usize {
        match self.components.get(self.index) {
            Some(c) => c.len() - self.offset,
            None => usize::MAX,
        }
    }

    pub(crate) fn peek_is_insert(&self) -> bool {
        self.components
            .get(self.index)
            .is_some_and(Component::is_insert)
    }

    pub(crate) fn peek_is_delete(&self) -> bool {
        self.components
            .get(self.index)
            .is_some_and(Component::is_delete)
    }

    /// Take up to `max` positions from the current component.
    pub(crate) fn next(&mut self, max: usize) -> Component {
        let Some(component) = self.components.get(self.index) else {
            return Component::retain(max);
        };

        let remaining = component.len() - self.offset;
        let take = max.min(remaining);
        let piece = match component {
            Component::Delete { .. } => Component::Delete { len: take },
            Component::Retain { attributes, .. } => Component::Retain {
                len: take,
                attributes: attributes.clone(),
            },
            Component::Insert { content, attributes } => Component::Insert {
                content: content.slice(self.offset, take),
                attributes: attributes.clone(),
            },
        };

        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        piece
    }
}

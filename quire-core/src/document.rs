//! Document content: a canonical, insert-only operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OtError;
use crate::operation::{Component, ComponentIter, Content, Operation};

/// Placeholder character used when rendering embeds as plain text.
pub const EMBED_CHAR: char = '\u{FFFC}';

/// Full content of a document at some revision.
///
/// Internally this is an operation made only of inserts, so applying an
/// edit is a compose and formatting travels with the text it covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    content: Operation,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            content: Operation::new().insert(text),
        }
    }

    /// Wrap an insert-only operation.
    pub fn from_operation(content: Operation) -> Result<Self, OtError> {
        if let Some(index) = content.components().iter().position(|c| !c.is_insert()) {
            return Err(OtError::NotADocument { index });
        }
        content.validate()?;
        Ok(Self { content })
    }

    /// Length in positions.
    pub fn len(&self) -> usize {
        self.content.target_len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.components().is_empty()
    }

    /// Apply `op`, producing the next document.
    ///
    /// Fails when the operation reaches past the end of the document or
    /// carries a zero-length component. `self` is left untouched either way.
    pub fn apply(&self, op: &Operation) -> Result<Document, OtError> {
        op.validate()?;
        let doc_len = self.len();
        if op.base_len() > doc_len {
            return Err(OtError::LengthMismatch {
                base_len: op.base_len(),
                doc_len,
            });
        }
        Ok(Self {
            content: self.content.compose(op),
        })
    }

    /// Plain text, with each embed rendered as U+FFFC.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.len());
        for component in self.content.components() {
            if let Component::Insert { content, .. } = component {
                match content {
                    Content::Text(s) => out.push_str(s),
                    Content::Embed(_) => out.push(EMBED_CHAR),
                }
            }
        }
        out
    }

    pub fn as_operation(&self) -> &Operation {
        &self.content
    }

    pub fn into_operation(self) -> Operation {
        self.content
    }

    /// Inserts covering positions `[start, start + len)`, formatting included.
    pub fn slice(&self, start: usize, len: usize) -> Operation {
        let mut iter = ComponentIter::new(&self.content);
        let mut out = Operation::new();

        let mut skipped = 0;
        while skipped < start && iter.has_next() {
            skipped += iter.next(start - skipped).len();
        }

        let mut taken = 0;
        while taken < len && iter.has_next() {
            let piece = iter.next(len - taken);
            taken += piece.len();
            out.push(piece);
        }
        out
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

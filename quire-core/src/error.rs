//! Errors raised by the operation algebra.

use thiserror::Error;

/// A malformed operation: always a client bug or corruption, never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// The operation retains or deletes past the end of the document.
    #[error("operation spans {base_len} positions but the document has {doc_len}")]
    LengthMismatch { base_len: usize, doc_len: usize },

    /// A retain, insert or delete of length zero.
    #[error("zero-length component at index {index}")]
    EmptyComponent { index: usize },

    /// Component lengths add up past `usize::MAX`.
    #[error("component lengths overflow at index {index}")]
    LengthOverflow { index: usize },

    /// Document content must consist of inserts only.
    #[error("document content has a non-insert component at index {index}")]
    NotADocument { index: usize },
}

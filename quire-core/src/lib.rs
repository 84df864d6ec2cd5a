//! # quire-core — Operational-transformation algebra for rich text
//!
//! Pure, synchronous building blocks shared by the sync server and clients.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐   transform(a, b)   ┌──────────────┐
//!  │  Operation a │ ◄─────────────────► │  Operation b │
//!  └──────┬───────┘                     └──────┬───────┘
//!         │ compose                            │ invert
//!         ▼                                    ▼
//!  ┌──────────────┐       apply         ┌──────────────┐
//!  │  Operation   │ ──────────────────► │   Document   │
//!  │ (ret/ins/del)│                     │ (insert-only)│
//!  └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Components, the canonical builder and length accounting
//! - [`attributes`] — Formatting maps and their compose / transform / invert rules
//! - [`transform`] — The algebra: transform, compose, invert
//! - [`document`] — Document content and `apply`
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | transform, 100-component ops | <20µs |
//! | compose into 10K-char document | <200µs |
//! | apply 1K sequential edits | <50ms |

pub mod attributes;
pub mod document;
pub mod error;
pub mod operation;
pub mod transform;

pub use attributes::{AttributeValue, Attributes};
pub use document::{Document, EMBED_CHAR};
pub use error::OtError;
pub use operation::{Component, Content, Embed, Operation};
pub use transform::{compose, invert, transform, Priority};

//! Document model.
//!
//! A [`Document`](document::Document) is an ordered sequence of
//! [`Field`](field::Field)s. Every field carries an [`IndexingMode`]
//! chosen at indexing time; the mode decides which parts of a segment the
//! value lands in:
//!
//! | mode            | postings      | doc values | stored fields |
//! |-----------------|---------------|------------|---------------|
//! | `IndexedText`   | analyzed      | -          | if `stored`   |
//! | `IndexedExact`  | one term      | -          | if `stored`   |
//! | `Stored`        | -             | -          | always        |
//! | `DocValue(..)`  | -             | one value  | -             |
//!
//! # Examples
//!
//! ```
//! use xiphos::document::document::Document;
//! use xiphos::document::field::Store;
//!
//! let doc = Document::builder()
//!     .add_text("body", "The quick brown fox", Store::Yes)
//!     .add_exact("id", "doc-1", Store::Yes)
//!     .add_numeric_doc_value("price", 42)
//!     .build();
//!
//! assert_eq!(doc.len(), 3);
//! ```
//!
//! [`IndexingMode`]: field::IndexingMode

#[allow(clippy::module_inception)]
pub mod document;
pub mod field;

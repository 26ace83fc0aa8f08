//! Text analysis for indexed fields.
//!
//! Analyzers turn a field's text into the stream of terms that end up in the
//! postings. Only text indexed with [`IndexingMode::IndexedText`] is analyzed;
//! exact fields contribute their whole value as a single term.
//!
//! [`IndexingMode::IndexedText`]: crate::document::field::IndexingMode::IndexedText

pub mod analyzer;
pub mod token;

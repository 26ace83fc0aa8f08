//! # Xiphos
//!
//! A segment-based full-text index engine with column-oriented doc values.
//!
//! ## Features
//!
//! - Immutable segments with per-segment live-docs bitsets
//! - Atomic, generation-numbered commits
//! - Point-in-time readers with incremental refresh
//! - Tiered background merging and cancellable forced merges
//! - Pluggable codecs (compact binary and plain text)
//! - File and in-memory storage backends
//!
//! ## Example
//!
//! ```
//! use xiphos::document::document::Document;
//! use xiphos::document::field::Store;
//! use xiphos::index::{Directory, DirectoryReader, IndexWriter, IndexWriterConfig};
//! use xiphos::search::Searcher;
//!
//! let directory = Directory::in_memory();
//! let writer = IndexWriter::open(directory.clone(), IndexWriterConfig::default()).unwrap();
//! writer
//!     .add_document(
//!         Document::builder()
//!             .add_exact("id", "1", Store::Yes)
//!             .add_text("title", "The quick brown fox", Store::Yes)
//!             .add_numeric_doc_value("year", 1999)
//!             .build(),
//!     )
//!     .unwrap();
//! writer.commit().unwrap();
//!
//! let reader = DirectoryReader::open(&directory).unwrap();
//! let top = Searcher::new(&reader).search_term("title", "fox", 10).unwrap();
//! assert_eq!(top.total_hits, 1);
//! ```

pub mod analysis;
pub mod cli;
pub mod codec;
pub mod document;
pub mod error;
pub mod index;
pub mod search;
pub mod storage;
pub mod util;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

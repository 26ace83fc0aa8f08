//! The segment-based index engine.
//!
//! Documents flow through the engine in one direction:
//!
//! ```text
//! IndexWriter::add_document ─► in-memory SegmentWriter buffer
//!          │ flush (doc/RAM threshold, commit, NRT open)
//!          ▼
//!    sealed segment files (.si, postings, doc values, stored fields, .liv)
//!          │ commit: sync files, write pending_segments_N, rename
//!          ▼
//!    segments_N  ◄── DirectoryReader::open (immutable snapshot)
//! ```
//!
//! Merges run on a [`MergeScheduler`](merge_scheduler::MergeScheduler) and
//! replace a set of sealed segments with one new segment. Their results are
//! published through the same commit mechanism as flushed segments.
//!
//! Files are never overwritten. Everything a commit no longer references
//! stays on disk until [`IndexWriter::delete_unused_files`] reclaims it, and
//! only if no open reader or running merge pins it.
//!
//! [`IndexWriter::delete_unused_files`]: writer::IndexWriter::delete_unused_files

pub mod commit;
pub mod config;
pub mod directory;
pub mod file_deleter;
pub mod live_docs;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod merger;
pub mod reader;
pub mod schema;
pub mod segment;
pub mod segment_reader;
pub mod segment_writer;
pub mod term;
pub mod writer;

pub use config::{IndexWriterConfig, IndexWriterSettings, OpenMode};
pub use directory::Directory;
pub use reader::DirectoryReader;
pub use term::Term;
pub use writer::{DocStats, IndexWriter, MergeCancellation};

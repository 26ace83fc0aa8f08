//! Error types for the Xiphos library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`XiphosError`] enum. The variants follow the failure classes an index
//! engine has to distinguish:
//!
//! - storage faults ([`XiphosError::Io`], [`XiphosError::Storage`])
//! - a second writer on the same location ([`XiphosError::LockContention`])
//! - checksum or format mismatches ([`XiphosError::CorruptSegment`])
//! - use of a writer after a fatal flush/commit failure or `close()`
//!   ([`XiphosError::WriterClosed`])
//!
//! # Examples
//!
//! ```
//! use xiphos::error::{XiphosError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(XiphosError::invalid_argument("max_segments must be at least 1"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Xiphos operations.
#[derive(Error, Debug)]
pub enum XiphosError {
    /// I/O errors raised by a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors (missing files, closed storage, ...).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another writer holds the index location.
    #[error("Index is locked: {name}")]
    LockContention { name: String },

    /// A segment (or commit) file failed its checksum or format validation.
    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: String, reason: String },

    /// The writer was closed, either explicitly or after a fatal I/O failure.
    #[error("Writer is closed: {reason}")]
    WriterClosed { reason: String },

    /// The reader was closed.
    #[error("Reader is closed")]
    ReaderClosed,

    /// A field was used with an indexing mode that conflicts with its schema.
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Codec-related errors (unknown codec, malformed record, ...).
    #[error("Codec error: {0}")]
    Codec(String),

    /// A forced merge was cancelled between merge steps.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Index-related errors.
    #[error("Index error: {0}")]
    Index(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with XiphosError.
pub type Result<T> = std::result::Result<T, XiphosError>;

impl XiphosError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        XiphosError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        XiphosError::Storage(msg.into())
    }

    /// Create a new codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        XiphosError::Codec(msg.into())
    }

    /// Create a new corruption error for the given segment or file.
    pub fn corrupt<S: Into<String>, R: Into<String>>(segment: S, reason: R) -> Self {
        XiphosError::CorruptSegment {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Create a new lock contention error.
    pub fn locked<S: Into<String>>(name: S) -> Self {
        XiphosError::LockContention { name: name.into() }
    }

    /// Create a new closed-writer error.
    pub fn writer_closed<S: Into<String>>(reason: S) -> Self {
        XiphosError::WriterClosed {
            reason: reason.into(),
        }
    }

    /// Create a new schema conflict error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        XiphosError::SchemaConflict(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        XiphosError::MergeAborted(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        XiphosError::InvalidArgument(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        XiphosError::Other(msg.into())
    }

    /// Whether this error reports a checksum or format mismatch.
    pub fn is_corruption(&self) -> bool {
        matches!(self, XiphosError::CorruptSegment { .. })
    }

    /// Whether this error reports that another writer holds the index.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, XiphosError::LockContention { .. })
    }

    /// Attach a segment name to corruption errors raised while decoding a file.
    pub(crate) fn in_segment(self, segment: &str) -> Self {
        match self {
            XiphosError::CorruptSegment { reason, .. } => XiphosError::CorruptSegment {
                segment: segment.to_string(),
                reason,
            },
            other => other,
        }
    }
}

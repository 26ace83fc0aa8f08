//! Pluggable on-disk encodings for segment data.
//!
//! A [`Codec`] knows how to persist the three data structures of a sealed
//! segment: the postings, the doc-value columns and the stored fields. The
//! writer binds exactly one codec; each segment records the name of the codec
//! that wrote it, and readers resolve it again through a [`CodecRegistry`].
//! Segments written by different codecs can therefore live side by side in
//! one index.
//!
//! Two codecs ship with the crate:
//!
//! - [`BinaryCodec`](binary::BinaryCodec) (`"binary"`): compact varint and
//!   delta encoding, CRC32 framed.
//! - [`PlainTextCodec`](text::PlainTextCodec) (`"text"`): line-oriented and
//!   human readable, meant for debugging and tests.

use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{Result, XiphosError};
use crate::storage::Storage;

pub mod binary;
pub mod doc_values;
pub mod postings;
pub mod stored;
pub mod text;

pub use doc_values::{DocValues, DocValuesColumn};
pub use postings::{Posting, PostingList, SegmentPostings};
pub use stored::StoredFields;

/// Encode/decode operations for one on-disk format.
///
/// Every write operation creates exactly one file named after the segment and
/// returns its name. Every read operation verifies the file checksum and
/// reports damage as [`XiphosError::CorruptSegment`].
pub trait Codec: Send + Sync + Debug {
    /// Name recorded in segment infos.
    fn name(&self) -> &'static str;

    fn write_postings(
        &self,
        storage: &dyn Storage,
        segment: &str,
        postings: &SegmentPostings,
    ) -> Result<String>;

    fn read_postings(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentPostings>;

    fn write_doc_values(
        &self,
        storage: &dyn Storage,
        segment: &str,
        doc_values: &DocValues,
    ) -> Result<String>;

    fn read_doc_values(&self, storage: &dyn Storage, segment: &str) -> Result<DocValues>;

    fn write_stored_fields(
        &self,
        storage: &dyn Storage,
        segment: &str,
        stored: &StoredFields,
    ) -> Result<String>;

    fn read_stored_fields(&self, storage: &dyn Storage, segment: &str) -> Result<StoredFields>;
}

/// Resolves codecs by the name recorded in a segment.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: AHashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: AHashMap::new(),
        }
    }

    /// Add (or replace) a codec.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    /// Look a codec up by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| XiphosError::codec(format!("Unknown codec: {name}")))
    }

    /// Registered codec names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.codecs.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = CodecRegistry::empty();
        registry.register(Arc::new(binary::BinaryCodec));
        registry.register(Arc::new(text::PlainTextCodec));
        registry
    }
}

/// The codec used when none is configured.
pub fn default_codec() -> Arc<dyn Codec> {
    Arc::new(binary::BinaryCodec)
}

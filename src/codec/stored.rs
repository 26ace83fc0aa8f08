//! Row-oriented stored fields.

use crate::document::document::StoredDocument;
use crate::error::{Result, XiphosError};

/// Stored documents of a segment, indexed by ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredFields {
    docs: Vec<StoredDocument>,
}

impl StoredFields {
    pub fn new() -> Self {
        StoredFields::default()
    }

    pub fn from_docs(docs: Vec<StoredDocument>) -> Self {
        StoredFields { docs }
    }

    pub fn push(&mut self, doc: StoredDocument) {
        self.docs.push(doc);
    }

    /// Stored document at `doc`.
    pub fn get(&self, doc: u32) -> Result<&StoredDocument> {
        self.docs.get(doc as usize).ok_or_else(|| {
            XiphosError::invalid_argument(format!(
                "doc {doc} out of range (segment has {} docs)",
                self.docs.len()
            ))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StoredDocument> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

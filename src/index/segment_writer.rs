//! In-memory segment buffer.
//!
//! [`SegmentWriter`] accumulates documents in arrival order: an inverted
//! index, one dense column per doc-value field and the stored fields.
//! Adding a document never touches storage. [`SegmentWriter::flush`] seals
//! the buffer into an immutable segment through a [`Codec`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use tracing::debug;

use crate::analysis::analyzer::Analyzer;
use crate::codec::postings::TermPostingIndex;
use crate::codec::{Codec, DocValues, DocValuesColumn, StoredFields};
use crate::document::document::{Document, StoredDocument, StoredField};
use crate::document::field::{FieldValue, IndexingMode};
use crate::error::{Result, XiphosError};
use crate::index::directory::Directory;
use crate::index::live_docs::LiveDocs;
use crate::index::schema::FieldInfos;
use crate::index::segment::{SegmentInfo, live_docs_file_name, segment_name};

// Rough per-entry overheads for the RAM estimate.
const POSTING_OVERHEAD: usize = 24;
const DOC_VALUE_OVERHEAD: usize = 16;
const STORED_FIELD_OVERHEAD: usize = 48;

/// A segment produced by a flush.
#[derive(Debug)]
pub struct FlushedSegment {
    pub info: SegmentInfo,
    /// Deletions applied while the documents were buffered.
    pub live: Option<LiveDocs>,
    /// 1 when `live` was written, 0 otherwise.
    pub del_gen: u64,
}

/// Buffer for documents not yet written to a segment.
#[derive(Debug, Default)]
pub struct SegmentWriter {
    /// Inverted index over the buffered documents.
    postings: TermPostingIndex,

    /// Doc-value columns, all padded to `doc_count` after every document.
    doc_values: BTreeMap<String, DocValuesColumn>,

    /// Stored fields in ordinal order.
    stored: StoredFields,

    /// Schema of the fields seen in this buffer.
    fields: FieldInfos,

    /// Number of buffered documents, deleted ones included.
    doc_count: u32,

    /// Buffered ordinals removed by a delete.
    deleted: BTreeSet<u32>,

    /// Estimated heap usage.
    ram_bytes: usize,
}

impl SegmentWriter {
    pub fn new() -> Self {
        SegmentWriter::default()
    }

    /// Buffer `doc` and return its ordinal in this buffer.
    ///
    /// The document is validated and analyzed completely before anything is
    /// buffered, so a rejected document leaves the buffer and `schema`
    /// untouched.
    pub fn add_document(
        &mut self,
        doc: &Document,
        analyzer: &dyn Analyzer,
        schema: &mut FieldInfos,
    ) -> Result<u32> {
        if self.doc_count == u32::MAX {
            return Err(XiphosError::index("segment buffer is full"));
        }

        let mut modes: AHashMap<&str, IndexingMode> = AHashMap::new();
        for field in doc.fields() {
            field.validate()?;
            match modes.get(field.name.as_str()) {
                Some(mode) if *mode != field.mode => {
                    return Err(XiphosError::schema(format!(
                        "field '{}' appears with modes {} and {} in one document",
                        field.name,
                        mode.as_str(),
                        field.mode.as_str()
                    )));
                }
                Some(IndexingMode::DocValue(_)) => {
                    return Err(XiphosError::invalid_argument(format!(
                        "doc-value field '{}' has more than one value",
                        field.name
                    )));
                }
                _ => {}
            }
            schema.check(&field.name, field.mode)?;
            modes.insert(field.name.as_str(), field.mode);
        }

        // Analysis may fail; collect every term first.
        let mut terms: Vec<(&str, String, u32)> = Vec::new();
        let mut next_position: AHashMap<&str, u32> = AHashMap::new();
        for field in doc.fields() {
            let Some(text) = field.value.as_text() else {
                continue;
            };
            let base = next_position.get(field.name.as_str()).copied().unwrap_or(0);
            let mut last = None;
            match field.mode {
                IndexingMode::IndexedText => {
                    for token in analyzer.analyze(text)? {
                        let position = base + token.position;
                        terms.push((field.name.as_str(), token.text, position));
                        last = Some(position);
                    }
                }
                IndexingMode::IndexedExact => {
                    terms.push((field.name.as_str(), text.to_string(), base));
                    last = Some(base);
                }
                _ => continue,
            }
            if let Some(last) = last {
                next_position.insert(field.name.as_str(), last + 1);
            }
        }

        let ordinal = self.doc_count;
        for (name, mode) in &modes {
            schema.add(name, *mode)?;
            self.fields.add(name, *mode)?;
        }

        for (field, term, position) in &terms {
            self.postings.add_occurrence(field, term, ordinal, *position);
            self.ram_bytes += POSTING_OVERHEAD + term.len();
        }

        let mut stored = Vec::new();
        for field in doc.fields() {
            if let IndexingMode::DocValue(kind) = field.mode {
                let column = self
                    .doc_values
                    .entry(field.name.clone())
                    .or_insert_with(|| DocValuesColumn::empty(kind, ordinal as usize));
                column.pad_to(ordinal as usize);
                match (column, &field.value) {
                    (DocValuesColumn::Numeric(values), FieldValue::Long(value)) => {
                        values.push(Some(*value));
                        self.ram_bytes += DOC_VALUE_OVERHEAD;
                    }
                    (DocValuesColumn::Binary(values), FieldValue::Binary(bytes)) => {
                        values.push(Some(bytes.clone()));
                        self.ram_bytes += DOC_VALUE_OVERHEAD + bytes.len();
                    }
                    _ => {}
                }
            }
            if field.stored {
                self.ram_bytes += STORED_FIELD_OVERHEAD + field.name.len() + value_size(&field.value);
                stored.push(StoredField {
                    name: field.name.clone(),
                    value: field.value.clone(),
                });
            }
        }
        self.stored.push(StoredDocument::new(stored));

        self.doc_count += 1;
        for column in self.doc_values.values_mut() {
            column.pad_to(self.doc_count as usize);
        }
        Ok(ordinal)
    }

    /// Remove buffered documents containing `field:term`. Returns how many
    /// were newly removed.
    pub fn delete_term(&mut self, field: &str, term: &str) -> usize {
        self.postings
            .docs(field, term)
            .into_iter()
            .filter(|doc| self.deleted.insert(*doc))
            .count()
    }

    /// Buffered documents, deleted ones included.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Buffered documents not removed by a delete.
    pub fn num_docs(&self) -> u32 {
        self.doc_count - self.deleted.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    pub fn ram_bytes(&self) -> usize {
        self.ram_bytes
    }

    pub fn fields(&self) -> &FieldInfos {
        &self.fields
    }

    /// Seal the buffer as segment `id`.
    ///
    /// Returns `None` when there is nothing to write, either because the
    /// buffer is empty or because every buffered document was deleted. Files
    /// written before a failure are left behind unreferenced.
    pub fn flush(
        self,
        directory: &Directory,
        codec: &Arc<dyn Codec>,
        id: u64,
    ) -> Result<Option<FlushedSegment>> {
        if self.doc_count == 0 || self.num_docs() == 0 {
            return Ok(None);
        }

        let name = segment_name(id);
        let storage = directory.storage();
        let doc_count = self.doc_count;
        let term_count = self.postings.term_count();

        let mut doc_values = DocValues::new(doc_count);
        for (field, column) in self.doc_values {
            doc_values.insert(&field, column)?;
        }

        let files = vec![
            codec.write_postings(storage, &name, &self.postings.seal())?,
            codec.write_doc_values(storage, &name, &doc_values)?,
            codec.write_stored_fields(storage, &name, &self.stored)?,
        ];

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("source".to_string(), "flush".to_string());
        diagnostics.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        diagnostics.insert("version".to_string(), crate::VERSION.to_string());

        let mut info = SegmentInfo {
            id,
            name,
            codec: codec.name().to_string(),
            doc_count,
            fields: self.fields,
            files,
            diagnostics,
        };
        info.write(storage)?;

        let (live, del_gen) = if self.deleted.is_empty() {
            (None, 0)
        } else {
            let mut live = LiveDocs::all_live(doc_count);
            for doc in &self.deleted {
                live.delete(*doc);
            }
            live.write(storage, &live_docs_file_name(&info.name, 1))?;
            (Some(live), 1)
        };

        debug!(
            segment = %info.name,
            docs = doc_count,
            deleted = self.deleted.len(),
            terms = term_count,
            codec = %info.codec,
            "flushed segment"
        );
        Ok(Some(FlushedSegment { info, live, del_gen }))
    }
}

fn value_size(value: &FieldValue) -> usize {
    match value {
        FieldValue::Text(text) => text.len(),
        FieldValue::Long(_) => 8,
        FieldValue::Binary(bytes) => bytes.len(),
    }
}

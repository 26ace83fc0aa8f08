//! Leaf readers over sealed segments.
//!
//! A [`SegmentCore`] owns the decoded, immutable parts of one segment and is
//! shared by every reader (and the writer) that references the segment. The
//! parts are loaded on first access; a load failure is returned to the
//! caller and not cached, so a damaged segment fails only the operations
//! that touch it.
//!
//! A [`SegmentReader`] pairs a core with one live-docs generation. Two
//! readers of the same segment with different deletions share the core.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Codec, CodecRegistry, DocValues, Posting, SegmentPostings, StoredFields};
use crate::document::document::StoredDocument;
use crate::error::{Result, XiphosError};
use crate::index::directory::{Directory, FilePin};
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo, live_docs_file_name};

/// Lazily loaded per-segment data shared across readers.
#[derive(Debug)]
pub struct SegmentCore {
    info: Arc<SegmentInfo>,
    directory: Directory,
    codecs: CodecRegistry,
    postings: Mutex<Option<Arc<SegmentPostings>>>,
    doc_values: Mutex<Option<Arc<DocValues>>>,
    stored: Mutex<Option<Arc<StoredFields>>>,
    _pin: FilePin,
}

impl SegmentCore {
    /// Pin the segment's files and prepare lazy access.
    pub fn open(directory: &Directory, info: Arc<SegmentInfo>, codecs: &CodecRegistry) -> Arc<Self> {
        let pin = directory.pin(info.files.clone());
        Arc::new(SegmentCore {
            info,
            directory: directory.clone(),
            codecs: codecs.clone(),
            postings: Mutex::new(None),
            doc_values: Mutex::new(None),
            stored: Mutex::new(None),
            _pin: pin,
        })
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.doc_count
    }

    fn codec(&self) -> Result<Arc<dyn Codec>> {
        self.codecs.get(&self.info.codec)
    }

    pub fn postings(&self) -> Result<Arc<SegmentPostings>> {
        let mut slot = self.postings.lock();
        if let Some(postings) = slot.as_ref() {
            return Ok(Arc::clone(postings));
        }
        let postings = self
            .codec()?
            .read_postings(self.directory.storage(), self.name())?;
        for (field, terms) in postings.fields() {
            for (term, list) in terms {
                if list.docs().any(|doc| doc >= self.max_doc()) {
                    return Err(XiphosError::corrupt(
                        self.name(),
                        format!("posting for {field}:{term} exceeds document count"),
                    ));
                }
            }
        }
        let postings = Arc::new(postings);
        *slot = Some(Arc::clone(&postings));
        Ok(postings)
    }

    pub fn doc_values(&self) -> Result<Arc<DocValues>> {
        let mut slot = self.doc_values.lock();
        if let Some(values) = slot.as_ref() {
            return Ok(Arc::clone(values));
        }
        let values = self
            .codec()?
            .read_doc_values(self.directory.storage(), self.name())?;
        if values.doc_count() != self.max_doc() {
            return Err(XiphosError::corrupt(
                self.name(),
                format!(
                    "doc values cover {} documents, segment has {}",
                    values.doc_count(),
                    self.max_doc()
                ),
            ));
        }
        let values = Arc::new(values);
        *slot = Some(Arc::clone(&values));
        Ok(values)
    }

    pub fn stored_fields(&self) -> Result<Arc<StoredFields>> {
        let mut slot = self.stored.lock();
        if let Some(stored) = slot.as_ref() {
            return Ok(Arc::clone(stored));
        }
        let stored = self
            .codec()?
            .read_stored_fields(self.directory.storage(), self.name())?;
        if stored.len() != self.max_doc() as usize {
            return Err(XiphosError::corrupt(
                self.name(),
                format!(
                    "stored fields hold {} documents, segment has {}",
                    stored.len(),
                    self.max_doc()
                ),
            ));
        }
        let stored = Arc::new(stored);
        *slot = Some(Arc::clone(&stored));
        Ok(stored)
    }
}

#[derive(Debug)]
enum LiveSource {
    AllLive,
    Loaded(Arc<LiveDocs>),
    Persisted {
        file: String,
        cell: Mutex<Option<Arc<LiveDocs>>>,
    },
}

/// One segment as seen by one snapshot.
#[derive(Debug)]
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    live: LiveSource,
    del_gen: u64,
    del_count: u32,
    _live_pin: Option<FilePin>,
}

impl SegmentReader {
    /// Reader over a committed segment; live docs are read from disk on
    /// first use.
    pub fn from_commit(core: Arc<SegmentCore>, sci: &SegmentCommitInfo) -> Self {
        match sci.live_docs_file() {
            Some(file) => {
                let pin = core.directory.pin(vec![file.clone()]);
                SegmentReader {
                    core,
                    live: LiveSource::Persisted {
                        file,
                        cell: Mutex::new(None),
                    },
                    del_gen: sci.del_gen,
                    del_count: sci.del_count,
                    _live_pin: Some(pin),
                }
            }
            None => SegmentReader {
                core,
                live: LiveSource::AllLive,
                del_gen: 0,
                del_count: 0,
                _live_pin: None,
            },
        }
    }

    /// Reader over an in-memory live-docs view handed out by the writer.
    pub(crate) fn with_live_docs(
        core: Arc<SegmentCore>,
        del_gen: u64,
        live: Option<Arc<LiveDocs>>,
    ) -> Self {
        let pin = (del_gen > 0)
            .then(|| core.directory.pin(vec![live_docs_file_name(core.name(), del_gen)]));
        let (live, del_count) = match live {
            Some(live) => {
                let deleted = live.num_deleted();
                (LiveSource::Loaded(live), deleted)
            }
            None => (LiveSource::AllLive, 0),
        };
        SegmentReader {
            core,
            live,
            del_gen,
            del_count,
            _live_pin: pin,
        }
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        self.core.info()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn del_gen(&self) -> u64 {
        self.del_gen
    }

    pub fn max_doc(&self) -> u32 {
        self.core.max_doc()
    }

    pub fn num_docs(&self) -> u32 {
        self.max_doc().saturating_sub(self.del_count)
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.del_count
    }

    /// The live-docs bitset, or `None` when every document is live.
    pub fn live_docs(&self) -> Result<Option<Arc<LiveDocs>>> {
        match &self.live {
            LiveSource::AllLive => Ok(None),
            LiveSource::Loaded(live) => Ok(Some(Arc::clone(live))),
            LiveSource::Persisted { file, cell } => {
                let mut slot = cell.lock();
                if let Some(live) = slot.as_ref() {
                    return Ok(Some(Arc::clone(live)));
                }
                let live = LiveDocs::read(self.core.directory.storage(), file, self.max_doc())
                    .map_err(|e| e.in_segment(self.name()))?;
                if live.num_deleted() != self.del_count {
                    return Err(XiphosError::corrupt(
                        self.name(),
                        format!(
                            "{file} marks {} deletions, commit records {}",
                            live.num_deleted(),
                            self.del_count
                        ),
                    ));
                }
                let live = Arc::new(live);
                *slot = Some(Arc::clone(&live));
                Ok(Some(live))
            }
        }
    }

    /// The in-memory live docs this reader was built with, if any.
    pub(crate) fn shared_live_docs(&self) -> Option<&Arc<LiveDocs>> {
        match &self.live {
            LiveSource::Loaded(live) => Some(live),
            _ => None,
        }
    }

    pub fn is_live(&self, doc: u32) -> Result<bool> {
        if doc >= self.max_doc() {
            return Ok(false);
        }
        Ok(match self.live_docs()? {
            Some(live) => live.is_live(doc),
            None => true,
        })
    }

    /// Live postings of `field:term`, in ordinal order.
    pub fn postings(&self, field: &str, term: &str) -> Result<Vec<Posting>> {
        let postings = self.core.postings()?;
        let Some(list) = postings.get(field, term) else {
            return Ok(Vec::new());
        };
        let live = self.live_docs()?;
        Ok(list
            .iter()
            .filter(|posting| live.as_ref().is_none_or(|live| live.is_live(posting.doc)))
            .cloned()
            .collect())
    }

    pub fn doc_values(&self) -> Result<Arc<DocValues>> {
        self.core.doc_values()
    }

    /// Stored fields of segment ordinal `doc`.
    pub fn document(&self, doc: u32) -> Result<StoredDocument> {
        let stored = self.core.stored_fields()?;
        Ok(stored.get(doc)?.clone())
    }
}

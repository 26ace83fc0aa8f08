//! Point-in-time readers.
//!
//! A [`DirectoryReader`] is an immutable snapshot of an index: either one
//! commit generation, or the visible state of a live writer. It is composed
//! of one [`SegmentReader`] per segment. Leaves are shared through `Arc`
//! between successive readers, so refreshing only opens the segments that
//! changed.
//!
//! While open, a reader pins every file it depends on in the directory's
//! reference registry; [`IndexWriter::delete_unused_files`] leaves pinned
//! files alone.
//!
//! [`IndexWriter::delete_unused_files`]: crate::index::writer::IndexWriter::delete_unused_files

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use tracing::debug;

use crate::codec::CodecRegistry;
use crate::document::document::StoredDocument;
use crate::error::{Result, XiphosError};
use crate::index::commit::{CommitPoint, segments_file_name};
use crate::index::directory::{Directory, FilePin};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_reader::{SegmentCore, SegmentReader};
use crate::index::writer::IndexWriter;

/// Attempts to catch a commit that is not superseded while it is opened.
const MAX_OPEN_ATTEMPTS: usize = 10;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// One leaf of a [`DirectoryReader`].
#[derive(Debug, Clone)]
pub struct LeafReaderContext {
    /// Id of the directory reader this context belongs to.
    pub parent: u64,
    /// Position among the parent's leaves.
    pub ord: usize,
    /// First global doc id of this leaf.
    pub doc_base: u32,
    pub reader: Arc<SegmentReader>,
}

/// A snapshot of an index.
#[derive(Debug)]
pub struct DirectoryReader {
    id: u64,
    directory: Directory,
    codecs: CodecRegistry,
    generation: u64,
    /// Writer view version for near-real-time readers.
    version: Option<u64>,
    user_data: BTreeMap<String, String>,
    leaves: Vec<LeafReaderContext>,
    max_doc: u32,
    num_docs: u32,
    closed: bool,
    _commit_pin: Option<FilePin>,
}

impl DirectoryReader {
    /// Open the latest commit of `directory`.
    pub fn open(directory: &Directory) -> Result<Self> {
        Self::open_with_codecs(directory, &CodecRegistry::default())
    }

    /// Open the latest commit, resolving segment codecs through `codecs`.
    pub fn open_with_codecs(directory: &Directory, codecs: &CodecRegistry) -> Result<Self> {
        let (commit, pin) = Self::read_pinned_commit(directory)?;
        Self::from_commit(directory, codecs, commit, pin, &[])
    }

    /// Open a reader over everything `writer` has buffered, flushed or
    /// deleted so far, committed or not.
    pub fn open_from_writer(writer: &IndexWriter) -> Result<Self> {
        Self::from_writer(writer, &[])
    }

    /// A reader over the latest commit if it differs from this reader's
    /// generation; `None` otherwise.
    pub fn open_if_changed(&self) -> Result<Option<Self>> {
        self.ensure_open()?;
        let latest = CommitPoint::latest_generation(self.directory.storage())?;
        if self.version.is_none() && latest == Some(self.generation) {
            return Ok(None);
        }
        let (commit, pin) = Self::read_pinned_commit(&self.directory)?;
        let reader = Self::from_commit(&self.directory, &self.codecs, commit, pin, &self.leaves)?;
        debug!(
            from = self.generation,
            to = reader.generation,
            reused = reader.reused_leaves(self),
            segments = reader.leaves.len(),
            "refreshed reader"
        );
        Ok(Some(reader))
    }

    /// A reader over the writer's current view if it changed since this
    /// reader was opened; `None` otherwise.
    pub fn open_if_changed_from_writer(&self, writer: &IndexWriter) -> Result<Option<Self>> {
        self.ensure_open()?;
        let (version, buffered) = writer.view_version();
        if self.version == Some(version) && !buffered {
            return Ok(None);
        }
        let reader = Self::from_writer(writer, &self.leaves)?;
        if self.version == reader.version {
            return Ok(None);
        }
        debug!(
            version = ?reader.version,
            reused = reader.reused_leaves(self),
            segments = reader.leaves.len(),
            "refreshed near-real-time reader"
        );
        Ok(Some(reader))
    }

    /// Every readable commit of `directory`, oldest first.
    pub fn list_commits(directory: &Directory) -> Result<Vec<CommitPoint>> {
        CommitPoint::list_commits(directory.storage())
    }

    fn read_pinned_commit(directory: &Directory) -> Result<(CommitPoint, FilePin)> {
        let storage = directory.storage();
        let mut last_error = None;
        for _ in 0..MAX_OPEN_ATTEMPTS {
            let Some(generation) = CommitPoint::latest_generation(storage)? else {
                return Err(XiphosError::index("no commit found in directory"));
            };
            let _pin = directory.pin(vec![segments_file_name(generation)]);
            match CommitPoint::read(storage, generation) {
                Ok(commit) => {
                    let files: Vec<String> = commit.files().into_iter().collect();
                    let commit_pin = directory.pin(files);
                    // Pinned now; make sure nothing went away before that.
                    if commit_pin.files().iter().all(|name| storage.file_exists(name)) {
                        return Ok((commit, commit_pin));
                    }
                }
                Err(e) => {
                    if CommitPoint::latest_generation(storage)? == Some(generation) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
            debug!(generation, "commit superseded while opening, retrying");
        }
        Err(last_error.unwrap_or_else(|| {
            XiphosError::index("commit kept changing while the reader was opened")
        }))
    }

    fn from_commit(
        directory: &Directory,
        codecs: &CodecRegistry,
        commit: CommitPoint,
        pin: FilePin,
        previous: &[LeafReaderContext],
    ) -> Result<Self> {
        let by_name = index_leaves(previous);
        let readers = commit
            .segments
            .iter()
            .map(|sci| match by_name.get(sci.name()) {
                Some(leaf) if leaf.del_gen() == sci.del_gen && leaf.shared_live_docs().is_none() => {
                    Arc::clone(leaf)
                }
                Some(leaf) => Arc::new(SegmentReader::from_commit(Arc::clone(leaf.core()), sci)),
                None => {
                    let core = SegmentCore::open(directory, Arc::clone(&sci.info), codecs);
                    Arc::new(SegmentReader::from_commit(core, sci))
                }
            })
            .collect();

        Ok(Self::assemble(
            directory,
            codecs,
            commit.generation,
            None,
            commit.user_data,
            readers,
            Some(pin),
        ))
    }

    fn from_writer(writer: &IndexWriter, previous: &[LeafReaderContext]) -> Result<Self> {
        let snapshot = writer.snapshot()?;
        let by_name = index_leaves(previous);
        let readers = snapshot
            .segments
            .into_iter()
            .map(|(core, del_gen, live)| match by_name.get(core.name()) {
                Some(leaf) if same_live_docs(leaf, del_gen, live.as_ref()) => Arc::clone(leaf),
                Some(leaf) => Arc::new(SegmentReader::with_live_docs(
                    Arc::clone(leaf.core()),
                    del_gen,
                    live,
                )),
                None => Arc::new(SegmentReader::with_live_docs(core, del_gen, live)),
            })
            .collect();

        let directory = writer.directory();
        Ok(Self::assemble(
            directory,
            &writer.config().codecs,
            snapshot.generation,
            Some(snapshot.version),
            snapshot.user_data,
            readers,
            None,
        ))
    }

    fn assemble(
        directory: &Directory,
        codecs: &CodecRegistry,
        generation: u64,
        version: Option<u64>,
        user_data: BTreeMap<String, String>,
        readers: Vec<Arc<SegmentReader>>,
        pin: Option<FilePin>,
    ) -> Self {
        let id = NEXT_READER_ID.fetch_add(1, Ordering::Relaxed);
        let mut doc_base = 0u32;
        let mut num_docs = 0u32;
        let leaves = readers
            .into_iter()
            .enumerate()
            .map(|(ord, reader)| {
                let leaf = LeafReaderContext {
                    parent: id,
                    ord,
                    doc_base,
                    reader,
                };
                doc_base += leaf.reader.max_doc();
                num_docs += leaf.reader.num_docs();
                leaf
            })
            .collect();

        DirectoryReader {
            id,
            directory: directory.clone(),
            codecs: codecs.clone(),
            generation,
            version,
            user_data,
            leaves,
            max_doc: doc_base,
            num_docs,
            closed: false,
            _commit_pin: pin,
        }
    }

    fn reused_leaves(&self, previous: &DirectoryReader) -> usize {
        self.leaves
            .iter()
            .filter(|leaf| {
                previous
                    .leaves
                    .iter()
                    .any(|old| Arc::ptr_eq(&old.reader, &leaf.reader))
            })
            .count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(XiphosError::ReaderClosed);
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Commit generation this reader was opened on. For a near-real-time
    /// reader, the writer's last commit.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this reader was opened from a writer rather than a commit.
    pub fn is_near_real_time(&self) -> bool {
        self.version.is_some()
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    /// Live documents in this snapshot.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Ordinals in this snapshot, deleted ones included.
    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc - self.num_docs
    }

    /// The leaves, in index order. Empty once closed.
    pub fn leaves(&self) -> &[LeafReaderContext] {
        &self.leaves
    }

    /// The leaf holding global doc id `doc`.
    pub fn leaf_for(&self, doc: u32) -> Result<&LeafReaderContext> {
        self.ensure_open()?;
        if doc >= self.max_doc {
            return Err(XiphosError::invalid_argument(format!(
                "doc {doc} out of range (max_doc {})",
                self.max_doc
            )));
        }
        let idx = self
            .leaves
            .partition_point(|leaf| leaf.doc_base <= doc)
            .saturating_sub(1);
        self.leaves
            .get(idx)
            .ok_or_else(|| XiphosError::index(format!("no leaf for doc {doc}")))
    }

    /// Stored fields of global doc id `doc`.
    pub fn document(&self, doc: u32) -> Result<StoredDocument> {
        let leaf = self.leaf_for(doc)?;
        leaf.reader.document(doc - leaf.doc_base)
    }

    /// Whether global doc id `doc` is live in this snapshot.
    pub fn is_live(&self, doc: u32) -> Result<bool> {
        let leaf = self.leaf_for(doc)?;
        leaf.reader.is_live(doc - leaf.doc_base)
    }

    /// Release the leaves and their file pins.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.leaves.clear();
        self._commit_pin = None;
        debug!(reader = self.id, generation = self.generation, "closed reader");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn index_leaves(leaves: &[LeafReaderContext]) -> AHashMap<&str, &Arc<SegmentReader>> {
    leaves
        .iter()
        .map(|leaf| (leaf.reader.name(), &leaf.reader))
        .collect()
}

fn same_live_docs(leaf: &SegmentReader, del_gen: u64, live: Option<&Arc<LiveDocs>>) -> bool {
    match (leaf.shared_live_docs(), live) {
        (Some(old), Some(new)) => Arc::ptr_eq(old, new),
        (None, None) => leaf.num_deleted_docs() == 0 && leaf.del_gen() == del_gen,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::document::Document;
    use crate::document::field::Store;
    use crate::index::config::IndexWriterConfig;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::MergeSchedulerConfig;
    use crate::index::term::Term;

    fn writer(directory: &Directory) -> IndexWriter {
        let config = IndexWriterConfig::default()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial);
        IndexWriter::open(directory.clone(), config).unwrap()
    }

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_exact("id", id, Store::Yes)
            .build()
    }

    #[test]
    fn test_open_without_commit_fails() {
        let err = DirectoryReader::open(&Directory::in_memory()).unwrap_err();
        assert!(matches!(err, XiphosError::Index(_)));
    }

    #[test]
    fn test_refresh_reuses_unchanged_leaves() {
        let directory = Directory::in_memory();
        let writer = writer(&directory);
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();

        let first = DirectoryReader::open(&directory).unwrap();
        assert!(first.open_if_changed().unwrap().is_none());

        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();
        let second = first.open_if_changed().unwrap().unwrap();
        assert_eq!(second.leaves().len(), 2);
        assert!(Arc::ptr_eq(&first.leaves()[0].reader, &second.leaves()[0].reader));
        assert_eq!(second.leaves()[1].doc_base, 1);
        assert_eq!(second.leaves()[1].parent, second.id());
        assert_eq!(second.document(1).unwrap().get_text("id"), Some("b"));
    }

    #[test]
    fn test_new_deletions_get_a_new_leaf_over_the_same_core() {
        let directory = Directory::in_memory();
        let writer = writer(&directory);
        writer.add_document(doc("a")).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();
        let first = DirectoryReader::open(&directory).unwrap();

        writer.delete_documents(&Term::new("id", "a")).unwrap();
        writer.commit().unwrap();
        let second = first.open_if_changed().unwrap().unwrap();

        assert!(!Arc::ptr_eq(&first.leaves()[0].reader, &second.leaves()[0].reader));
        assert!(Arc::ptr_eq(
            first.leaves()[0].reader.core(),
            second.leaves()[0].reader.core()
        ));
        assert_eq!(first.num_deleted_docs(), 0);
        assert_eq!(second.num_deleted_docs(), 1);
        assert!(!second.is_live(0).unwrap());
    }

    #[test]
    fn test_near_real_time_reader() {
        let directory = Directory::in_memory();
        let writer = writer(&directory);
        writer.add_document(doc("a")).unwrap();

        let nrt = DirectoryReader::open_from_writer(&writer).unwrap();
        assert!(nrt.is_near_real_time());
        assert_eq!(nrt.num_docs(), 1);
        assert_eq!(nrt.generation(), 0);
        assert!(nrt.open_if_changed_from_writer(&writer).unwrap().is_none());

        writer.delete_documents(&Term::new("id", "a")).unwrap();
        let refreshed = nrt.open_if_changed_from_writer(&writer).unwrap().unwrap();
        assert_eq!(refreshed.num_docs(), 0);
        assert_eq!(refreshed.max_doc(), 1);
        assert_eq!(nrt.num_docs(), 1);
    }

    #[test]
    fn test_closed_reader() {
        let directory = Directory::in_memory();
        let writer = writer(&directory);
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();

        let mut reader = DirectoryReader::open(&directory).unwrap();
        assert!(directory.file_refs().is_pinned("segments_1"));
        reader.close();
        assert!(reader.leaves().is_empty());
        assert!(matches!(reader.document(0), Err(XiphosError::ReaderClosed)));
        assert!(matches!(reader.open_if_changed(), Err(XiphosError::ReaderClosed)));
    }
}

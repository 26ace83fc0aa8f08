//! The index writer.
//!
//! [`IndexWriter`] owns the write path of one index location: it buffers
//! documents, flushes them into segments, applies deletions, publishes
//! commits and drives merges. It holds the location's `write.lock` for its
//! whole lifetime, so at most one writer exists per index.
//!
//! All methods take `&self`; the writer can be shared between threads.
//! Internally the state is split so that adding documents only contends on
//! the buffer lock:
//!
//! - `buffer`: the active [`SegmentWriter`] and the index-wide schema
//! - `flush_lock`: serializes flushes and deletions
//! - `state`: the segment list, live docs and commit bookkeeping
//! - `commit_lock`: serializes commits, forced merges and file deletion
//!
//! When more than one is needed they are taken in that order, buffer before
//! state.
//!
//! A storage failure while flushing or committing is fatal: the writer
//! closes itself, releases the index lock and fails every later call with
//! [`XiphosError::WriterClosed`]. Nothing written by the failed operation is
//! referenced by any commit.
//!
//! # Example
//!
//! ```
//! use xiphos::document::document::Document;
//! use xiphos::document::field::Store;
//! use xiphos::index::{Directory, IndexWriter, IndexWriterConfig, Term};
//!
//! let directory = Directory::in_memory();
//! let writer = IndexWriter::open(directory, IndexWriterConfig::default()).unwrap();
//!
//! writer
//!     .add_document(Document::builder().add_exact("id", "1", Store::Yes).build())
//!     .unwrap();
//! assert_eq!(writer.commit().unwrap(), Some(1));
//! assert_eq!(writer.commit().unwrap(), None);
//!
//! writer.delete_documents(&Term::new("id", "1")).unwrap();
//! writer.commit().unwrap();
//! assert_eq!(writer.doc_stats().num_docs, 0);
//! writer.close().unwrap();
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::document::document::Document;
use crate::error::{Result, XiphosError};
use crate::index::commit::CommitPoint;
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::directory::Directory;
use crate::index::file_deleter::{FileDeleter, KeepSet, WRITE_LOCK_NAME};
use crate::index::live_docs::LiveDocs;
use crate::index::merge_policy::{MergeCandidate, SegmentSizeInfo};
use crate::index::merge_scheduler::MergeScheduler;
use crate::index::merger::{MergeInput, MergeOutput, SegmentMerger};
use crate::index::schema::FieldInfos;
use crate::index::segment::{
    SegmentCommitInfo, SegmentInfo, live_docs_file_name, parse_segment_file, segment_name,
};
use crate::index::segment_reader::SegmentCore;
use crate::index::segment_writer::SegmentWriter;
use crate::index::term::Term;
use crate::storage::StorageLock;

/// Document counts of the writer's current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocStats {
    /// Documents not deleted, buffered ones included.
    pub num_docs: u64,
    /// Ordinals allocated across all segments and the buffer.
    pub max_doc: u64,
}

/// Cancels a forced merge between merge steps.
#[derive(Debug, Clone, Default)]
pub struct MergeCancellation {
    cancelled: Arc<AtomicBool>,
}

impl MergeCancellation {
    pub fn new() -> Self {
        MergeCancellation::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct BufferState {
    writer: SegmentWriter,
    /// Union of the schema of every segment and the buffer.
    schema: FieldInfos,
}

#[derive(Debug)]
struct SegmentEntry {
    core: Arc<SegmentCore>,
    /// Generation of the newest live-docs file written for this segment.
    del_gen: u64,
    /// `None` with `del_gen > 0` means not loaded yet.
    live: Option<Arc<LiveDocs>>,
    del_count: u32,
    /// `live` holds deletions not yet written to a live-docs file.
    dirty: bool,
    next_del_gen: u64,
}

impl SegmentEntry {
    fn info(&self) -> &Arc<SegmentInfo> {
        self.core.info()
    }

    fn id(&self) -> u64 {
        self.info().id
    }

    fn num_docs(&self) -> u32 {
        self.info().doc_count - self.del_count
    }

    fn files(&self) -> Vec<String> {
        let mut files = self.info().files.clone();
        if self.del_gen > 0 {
            files.push(live_docs_file_name(&self.info().name, self.del_gen));
        }
        files
    }

    /// Load the live-docs file on first use.
    fn ensure_live(&mut self, directory: &Directory) -> Result<()> {
        if self.live.is_none() && self.del_gen > 0 {
            let name = live_docs_file_name(&self.info().name, self.del_gen);
            let live = LiveDocs::read(directory.storage(), &name, self.info().doc_count)
                .map_err(|e| e.in_segment(&self.info().name))?;
            self.live = Some(Arc::new(live));
        }
        Ok(())
    }

    /// Clear the bits of `docs`. Live docs must be loaded.
    fn delete_docs(&mut self, docs: &[u32]) -> u32 {
        let doc_count = self.info().doc_count;
        let live = Arc::make_mut(
            self.live
                .get_or_insert_with(|| Arc::new(LiveDocs::all_live(doc_count))),
        );
        let deleted = docs.iter().filter(|doc| live.delete(**doc)).count() as u32;
        if deleted > 0 {
            self.del_count = live.num_deleted();
            self.dirty = true;
        }
        deleted
    }
}

#[derive(Debug, Default)]
struct SegmentState {
    segments: Vec<SegmentEntry>,
    last_commit: Option<CommitPoint>,
    /// Generation of the last commit this writer published or opened.
    generation: u64,
    /// Bumped on every change to the segment list or live docs.
    version: u64,
    committed_version: u64,
    /// Ids of segments that are inputs of a running merge.
    merging: HashSet<u64>,
    user_data: BTreeMap<String, String>,
    user_data_dirty: bool,
    /// Files written since the last commit.
    unsynced: HashSet<String>,
    /// Segments being written by a flush or merge.
    in_flight: HashSet<String>,
}

impl SegmentState {
    fn has_changes(&self) -> bool {
        self.version != self.committed_version || self.user_data_dirty
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.segments.iter().position(|entry| entry.id() == id)
    }
}

/// A merge registered with the writer.
#[derive(Debug)]
struct PendingMerge {
    ids: Vec<u64>,
    inputs: Vec<MergeInput>,
}

struct WriterInner {
    directory: Directory,
    config: IndexWriterConfig,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    buffer: Mutex<BufferState>,
    flush_lock: Mutex<()>,
    state: Mutex<SegmentState>,
    commit_lock: Mutex<()>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    abort_merges: AtomicBool,
    merge_errors: Mutex<Vec<XiphosError>>,
    scheduler: MergeScheduler,
    segment_counter: AtomicU64,
    index_id: Uuid,
}

impl std::fmt::Debug for WriterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterInner")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("segment_counter", &self.segment_counter.load(Ordering::Acquire))
            .field("index_id", &self.index_id)
            .finish()
    }
}

/// Writes to one index location.
#[derive(Debug)]
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

/// Everything a near-real-time reader needs from the writer.
#[derive(Debug)]
pub(crate) struct WriterSnapshot {
    pub generation: u64,
    pub version: u64,
    pub user_data: BTreeMap<String, String>,
    pub segments: Vec<(Arc<SegmentCore>, u64, Option<Arc<LiveDocs>>)>,
}

impl IndexWriter {
    /// Open a writer on `directory`, taking its write lock.
    ///
    /// Fails with [`XiphosError::LockContention`] if another writer holds
    /// the location.
    pub fn open(directory: Directory, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let storage = directory.storage();
        let mut lock = storage.obtain_lock(WRITE_LOCK_NAME)?;

        let opened = Self::load_state(&directory, &config);
        let (state, schema, counter, index_id) = match opened {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Err(release) = lock.release() {
                    warn!(error = %release, "failed to release write lock");
                }
                return Err(e);
            }
        };

        let scheduler = MergeScheduler::new(config.merge_scheduler.clone())?;
        info!(
            generation = state.generation,
            segments = state.segments.len(),
            codec = config.codec.name(),
            mode = ?config.open_mode,
            merge_policy = ?config.merge_policy.get_config(),
            "opened index writer"
        );

        Ok(IndexWriter {
            inner: Arc::new(WriterInner {
                directory,
                config,
                write_lock: Mutex::new(Some(lock)),
                buffer: Mutex::new(BufferState {
                    writer: SegmentWriter::new(),
                    schema,
                }),
                flush_lock: Mutex::new(()),
                state: Mutex::new(state),
                commit_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                abort_merges: AtomicBool::new(false),
                merge_errors: Mutex::new(Vec::new()),
                scheduler,
                segment_counter: AtomicU64::new(counter),
                index_id,
            }),
        })
    }

    fn load_state(
        directory: &Directory,
        config: &IndexWriterConfig,
    ) -> Result<(SegmentState, FieldInfos, u64, Uuid)> {
        let storage = directory.storage();
        let files = storage.list_files()?;

        // Never reuse a name, even one only left behind by a failed write.
        let mut next_segment = 0u64;
        let mut max_del_gen: HashMap<u64, u64> = HashMap::new();
        for name in &files {
            if let Some((id, del_gen)) = parse_segment_file(name) {
                next_segment = next_segment.max(id + 1);
                if let Some(del_gen) = del_gen {
                    let entry = max_del_gen.entry(id).or_insert(0);
                    *entry = (*entry).max(del_gen);
                }
            }
        }
        let latest_generation = CommitPoint::latest_generation(storage)?.unwrap_or(0);

        let existing = match config.open_mode {
            OpenMode::Create => None,
            OpenMode::Append => Some(CommitPoint::read_latest(storage)?.ok_or_else(|| {
                XiphosError::index("no commit found in directory (open mode is append)")
            })?),
            OpenMode::CreateOrAppend => CommitPoint::read_latest(storage)?,
        };

        let mut state = SegmentState {
            generation: latest_generation,
            ..Default::default()
        };
        let mut schema = FieldInfos::new();
        let index_id = match existing {
            Some(commit) => {
                next_segment = next_segment.max(commit.segment_counter);
                for sci in &commit.segments {
                    schema.merge(&sci.info.fields)?;
                    let core = SegmentCore::open(directory, Arc::clone(&sci.info), &config.codecs);
                    let next_del_gen = max_del_gen
                        .get(&sci.info.id)
                        .copied()
                        .unwrap_or(0)
                        .max(sci.del_gen)
                        + 1;
                    state.segments.push(SegmentEntry {
                        core,
                        del_gen: sci.del_gen,
                        live: None,
                        del_count: sci.del_count,
                        dirty: false,
                        next_del_gen,
                    });
                }
                state.user_data = commit.user_data.clone();
                let id = commit.index_id;
                state.last_commit = Some(commit);
                id
            }
            None => {
                // A new index is a change that the first commit publishes.
                state.version = 1;
                Uuid::new_v4()
            }
        };
        Ok((state, schema, next_segment, index_id))
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    /// Buffer `doc`. It becomes durable with the next commit.
    ///
    /// Fails with [`XiphosError::SchemaConflict`] if a field conflicts with
    /// the mode it was first indexed with; nothing is buffered then.
    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.inner.ensure_open()?;
        let needs_flush = {
            let mut buffer = self.inner.buffer.lock();
            let BufferState { writer, schema } = &mut *buffer;
            writer.add_document(&doc, self.inner.config.analyzer.as_ref(), schema)?;
            self.inner.over_threshold(writer)
        };
        if needs_flush && self.inner.flush(false)? {
            self.inner.maybe_merge();
        }
        Ok(())
    }

    /// Delete every document containing `term`, buffered documents
    /// included. Returns the number of documents newly deleted.
    pub fn delete_documents(&self, term: &Term) -> Result<u64> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        let _flush = inner.flush_lock.lock();
        let mut buffer = inner.buffer.lock();
        let mut state = inner.state.lock();

        // Resolve matches in every segment before touching anything.
        let mut matches = Vec::new();
        for (idx, entry) in state.segments.iter_mut().enumerate() {
            let postings = entry.core.postings()?;
            let Some(list) = postings.get(&term.field, &term.text) else {
                continue;
            };
            entry.ensure_live(&inner.directory)?;
            matches.push((idx, list.docs().collect::<Vec<_>>()));
        }

        let mut deleted = buffer.writer.delete_term(&term.field, &term.text) as u64;
        for (idx, docs) in matches {
            deleted += state.segments[idx].delete_docs(&docs) as u64;
        }
        if deleted > 0 {
            state.version += 1;
        }
        debug!(term = %term, deleted, "deleted documents");
        Ok(deleted)
    }

    /// Drop every segment and buffered document. Readers opened before keep
    /// their snapshot.
    pub fn delete_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        let _flush = inner.flush_lock.lock();
        let mut buffer = inner.buffer.lock();
        let mut state = inner.state.lock();

        buffer.writer = SegmentWriter::new();
        buffer.schema.clear();
        state.segments.clear();
        state.version += 1;
        info!("deleted all documents");
        Ok(())
    }

    /// Flush the buffer and publish a new commit.
    ///
    /// Returns the new generation, or `None` if nothing changed since the
    /// previous commit.
    pub fn commit(&self) -> Result<Option<u64>> {
        self.inner.ensure_open()?;
        let _commit = self.inner.commit_lock.lock();
        self.inner.flush(true)?;
        self.inner.publish_commit()
    }

    /// Key/value pairs stored with the next commit.
    pub fn set_commit_user_data(&self, user_data: BTreeMap<String, String>) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        if state.user_data != user_data {
            state.user_data = user_data;
            state.user_data_dirty = true;
        }
        Ok(())
    }

    pub fn commit_user_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().user_data.clone()
    }

    /// Merge until at most `max_segments` segments remain, committing after
    /// every merge step.
    pub fn force_merge(&self, max_segments: usize) -> Result<()> {
        self.force_merge_with_cancel(max_segments, &MergeCancellation::new())
    }

    /// Like [`force_merge`](Self::force_merge), but stops with
    /// [`XiphosError::MergeAborted`] before the next step once `cancel` is
    /// triggered. Steps already completed stay committed.
    pub fn force_merge_with_cancel(
        &self,
        max_segments: usize,
        cancel: &MergeCancellation,
    ) -> Result<()> {
        if max_segments == 0 {
            return Err(XiphosError::invalid_argument("max_segments must be at least 1"));
        }
        self.inner.ensure_open()?;
        let inner = &self.inner;
        let _commit = inner.commit_lock.lock();

        inner.flush(true)?;
        inner.scheduler.wait_idle();
        inner.publish_commit()?;

        let mut steps = 0;
        loop {
            if cancel.is_cancelled() {
                info!(steps, "forced merge cancelled");
                return Err(XiphosError::merge_aborted(format!(
                    "forced merge cancelled after {steps} step(s)"
                )));
            }
            inner.ensure_open()?;

            let candidate = {
                let state = inner.state.lock();
                let infos = inner.size_infos(&state);
                inner
                    .config
                    .merge_policy
                    .select_forced_merges(&infos, max_segments)
                    .into_iter()
                    .next()
            };
            let Some(candidate) = candidate else {
                if inner.state.lock().merging.is_empty() {
                    break;
                }
                inner.scheduler.wait_idle();
                continue;
            };

            let Some(merge) = inner.register_merge(&candidate)? else {
                inner.scheduler.wait_idle();
                continue;
            };
            inner.run_merge(merge)?;
            inner.publish_commit()?;
            steps += 1;
        }
        info!(steps, max_segments, "forced merge finished");
        Ok(())
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge();
        Ok(())
    }

    /// Block until no background merge is running.
    pub fn wait_for_merges(&self) {
        self.inner.scheduler.wait_idle();
    }

    /// Errors of background merges since the last call.
    pub fn take_merge_errors(&self) -> Vec<XiphosError> {
        std::mem::take(&mut *self.inner.merge_errors.lock())
    }

    /// Remove files that no commit, open reader or running operation needs.
    /// Returns the deleted names.
    pub fn delete_unused_files(&self) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        let _commit = self.inner.commit_lock.lock();
        let deleted = self.inner.delete_unused(false)?;
        info!(deleted = deleted.len(), "deleted unused files");
        Ok(deleted)
    }

    pub fn doc_stats(&self) -> DocStats {
        let buffer = self.inner.buffer.lock();
        let state = self.inner.state.lock();
        let (num_docs, max_doc) = state.segments.iter().fold((0u64, 0u64), |(n, m), entry| {
            (n + entry.num_docs() as u64, m + entry.info().doc_count as u64)
        });
        DocStats {
            num_docs: num_docs + buffer.writer.num_docs() as u64,
            max_doc: max_doc + buffer.writer.doc_count() as u64,
        }
    }

    /// Segments in the writer's current view, flushed but uncommitted ones
    /// included.
    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().segments.len()
    }

    /// Generation of the last commit.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let buffered = !self.inner.buffer.lock().writer.is_empty();
        buffered || self.inner.state.lock().has_changes()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Discard everything since the last commit and close the writer.
    pub fn rollback(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.inner.close_reason.lock() = Some("rolled back".to_string());
        self.inner.rollback_internal();
        info!("rolled back index writer");
        Ok(())
    }

    /// Commit pending changes (if configured to), wait for merges and
    /// release the index.
    pub fn close(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        if !inner.config.commit_on_close {
            return self.rollback();
        }

        self.commit()?;
        inner.scheduler.wait_idle();
        self.commit()?;

        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(inner.closed_error());
        }
        *inner.close_reason.lock() = Some("closed".to_string());
        inner.scheduler.shutdown();
        inner.release_lock();
        info!(generation = self.generation(), "closed index writer");
        Ok(())
    }

    /// Flush the buffer and capture the current segments for a
    /// near-real-time reader.
    pub(crate) fn snapshot(&self) -> Result<WriterSnapshot> {
        self.inner.ensure_open()?;
        if self.inner.flush(true)? {
            self.inner.maybe_merge();
        }
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        let mut segments = Vec::with_capacity(state.segments.len());
        for entry in &mut state.segments {
            entry.ensure_live(&self.inner.directory)?;
            let live = entry.live.as_ref().filter(|live| live.num_deleted() > 0).cloned();
            let del_gen = if entry.dirty { 0 } else { entry.del_gen };
            segments.push((Arc::clone(&entry.core), del_gen, live));
        }
        Ok(WriterSnapshot {
            generation: state.generation,
            version: state.version,
            user_data: state.user_data.clone(),
            segments,
        })
    }

    /// Version of the writer's view; changes with every flush, deletion and
    /// merge. The flag reports buffered documents not yet flushed.
    pub(crate) fn view_version(&self) -> (u64, bool) {
        let buffered = !self.inner.buffer.lock().writer.is_empty();
        (self.inner.state.lock().version, buffered)
    }
}

impl WriterInner {
    fn closed_error(&self) -> XiphosError {
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "closed".to_string());
        XiphosError::writer_closed(reason)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn over_threshold(&self, writer: &SegmentWriter) -> bool {
        writer.doc_count() as usize >= self.config.max_buffered_docs
            || writer.ram_bytes() >= self.config.ram_buffer_size_bytes
    }

    /// Close the writer after a failed flush or commit.
    fn tragic(&self, error: &XiphosError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(error = %error, "closing index writer after fatal error");
        *self.close_reason.lock() = Some(format!("fatal error: {error}"));
        self.abort_merges.store(true, Ordering::Release);
        self.release_lock();
    }

    fn release_lock(&self) {
        if let Some(mut lock) = self.write_lock.lock().take() {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to release write lock");
            }
        }
    }

    /// Seal the buffer into a new segment. Without `force` the buffer is only
    /// flushed if it is still over the threshold. Returns true if a segment
    /// was added.
    fn flush(&self, force: bool) -> Result<bool> {
        let _flush = self.flush_lock.lock();
        let (writer, id) = {
            let mut buffer = self.buffer.lock();
            if buffer.writer.is_empty() || (!force && !self.over_threshold(&buffer.writer)) {
                return Ok(false);
            }
            let id = self.segment_counter.fetch_add(1, Ordering::AcqRel);
            self.state.lock().in_flight.insert(segment_name(id));
            (std::mem::take(&mut buffer.writer), id)
        };
        let name = segment_name(id);

        let flushed = match writer.flush(&self.directory, &self.config.codec, id) {
            Ok(flushed) => flushed,
            Err(e) => {
                self.state.lock().in_flight.remove(&name);
                self.tragic(&e);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.in_flight.remove(&name);
        let Some(flushed) = flushed else {
            return Ok(false);
        };

        let entry = SegmentEntry {
            core: SegmentCore::open(&self.directory, Arc::new(flushed.info), &self.config.codecs),
            del_gen: flushed.del_gen,
            del_count: flushed.live.as_ref().map_or(0, |live| live.num_deleted()),
            live: flushed.live.map(Arc::new),
            dirty: false,
            next_del_gen: flushed.del_gen + 1,
        };
        let files = entry.files();
        state.unsynced.extend(files);
        state.segments.push(entry);
        state.version += 1;
        Ok(true)
    }

    /// Write pending live docs and publish a commit of the current state.
    /// Callers hold `commit_lock`.
    fn publish_commit(&self) -> Result<Option<u64>> {
        let (commit, to_sync, version) = {
            let mut state = self.state.lock();
            if !state.has_changes() {
                return Ok(None);
            }
            let state = &mut *state;
            let storage = self.directory.storage();

            for entry in state.segments.iter_mut().filter(|entry| entry.dirty) {
                let Some(live) = entry.live.as_ref() else {
                    continue;
                };
                let del_gen = entry.next_del_gen;
                let name = live_docs_file_name(&entry.info().name, del_gen);
                if let Err(e) = live.write(storage, &name) {
                    self.tragic(&e);
                    return Err(e);
                }
                entry.del_gen = del_gen;
                entry.next_del_gen += 1;
                entry.dirty = false;
                state.unsynced.insert(name);
            }

            let commit = CommitPoint {
                generation: state.generation + 1,
                index_id: self.index_id,
                segment_counter: self.segment_counter.load(Ordering::Acquire),
                segments: state
                    .segments
                    .iter()
                    .map(|entry| SegmentCommitInfo {
                        info: Arc::clone(entry.info()),
                        del_gen: entry.del_gen,
                        del_count: entry.del_count,
                    })
                    .collect(),
                user_data: state.user_data.clone(),
            };
            let referenced = commit.files();
            let to_sync: Vec<String> = state
                .unsynced
                .iter()
                .filter(|name| referenced.contains(*name))
                .cloned()
                .collect();
            state.user_data_dirty = false;
            (commit, to_sync, state.version)
        };

        if let Err(e) = commit.write(self.directory.storage(), &to_sync) {
            self.tragic(&e);
            return Err(e);
        }

        let mut state = self.state.lock();
        for name in &to_sync {
            state.unsynced.remove(name);
        }
        let current: HashSet<String> = state.segments.iter().flat_map(|e| e.files()).collect();
        state.unsynced.retain(|name| current.contains(name));
        state.generation = commit.generation;
        state.committed_version = version;
        info!(
            generation = commit.generation,
            segments = commit.segments.len(),
            docs = commit.num_docs(),
            "committed"
        );
        let generation = commit.generation;
        state.last_commit = Some(commit);
        Ok(Some(generation))
    }

    fn size_infos(&self, state: &SegmentState) -> Vec<SegmentSizeInfo> {
        state
            .segments
            .iter()
            .map(|entry| SegmentSizeInfo {
                id: entry.id(),
                name: entry.info().name.clone(),
                doc_count: entry.info().doc_count,
                del_count: entry.del_count,
                size_bytes: self.directory.size_of(&entry.files()),
                is_merging: state.merging.contains(&entry.id()),
            })
            .collect()
    }

    /// Mark the inputs of `candidate` as merging and capture their live
    /// docs. Returns `None` if an input is gone or already merging.
    fn register_merge(&self, candidate: &MergeCandidate) -> Result<Option<PendingMerge>> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut positions = Vec::with_capacity(candidate.segments.len());
        for id in &candidate.segments {
            match state.position(*id) {
                Some(pos) if !state.merging.contains(id) => positions.push(pos),
                _ => return Ok(None),
            }
        }
        // Inputs are concatenated in index order.
        positions.sort_unstable();

        let mut inputs = Vec::with_capacity(positions.len());
        for pos in &positions {
            let entry = &mut state.segments[*pos];
            entry.ensure_live(&self.directory)?;
            inputs.push(MergeInput {
                core: Arc::clone(&entry.core),
                live: entry.live.clone(),
            });
        }
        let ids: Vec<u64> = positions.iter().map(|pos| state.segments[*pos].id()).collect();
        state.merging.extend(ids.iter().copied());
        debug!(segments = ?ids, strategy = ?candidate.strategy, "registered merge");
        Ok(Some(PendingMerge { ids, inputs }))
    }

    fn unregister_merge(&self, merge: &PendingMerge, output: Option<&str>) {
        let mut state = self.state.lock();
        for id in &merge.ids {
            state.merging.remove(id);
        }
        if let Some(name) = output {
            state.in_flight.remove(name);
        }
    }

    /// Write the merged segment and swap it in for its inputs.
    fn run_merge(&self, merge: PendingMerge) -> Result<()> {
        let id = self.segment_counter.fetch_add(1, Ordering::AcqRel);
        let name = segment_name(id);
        self.state.lock().in_flight.insert(name.clone());

        let result = SegmentMerger::new(&self.directory, Arc::clone(&self.config.codec), &merge.inputs)
            .with_abort_flag(&self.abort_merges)
            .merge(id);
        match result {
            Ok(output) => {
                self.apply_merge(&merge, output);
                self.unregister_merge(&merge, Some(&name));
                Ok(())
            }
            Err(e) => {
                self.unregister_merge(&merge, Some(&name));
                Err(e)
            }
        }
    }

    /// Replace the inputs of `merge` with its output, carrying over
    /// deletions made while the merge ran.
    fn apply_merge(&self, merge: &PendingMerge, output: MergeOutput) {
        let mut state = self.state.lock();
        let positions: Option<Vec<usize>> = merge.ids.iter().map(|id| state.position(*id)).collect();
        let Some(positions) = positions else {
            // The inputs were dropped by delete_all; the output is unreferenced.
            debug!(segments = ?merge.ids, "discarding merge of removed segments");
            return;
        };

        let mut merged = output.info.map(|info| {
            let doc_count = info.doc_count;
            let mut live = LiveDocs::all_live(doc_count);
            for ((pos, input), doc_map) in positions.iter().zip(&merge.inputs).zip(&output.doc_maps) {
                let Some(current) = state.segments[*pos].live.as_ref() else {
                    continue;
                };
                for old in 0..current.len() {
                    let was_live = input.live.as_ref().is_none_or(|l| l.is_live(old));
                    if was_live && !current.is_live(old) {
                        if let Some(new) = doc_map.get(old) {
                            live.delete(new);
                        }
                    }
                }
            }
            let core = SegmentCore::open(&self.directory, Arc::new(info), &self.config.codecs);
            let del_count = live.num_deleted();
            SegmentEntry {
                core,
                del_gen: 0,
                live: (del_count > 0).then(|| Arc::new(live)),
                del_count,
                dirty: del_count > 0,
                next_del_gen: 1,
            }
        });

        if let Some(merged) = &merged {
            let files = merged.files();
            state.unsynced.extend(files);
        }
        let insert_at = positions.iter().copied().min().unwrap_or(0);
        let removed: HashSet<u64> = merge.ids.iter().copied().collect();
        let mut segments = Vec::with_capacity(state.segments.len() + 1);
        for (idx, entry) in std::mem::take(&mut state.segments).into_iter().enumerate() {
            if idx == insert_at {
                segments.extend(merged.take());
            }
            if !removed.contains(&entry.id()) {
                segments.push(entry);
            }
        }
        state.segments = segments;
        state.version += 1;
    }

    /// Select natural merges and hand them to the scheduler.
    fn maybe_merge(self: &Arc<Self>) {
        if !self.scheduler.runs_merges() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let candidates = {
            let state = self.state.lock();
            let infos = self.size_infos(&state);
            self.config.merge_policy.select_merges(&infos)
        };

        for candidate in candidates {
            let merge = match self.register_merge(&candidate) {
                Ok(Some(merge)) => merge,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "failed to register merge");
                    self.merge_errors.lock().push(e);
                    continue;
                }
            };
            let ids = merge.ids.clone();
            let weak: Weak<WriterInner> = Arc::downgrade(self);
            let accepted = self.scheduler.submit(Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.run_merge(merge) {
                    if matches!(e, XiphosError::MergeAborted(_)) {
                        debug!(error = %e, "background merge aborted");
                    } else {
                        warn!(error = %e, "background merge failed");
                    }
                    inner.merge_errors.lock().push(e);
                }
            }));
            if !accepted {
                let mut state = self.state.lock();
                for id in &ids {
                    state.merging.remove(id);
                }
            }
        }
    }

    /// Delete files not needed by the current state, the last commit, the
    /// newest commit on storage or a pin. With `committed_only`, the current
    /// uncommitted state is not protected.
    fn delete_unused(&self, committed_only: bool) -> Result<Vec<String>> {
        let deleter = FileDeleter::new(&self.directory);
        let candidates = {
            let state = self.state.lock();
            let mut keep = KeepSet::new();
            if !committed_only {
                for entry in &state.segments {
                    keep.keep_files(entry.files());
                }
                for name in &state.in_flight {
                    keep.keep_segment(name);
                }
            }
            if let Some(commit) = &state.last_commit {
                keep.keep_files(commit.files());
            }
            match CommitPoint::read_latest(self.directory.storage()) {
                Ok(Some(latest)) => keep.keep_files(latest.files()),
                Ok(None) => {}
                Err(e) => {
                    // Keep everything rather than guess what it referenced.
                    warn!(error = %e, "newest commit is unreadable; not deleting files");
                    return Ok(Vec::new());
                }
            }
            deleter.candidates(&keep)?
        };
        let deleted = deleter.delete(candidates);

        let mut state = self.state.lock();
        for name in &deleted {
            state.unsynced.remove(name);
        }
        Ok(deleted)
    }

    fn rollback_internal(&self) {
        let _commit = self.commit_lock.lock();
        self.abort_merges.store(true, Ordering::Release);
        self.scheduler.shutdown();
        {
            let _flush = self.flush_lock.lock();
            let mut buffer = self.buffer.lock();
            buffer.writer = SegmentWriter::new();
            let mut state = self.state.lock();
            state.segments.clear();
            state.merging.clear();
        }
        if let Err(e) = self.delete_unused(true) {
            warn!(error = %e, "failed to delete uncommitted files");
        }
        self.release_lock();
    }
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("index writer dropped without close; uncommitted changes are lost");
        }
        self.abort_merges.store(true, Ordering::Release);
        self.scheduler.shutdown();
        self.release_lock();
    }
}

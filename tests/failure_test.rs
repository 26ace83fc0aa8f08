//! Failure handling: storage faults, crashes, corruption and lock contention.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tempfile::TempDir;
use xiphos::document::document::Document;
use xiphos::document::field::Store;
use xiphos::error::{Result, XiphosError};
use xiphos::index::merge_policy::NoMergePolicy;
use xiphos::index::merge_scheduler::MergeSchedulerConfig;
use xiphos::index::{Directory, DirectoryReader, IndexWriter, IndexWriterConfig};
use xiphos::storage::file::FileStorageConfig;
use xiphos::storage::memory::MemoryStorage;
use xiphos::storage::{Storage, StorageConfig, StorageInput, StorageLock, StorageOutput};

/// Memory storage that can be told to fail file creation or syncs.
#[derive(Debug)]
struct FaultyStorage {
    inner: MemoryStorage,
    fail_create_suffix: Mutex<Option<String>>,
    fail_sync: AtomicBool,
}

impl FaultyStorage {
    fn new() -> Arc<Self> {
        Arc::new(FaultyStorage {
            inner: MemoryStorage::new_default(),
            fail_create_suffix: Mutex::new(None),
            fail_sync: AtomicBool::new(false),
        })
    }

    fn fail_creating(&self, suffix: &str) {
        *self.fail_create_suffix.lock() = Some(suffix.to_string());
    }

    fn heal(&self) {
        *self.fail_create_suffix.lock() = None;
        self.fail_sync.store(false, Ordering::SeqCst);
    }
}

impl Storage for FaultyStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        if let Some(suffix) = self.fail_create_suffix.lock().as_deref() {
            if name.ends_with(suffix) {
                return Err(XiphosError::storage(format!("injected failure creating {name}")));
            }
        }
        self.inner.create_output(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(XiphosError::storage("injected sync failure"));
        }
        self.inner.sync(names)
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.obtain_lock(name)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn doc(id: u32) -> Document {
    Document::builder()
        .add_exact("id", id.to_string(), Store::Yes)
        .add_text("body", format!("failure handling {id}"), Store::Yes)
        .add_numeric_doc_value("id_value", id as i64)
        .build()
}

#[test]
fn test_flush_failure_closes_writer_and_keeps_last_commit() -> Result<()> {
    let storage = FaultyStorage::new();
    let directory = Directory::new(storage.clone());
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(doc(0))?;
    writer.commit()?;

    writer.add_document(doc(1))?;
    storage.fail_creating(".dvd");
    let err = writer.commit().unwrap_err();
    assert!(!matches!(err, XiphosError::WriterClosed { .. }), "{err}");

    assert!(!writer.is_open());
    assert!(matches!(
        writer.add_document(doc(2)),
        Err(XiphosError::WriterClosed { .. })
    ));
    assert!(matches!(writer.commit(), Err(XiphosError::WriterClosed { .. })));

    storage.heal();
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.generation(), 1);
    assert_eq!(reader.num_docs(), 1);

    // The lock was released, and the half-written segment is an orphan.
    assert!(storage.file_exists("_1.pst"));
    let writer = IndexWriter::open(directory.clone(), config())?;
    let deleted = writer.delete_unused_files()?;
    assert!(deleted.contains(&"_1.pst".to_string()), "{deleted:?}");
    assert!(!storage.file_exists("_1.pst"));

    writer.add_document(doc(3))?;
    assert_eq!(writer.commit()?, Some(2));
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 2);
    assert_eq!(reader.leaves()[1].reader.name(), "_2");
    writer.close()
}

#[test]
fn test_sync_failure_closes_writer() -> Result<()> {
    let storage = FaultyStorage::new();
    let directory = Directory::new(storage.clone());
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(doc(0))?;
    writer.commit()?;

    writer.add_document(doc(1))?;
    storage.fail_sync.store(true, Ordering::SeqCst);
    assert!(writer.commit().is_err());
    assert!(!writer.is_open());

    storage.heal();
    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 1);
    assert!(!storage.file_exists("segments_2"));

    // A new writer can publish the generation the failed commit tried.
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(doc(2))?;
    assert_eq!(writer.commit()?, Some(2));
    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 2);
    writer.close()
}

#[test]
fn test_crash_keeps_only_committed_data() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new_default());
    let directory = Directory::new(storage.clone());
    let writer = IndexWriter::open(directory.clone(), config().with_max_buffered_docs(2))?;
    for id in 0..4 {
        writer.add_document(doc(id))?;
    }
    writer.commit()?;

    // Flushed into segments, never committed.
    for id in 4..10 {
        writer.add_document(doc(id))?;
    }
    assert!(writer.segment_count() > 2);

    storage.crash();
    drop(writer);

    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.generation(), 1);
    assert_eq!(reader.num_docs(), 4);
    for doc in 0..4 {
        assert_eq!(reader.document(doc)?.get_text("id"), Some(doc.to_string().as_str()));
    }

    let writer = IndexWriter::open(directory.clone(), config())?;
    assert_eq!(writer.doc_stats().max_doc, 4);
    writer.add_document(doc(10))?;
    writer.commit()?;
    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 5);
    writer.close()
}

fn flip_last_byte(storage: &dyn Storage, name: &str) -> Result<()> {
    let mut bytes = Vec::new();
    storage.open_input(name)?.read_to_end(&mut bytes)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    storage.delete_file(name)?;
    let mut output = storage.create_output(name)?;
    output.write_all(&bytes)?;
    output.close()
}

#[test]
fn test_corruption_is_reported_for_the_damaged_segment_only() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(doc(0))?;
    writer.commit()?;
    writer.add_document(doc(1))?;
    writer.commit()?;
    writer.close()?;

    flip_last_byte(directory.storage(), "_0.pst")?;

    let reader = DirectoryReader::open(&directory)?;
    let damaged = &reader.leaves()[0].reader;
    let healthy = &reader.leaves()[1].reader;

    match damaged.postings("body", "failure") {
        Err(XiphosError::CorruptSegment { segment, .. }) => assert_eq!(segment, "_0"),
        other => panic!("expected corruption in _0, got {other:?}"),
    }
    assert_eq!(healthy.postings("body", "failure")?.len(), 1);
    assert_eq!(healthy.document(0)?.get_text("id"), Some("1"));
    // Other files of the damaged segment are still readable.
    assert_eq!(damaged.document(0)?.get_text("id"), Some("0"));
    Ok(())
}

#[test]
fn test_second_writer_on_file_storage_is_rejected() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let open = || -> Result<Directory> {
        Directory::open(StorageConfig::File(FileStorageConfig::new(dir.path())))
    };

    let first = IndexWriter::open(open()?, config())?;
    let err = IndexWriter::open(open()?, config()).unwrap_err();
    assert!(err.is_lock_contention(), "{err}");

    first.add_document(doc(0))?;
    first.close()?;

    let second = IndexWriter::open(open()?, config())?;
    assert_eq!(second.doc_stats().max_doc, 1);
    second.close()
}

#[test]
fn test_failed_merge_leaves_the_index_untouched() -> Result<()> {
    let storage = FaultyStorage::new();
    let directory = Directory::new(storage.clone());
    let writer = IndexWriter::open(directory.clone(), config())?;
    for id in 0..3 {
        writer.add_document(doc(id))?;
        writer.commit()?;
    }
    let stats = writer.doc_stats();
    assert_eq!(writer.segment_count(), 3);

    // The merged segment _3 gets its postings and doc values, then fails.
    storage.fail_creating(".fld");
    let err = writer.force_merge(1).unwrap_err();
    assert!(!matches!(err, XiphosError::WriterClosed { .. }), "{err}");

    assert!(writer.is_open());
    assert_eq!(writer.segment_count(), 3);
    assert_eq!(writer.doc_stats(), stats);
    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 3);

    let deleted = writer.delete_unused_files()?;
    assert!(deleted.contains(&"_3.pst".to_string()), "{deleted:?}");
    assert!(deleted.contains(&"_3.dvd".to_string()), "{deleted:?}");
    assert!(!storage.file_exists("_3.pst"));

    storage.heal();
    writer.force_merge(1)?;
    assert_eq!(writer.segment_count(), 1);
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 3);
    assert_eq!(reader.leaves().len(), 1);
    writer.close()
}

/// Replace the doc count varint of a single-doc `.dvd` file with `u32::MAX`.
fn inflate_doc_count(storage: &dyn Storage, name: &str, fix_checksum: bool) -> Result<()> {
    let mut bytes = Vec::new();
    storage.open_input(name)?.read_to_end(&mut bytes)?;
    assert_eq!(bytes[8], 1);
    let mut damaged = bytes[..8].to_vec();
    damaged.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
    damaged.extend_from_slice(&bytes[9..]);
    if fix_checksum {
        let body = damaged.len() - 4;
        let checksum = crc32fast::hash(&damaged[..body]);
        damaged[body..].copy_from_slice(&checksum.to_le_bytes());
    }
    storage.delete_file(name)?;
    let mut output = storage.create_output(name)?;
    output.write_all(&damaged)?;
    output.close()
}

#[test]
fn test_damaged_length_field_is_reported_as_corruption() -> Result<()> {
    for fix_checksum in [false, true] {
        let directory = Directory::in_memory();
        let writer = IndexWriter::open(directory.clone(), config())?;
        writer.add_document(doc(0))?;
        writer.commit()?;
        writer.add_document(doc(1))?;
        writer.commit()?;
        writer.close()?;

        inflate_doc_count(directory.storage(), "_0.dvd", fix_checksum)?;

        let reader = DirectoryReader::open(&directory)?;
        match reader.leaves()[0].reader.doc_values() {
            Err(XiphosError::CorruptSegment { segment, .. }) => assert_eq!(segment, "_0"),
            other => panic!("expected corruption in _0, got {other:?}"),
        }
        let healthy = reader.leaves()[1].reader.doc_values()?;
        assert_eq!(healthy.column("id_value").and_then(|c| c.numeric(0)), Some(1));
    }
    Ok(())
}

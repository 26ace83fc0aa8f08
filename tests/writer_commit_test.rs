//! Integration tests for the write and commit path.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;
use xiphos::document::document::Document;
use xiphos::document::field::Store;
use xiphos::error::{Result, XiphosError};
use xiphos::index::commit::CommitPoint;
use xiphos::index::merge_policy::NoMergePolicy;
use xiphos::index::merge_scheduler::MergeSchedulerConfig;
use xiphos::index::{Directory, DirectoryReader, IndexWriter, IndexWriterConfig, OpenMode, Term};
use xiphos::search::Searcher;
use xiphos::storage::StorageConfig;
use xiphos::storage::file::FileStorageConfig;

fn file_directory(dir: &TempDir) -> Directory {
    Directory::open(StorageConfig::File(FileStorageConfig::new(dir.path()))).unwrap()
}

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn article(id: u32, body: &str) -> Document {
    Document::builder()
        .add_exact("id", id.to_string(), Store::Yes)
        .add_text("body", body, Store::Yes)
        .add_numeric_doc_value("rank", id as i64)
        .build()
}

#[test]
fn test_num_docs_matches_non_deleted_adds() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let directory = file_directory(&dir);
    let writer = IndexWriter::open(directory.clone(), config().with_max_buffered_docs(7))?;

    for id in 0..50 {
        writer.add_document(article(id, "rust search engine"))?;
    }
    for id in (0..50).step_by(5) {
        writer.delete_documents(&Term::new("id", id.to_string()))?;
    }
    writer.commit()?;

    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 40);
    assert_eq!(reader.max_doc(), 50);
    assert_eq!(writer.doc_stats().num_docs, 40);
    assert_eq!(writer.doc_stats().max_doc, 50);
    writer.close()
}

#[test]
fn test_second_commit_without_changes_is_a_noop() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(article(1, "hello"))?;

    let generation = writer.commit()?;
    assert_eq!(generation, Some(1));
    assert_eq!(writer.commit()?, None);
    assert_eq!(writer.generation(), 1);

    let files = directory.storage().list_files()?;
    assert!(files.contains(&"segments_1".to_string()));
    assert!(!files.iter().any(|name| name.starts_with("segments_2")));
    Ok(())
}

#[test]
fn test_commit_publishes_atomically() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(article(1, "hello"))?;
    writer.commit()?;

    let files = directory.storage().list_files()?;
    assert!(!files.iter().any(|name| name.starts_with("pending_segments_")));
    let commit = CommitPoint::read_latest(directory.storage())?.unwrap();
    assert_eq!(commit.generation, 1);
    assert_eq!(commit.segments.len(), 1);
    assert_eq!(commit.segments[0].name(), "_0");
    Ok(())
}

#[test]
fn test_reopen_appends_without_reusing_names() -> Result<()> {
    let dir = TempDir::new().unwrap();
    {
        let writer = IndexWriter::open(file_directory(&dir), config())?;
        writer.add_document(article(1, "first"))?;
        writer.close()?;
    }

    let directory = file_directory(&dir);
    let writer = IndexWriter::open(directory.clone(), config().with_open_mode(OpenMode::Append))?;
    assert_eq!(writer.generation(), 1);
    assert_eq!(writer.doc_stats().max_doc, 1);

    writer.add_document(article(2, "second"))?;
    assert_eq!(writer.commit()?, Some(2));

    let commit = CommitPoint::read_latest(directory.storage())?.unwrap();
    let names: Vec<&str> = commit.segments.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["_0", "_1"]);
    assert_eq!(commit.num_docs(), 2);
    writer.close()
}

#[test]
fn test_create_mode_starts_empty_but_keeps_generation() -> Result<()> {
    let directory = Directory::in_memory();
    {
        let writer = IndexWriter::open(directory.clone(), config())?;
        writer.add_document(article(1, "old"))?;
        writer.close()?;
    }

    let writer = IndexWriter::open(directory.clone(), config().with_open_mode(OpenMode::Create))?;
    assert_eq!(writer.doc_stats().max_doc, 0);
    writer.add_document(article(2, "new"))?;
    assert_eq!(writer.commit()?, Some(2));

    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.document(0)?.get_text("id"), Some("2"));
    Ok(())
}

#[test]
fn test_commit_user_data_round_trips() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    let mut user_data = BTreeMap::new();
    user_data.insert("source_offset".to_string(), "1042".to_string());
    writer.set_commit_user_data(user_data.clone())?;
    writer.commit()?;
    writer.close()?;

    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.user_data(), &user_data);

    let writer = IndexWriter::open(directory, config())?;
    assert_eq!(writer.commit_user_data(), user_data);
    Ok(())
}

#[test]
fn test_deleted_docs_leave_postings() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(article(1, "apple banana"))?;
    writer.add_document(article(2, "banana cherry"))?;
    writer.commit()?;

    writer.delete_documents(&Term::new("body", "apple"))?;
    writer.commit()?;

    let reader = DirectoryReader::open(&directory)?;
    let searcher = Searcher::new(&reader);
    assert_eq!(searcher.search_term("body", "apple", 10)?.total_hits, 0);
    assert_eq!(searcher.search_term("body", "banana", 10)?.docs(), vec![1]);
    assert_eq!(reader.max_doc(), 2);
    assert_eq!(reader.num_docs(), 1);
    Ok(())
}

#[test]
fn test_close_commits_and_rejects_later_calls() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(article(1, "pending"))?;
    writer.close()?;

    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 1);
    assert!(matches!(writer.commit(), Err(XiphosError::WriterClosed { .. })));
    assert!(matches!(
        writer.delete_documents(&Term::new("id", "1")),
        Err(XiphosError::WriterClosed { .. })
    ));
    Ok(())
}

#[test]
fn test_close_without_commit_on_close_discards() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), config())?;
    writer.add_document(article(1, "kept"))?;
    writer.commit()?;
    writer.close()?;

    let writer = IndexWriter::open(directory.clone(), config().with_commit_on_close(false))?;
    writer.add_document(article(2, "dropped"))?;
    writer.close()?;

    assert_eq!(DirectoryReader::open(&directory)?.num_docs(), 1);
    Ok(())
}

#[test]
fn test_ram_threshold_flushes() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory, config().with_ram_buffer_size_bytes(256))?;
    for id in 0..20 {
        writer.add_document(article(id, "a body long enough to fill the tiny buffer quickly"))?;
    }
    assert!(writer.segment_count() > 1);
    assert_eq!(writer.doc_stats().max_doc, 20);
    Ok(())
}

#[test]
fn test_text_codec_index_is_readable() -> Result<()> {
    let directory = Directory::in_memory();
    let codec = Arc::new(xiphos::codec::text::PlainTextCodec);
    let writer = IndexWriter::open(directory.clone(), config().with_codec(codec))?;
    writer.add_document(article(1, "plain text"))?;
    writer.commit()?;

    assert!(directory.storage().file_exists("_0.pst.txt"));
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.leaves()[0].reader.info().codec, "text");
    assert_eq!(Searcher::new(&reader).search_term("body", "plain", 10)?.total_hits, 1);
    Ok(())
}

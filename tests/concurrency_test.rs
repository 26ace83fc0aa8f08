//! Concurrent writers, committers and readers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use xiphos::document::document::Document;
use xiphos::document::field::Store;
use xiphos::error::Result;
use xiphos::index::merge_policy::{TieredMergePolicy, TieredMergePolicyConfig};
use xiphos::index::merge_scheduler::MergeSchedulerConfig;
use xiphos::index::{Directory, DirectoryReader, IndexWriter, IndexWriterConfig};
use xiphos::search::Searcher;

const THREADS: u32 = 8;
const DOCS_PER_THREAD: u32 = 250;

fn doc(thread: u32, i: u32) -> Document {
    Document::builder()
        .add_exact("id", format!("{thread}-{i}"), Store::Yes)
        .add_exact("thread", thread.to_string(), Store::No)
        .add_text("body", "concurrent indexing works", Store::No)
        .build()
}

fn concurrent_writer(directory: &Directory) -> Result<Arc<IndexWriter>> {
    let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
        segments_per_tier: 4,
        max_merge_at_once: 4,
        ..Default::default()
    });
    let config = IndexWriterConfig::default()
        .with_max_buffered_docs(64)
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent { max_threads: 2 });
    Ok(Arc::new(IndexWriter::open(directory.clone(), config)?))
}

#[test]
fn test_concurrent_adds_lose_nothing() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = concurrent_writer(&directory)?;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> Result<()> {
                for i in 0..DOCS_PER_THREAD {
                    writer.add_document(doc(t, i))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("indexing thread panicked")?;
    }

    writer.commit()?;
    writer.wait_for_merges();
    writer.commit()?;
    assert!(writer.take_merge_errors().is_empty());

    let total = THREADS * DOCS_PER_THREAD;
    assert_eq!(writer.doc_stats().max_doc, total as u64);
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.max_doc(), total);
    assert_eq!(reader.num_docs(), total);

    let searcher = Searcher::new(&reader);
    for t in 0..THREADS {
        let hits = searcher.search_term("thread", &t.to_string(), 0)?;
        assert_eq!(hits.total_hits, DOCS_PER_THREAD as u64);
    }
    assert_eq!(searcher.search_term("id", "3-17", 10)?.total_hits, 1);
    writer.close()
}

#[test]
fn test_commits_and_readers_during_indexing() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = concurrent_writer(&directory)?;
    let done = Arc::new(AtomicBool::new(false));

    let committer = {
        let writer = Arc::clone(&writer);
        let done = Arc::clone(&done);
        thread::spawn(move || -> Result<u32> {
            let mut commits = 0;
            while !done.load(Ordering::Acquire) {
                if writer.commit()?.is_some() {
                    commits += 1;
                }
                thread::yield_now();
            }
            Ok(commits)
        })
    };

    let reader_thread = {
        let directory = directory.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || -> Result<()> {
            let mut last_seen = 0;
            while !done.load(Ordering::Acquire) {
                let Ok(reader) = DirectoryReader::open(&directory) else {
                    thread::yield_now();
                    continue;
                };
                // Commits only ever grow the index in this test.
                assert!(reader.num_docs() >= last_seen);
                assert_eq!(reader.num_docs(), reader.max_doc());
                let hits = Searcher::new(&reader).search_term("body", "indexing", 0)?;
                assert_eq!(hits.total_hits, reader.num_docs() as u64);
                last_seen = reader.num_docs();
            }
            Ok(())
        })
    };

    let indexers: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> Result<()> {
                for i in 0..DOCS_PER_THREAD {
                    writer.add_document(doc(t, i))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in indexers {
        handle.join().expect("indexing thread panicked")?;
    }
    done.store(true, Ordering::Release);
    committer.join().expect("committer panicked")?;
    reader_thread.join().expect("reader panicked")?;

    writer.commit()?;
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 4 * DOCS_PER_THREAD);
    writer.close()
}

#[test]
fn test_near_real_time_refresh_under_load() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = concurrent_writer(&directory)?;

    let indexer = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || -> Result<()> {
            for i in 0..DOCS_PER_THREAD {
                writer.add_document(doc(0, i))?;
            }
            Ok(())
        })
    };

    let mut reader = DirectoryReader::open_from_writer(&writer)?;
    for _ in 0..20 {
        if let Some(next) = reader.open_if_changed_from_writer(&writer)? {
            assert!(next.num_docs() >= reader.num_docs());
            reader = next;
        }
    }
    indexer.join().expect("indexing thread panicked")?;

    let last = reader
        .open_if_changed_from_writer(&writer)?
        .unwrap_or(reader);
    assert_eq!(last.num_docs(), DOCS_PER_THREAD);
    writer.close()
}

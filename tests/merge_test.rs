//! Integration tests for forced and background merges.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use xiphos::codec::text::PlainTextCodec;
use xiphos::document::document::{Document, StoredDocument};
use xiphos::document::field::Store;
use xiphos::error::{Result, XiphosError};
use xiphos::index::merge_policy::{
    MergeCandidate, MergePolicy, NoMergePolicy, SegmentSizeInfo, TieredMergePolicy,
    TieredMergePolicyConfig,
};
use xiphos::index::merge_scheduler::MergeSchedulerConfig;
use xiphos::index::{
    Directory, DirectoryReader, IndexWriter, IndexWriterConfig, MergeCancellation, Term,
};
use xiphos::search::Searcher;

fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn doc(id: u32) -> Document {
    Document::builder()
        .add_exact("id", id.to_string(), Store::Yes)
        .add_text("body", format!("merge test document {id} shared"), Store::Yes)
        .add_stored("payload", vec![id as u8, 0xff, 0x00])
        .add_numeric_doc_value("rank", 100 - id as i64)
        .build()
}

fn live_documents(reader: &DirectoryReader) -> Result<Vec<StoredDocument>> {
    let mut docs = Vec::new();
    for doc in 0..reader.max_doc() {
        if reader.is_live(doc)? {
            docs.push(reader.document(doc)?);
        }
    }
    Ok(docs)
}

fn build_segments(writer: &IndexWriter, segments: u32, per_segment: u32) -> Result<()> {
    for s in 0..segments {
        for i in 0..per_segment {
            writer.add_document(doc(s * per_segment + i))?;
        }
        writer.commit()?;
    }
    Ok(())
}

#[test]
fn test_force_merge_to_one_segment_preserves_content() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), serial_config())?;
    build_segments(&writer, 5, 4)?;
    writer.delete_documents(&Term::new("id", "3"))?;
    writer.delete_documents(&Term::new("id", "17"))?;
    writer.commit()?;

    let before = DirectoryReader::open(&directory)?;
    assert_eq!(before.leaves().len(), 5);
    let live_before = before.num_docs();
    let docs_before = live_documents(&before)?;

    writer.force_merge(1)?;
    assert_eq!(writer.segment_count(), 1);

    let after = DirectoryReader::open(&directory)?;
    assert_eq!(after.leaves().len(), 1);
    assert_eq!(after.num_docs(), live_before);
    assert_eq!(after.max_doc(), live_before);
    assert_eq!(after.num_deleted_docs(), 0);
    assert_eq!(live_documents(&after)?, docs_before);

    let info = after.leaves()[0].reader.info();
    assert_eq!(info.diagnostics.get("source").map(String::as_str), Some("merge"));

    let searcher = Searcher::new(&after);
    assert_eq!(searcher.search_term("body", "shared", 100)?.total_hits, 18);
    assert_eq!(searcher.search_term("id", "3", 10)?.total_hits, 0);
    let hit = searcher.search_term("id", "4", 10)?.hits[0].doc;
    assert_eq!(searcher.numeric_doc_value("rank", hit)?, Some(96));
    Ok(())
}

#[test]
fn test_force_merge_rejects_zero() {
    let writer = IndexWriter::open(Directory::in_memory(), serial_config()).unwrap();
    assert!(matches!(
        writer.force_merge(0),
        Err(XiphosError::InvalidArgument(_))
    ));
}

#[test]
fn test_force_merge_single_segment_reclaims_deletes() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), serial_config())?;
    build_segments(&writer, 1, 6)?;
    writer.delete_documents(&Term::new("id", "0"))?;

    writer.force_merge(1)?;
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.max_doc(), 5);
    assert_eq!(reader.num_docs(), 5);
    assert_eq!(reader.leaves()[0].reader.name(), "_1");
    Ok(())
}

#[test]
fn test_merge_of_fully_deleted_segments_drops_them() -> Result<()> {
    let directory = Directory::in_memory();
    let writer = IndexWriter::open(directory.clone(), serial_config())?;
    build_segments(&writer, 2, 1)?;
    writer.delete_documents(&Term::new("body", "shared"))?;
    writer.force_merge(1)?;

    assert_eq!(writer.segment_count(), 0);
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.max_doc(), 0);
    Ok(())
}

#[test]
fn test_mixed_codecs_merge_into_writer_codec() -> Result<()> {
    let directory = Directory::in_memory();
    {
        let config = serial_config().with_codec(Arc::new(PlainTextCodec));
        let writer = IndexWriter::open(directory.clone(), config)?;
        build_segments(&writer, 2, 3)?;
        writer.close()?;
    }

    let writer = IndexWriter::open(directory.clone(), serial_config())?;
    build_segments(&writer, 1, 3)?;
    let before = DirectoryReader::open(&directory)?;
    let codecs: Vec<&str> = before
        .leaves()
        .iter()
        .map(|leaf| leaf.reader.info().codec.as_str())
        .collect();
    assert_eq!(codecs, vec!["text", "text", "binary"]);

    writer.force_merge(1)?;
    let after = DirectoryReader::open(&directory)?;
    assert_eq!(after.leaves()[0].reader.info().codec, "binary");
    assert_eq!(live_documents(&after)?, live_documents(&before)?);
    Ok(())
}

/// Forced-merge policy that merges two segments per step and cancels its
/// token once `cancel_on_step` steps have been selected.
#[derive(Debug)]
struct CancellingPolicy {
    token: MergeCancellation,
    cancel_on_step: usize,
    steps: AtomicUsize,
}

impl MergePolicy for CancellingPolicy {
    fn select_merges(&self, _segments: &[SegmentSizeInfo]) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn select_forced_merges(
        &self,
        segments: &[SegmentSizeInfo],
        max_segments: usize,
    ) -> Vec<MergeCandidate> {
        let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
            max_merge_at_once: 2,
            ..Default::default()
        });
        let candidates = policy.select_forced_merges(segments, max_segments);
        if !candidates.is_empty()
            && self.steps.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_on_step
        {
            self.token.cancel();
        }
        candidates
    }

    fn get_config(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[test]
fn test_cancelled_force_merge_keeps_completed_steps() -> Result<()> {
    let directory = Directory::in_memory();
    let token = MergeCancellation::new();
    let policy = CancellingPolicy {
        token: token.clone(),
        cancel_on_step: 2,
        steps: AtomicUsize::new(0),
    };
    let config = serial_config().with_merge_policy(Arc::new(policy));
    let writer = IndexWriter::open(directory.clone(), config)?;
    build_segments(&writer, 5, 2)?;

    let err = writer.force_merge_with_cancel(1, &token).unwrap_err();
    assert!(matches!(err, XiphosError::MergeAborted(_)));
    assert!(writer.is_open());

    // Two steps of two segments each completed and were committed.
    assert_eq!(writer.segment_count(), 3);
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.leaves().len(), 3);
    assert_eq!(reader.num_docs(), 10);

    // The writer stays usable.
    writer.force_merge(1)?;
    assert_eq!(writer.segment_count(), 1);
    Ok(())
}

#[test]
fn test_background_merges_keep_segment_count_bounded() -> Result<()> {
    let directory = Directory::in_memory();
    let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
        segments_per_tier: 3,
        max_merge_at_once: 3,
        ..Default::default()
    });
    let config = IndexWriterConfig::default()
        .with_max_buffered_docs(5)
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent { max_threads: 2 });
    let writer = IndexWriter::open(directory.clone(), config)?;

    for id in 0..200 {
        writer.add_document(doc(id))?;
    }
    writer.commit()?;
    writer.wait_for_merges();
    writer.commit()?;

    assert!(writer.take_merge_errors().is_empty());
    assert!(writer.segment_count() < 40, "segments: {}", writer.segment_count());
    let reader = DirectoryReader::open(&directory)?;
    assert_eq!(reader.num_docs(), 200);
    assert_eq!(Searcher::new(&reader).search_term("body", "shared", 500)?.total_hits, 200);
    writer.close()
}

#[test]
fn test_deletes_during_background_merge_are_carried_over() -> Result<()> {
    let directory = Directory::in_memory();
    let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
        segments_per_tier: 2,
        max_merge_at_once: 2,
        ..Default::default()
    });
    let config = IndexWriterConfig::default()
        .with_max_buffered_docs(10)
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent { max_threads: 1 });
    let writer = IndexWriter::open(directory.clone(), config)?;

    for id in 0..100 {
        writer.add_document(doc(id))?;
        if id % 7 == 0 && id > 0 {
            writer.delete_documents(&Term::new("id", (id - 7).to_string()))?;
        }
    }
    writer.wait_for_merges();
    writer.commit()?;
    writer.wait_for_merges();
    writer.commit()?;

    let reader = DirectoryReader::open(&directory)?;
    // Ids 0, 7, .., 91 were deleted.
    assert_eq!(reader.num_docs(), 100 - 14);
    let searcher = Searcher::new(&reader);
    assert_eq!(searcher.search_term("id", "7", 10)?.total_hits, 0);
    assert_eq!(searcher.search_term("id", "98", 10)?.total_hits, 1);
    writer.close()
}

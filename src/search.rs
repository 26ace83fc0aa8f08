//! Read-only access to a reader snapshot.
//!
//! The [`Searcher`] scans the postings and doc-value columns of each leaf of
//! a [`DirectoryReader`] and returns global doc ids. Scoring is plain term
//! frequency.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::document::document::StoredDocument;
use crate::error::{Result, XiphosError};
use crate::index::reader::DirectoryReader;

/// One hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDoc {
    /// Global doc id within the reader.
    pub doc: u32,
    pub score: f32,
    /// Doc value the hits were sorted by, if any.
    pub sort_value: Option<i64>,
}

/// The top hits of a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopDocs {
    /// Every matching live document, not only the returned ones.
    pub total_hits: u64,
    pub hits: Vec<ScoreDoc>,
}

impl TopDocs {
    pub fn docs(&self) -> Vec<u32> {
        self.hits.iter().map(|hit| hit.doc).collect()
    }
}

/// Heap entry ordered so that the worst hit is on top.
#[derive(Debug)]
struct Ranked {
    key: RankKey,
    hit: ScoreDoc,
}

#[derive(Debug, Clone, Copy)]
enum RankKey {
    /// Higher score first, then lower doc.
    Score(f32),
    /// Lower value first, missing last, then lower doc.
    Value(Option<i64>),
}

impl Ranked {
    /// `Less` when `self` ranks before `other`.
    fn rank(&self, other: &Self) -> Ordering {
        let primary = match (self.key, other.key) {
            (RankKey::Score(a), RankKey::Score(b)) => b.total_cmp(&a),
            (RankKey::Value(a), RankKey::Value(b)) => match (a, b) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            _ => Ordering::Equal,
        };
        primary.then_with(|| self.hit.doc.cmp(&other.hit.doc))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Keeps the best `limit` hits.
#[derive(Debug)]
struct TopCollector {
    limit: usize,
    heap: BinaryHeap<Ranked>,
    total_hits: u64,
}

impl TopCollector {
    fn new(limit: usize) -> Self {
        TopCollector {
            limit,
            heap: BinaryHeap::with_capacity(limit.min(1024) + 1),
            total_hits: 0,
        }
    }

    fn collect(&mut self, key: RankKey, hit: ScoreDoc) {
        self.total_hits += 1;
        if self.limit == 0 {
            return;
        }
        self.heap.push(Ranked { key, hit });
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
    }

    fn top_docs(self) -> TopDocs {
        TopDocs {
            total_hits: self.total_hits,
            hits: self
                .heap
                .into_sorted_vec()
                .into_iter()
                .map(|ranked| ranked.hit)
                .collect(),
        }
    }
}

/// Searches one reader snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Searcher<'a> {
    reader: &'a DirectoryReader,
}

impl<'a> Searcher<'a> {
    pub fn new(reader: &'a DirectoryReader) -> Self {
        Searcher { reader }
    }

    pub fn reader(&self) -> &'a DirectoryReader {
        self.reader
    }

    fn ensure_open(&self) -> Result<()> {
        if self.reader.is_closed() {
            return Err(XiphosError::ReaderClosed);
        }
        Ok(())
    }

    /// Live documents containing `field:term`, best term frequency first.
    pub fn search_term(&self, field: &str, term: &str, limit: usize) -> Result<TopDocs> {
        self.ensure_open()?;
        let mut collector = TopCollector::new(limit);
        for leaf in self.reader.leaves() {
            for posting in leaf.reader.postings(field, term)? {
                let score = posting.frequency as f32;
                collector.collect(
                    RankKey::Score(score),
                    ScoreDoc {
                        doc: leaf.doc_base + posting.doc,
                        score,
                        sort_value: None,
                    },
                );
            }
        }
        Ok(collector.top_docs())
    }

    /// Every live document, in doc id order.
    pub fn match_all(&self, limit: usize) -> Result<TopDocs> {
        self.ensure_open()?;
        let mut collector = TopCollector::new(limit);
        for leaf in self.reader.leaves() {
            let live = leaf.reader.live_docs()?;
            for doc in 0..leaf.reader.max_doc() {
                if live.as_ref().is_some_and(|live| !live.is_live(doc)) {
                    continue;
                }
                collector.collect(
                    RankKey::Score(1.0),
                    ScoreDoc {
                        doc: leaf.doc_base + doc,
                        score: 1.0,
                        sort_value: None,
                    },
                );
            }
        }
        Ok(collector.top_docs())
    }

    /// Live documents containing `field:term`, ascending by the numeric doc
    /// value `sort_field`. Documents without a value come last.
    pub fn search_term_sorted_by_numeric(
        &self,
        field: &str,
        term: &str,
        sort_field: &str,
        limit: usize,
    ) -> Result<TopDocs> {
        self.ensure_open()?;
        let mut collector = TopCollector::new(limit);
        for leaf in self.reader.leaves() {
            let postings = leaf.reader.postings(field, term)?;
            if postings.is_empty() {
                continue;
            }
            let doc_values = leaf.reader.doc_values()?;
            let column = doc_values.column(sort_field);
            for posting in postings {
                let value = column.and_then(|column| column.numeric(posting.doc));
                collector.collect(
                    RankKey::Value(value),
                    ScoreDoc {
                        doc: leaf.doc_base + posting.doc,
                        score: posting.frequency as f32,
                        sort_value: value,
                    },
                );
            }
        }
        Ok(collector.top_docs())
    }

    /// Numeric doc value of global doc id `doc`.
    pub fn numeric_doc_value(&self, field: &str, doc: u32) -> Result<Option<i64>> {
        let leaf = self.reader.leaf_for(doc)?;
        let doc_values = leaf.reader.doc_values()?;
        Ok(doc_values
            .column(field)
            .and_then(|column| column.numeric(doc - leaf.doc_base)))
    }

    /// Binary doc value of global doc id `doc`.
    pub fn binary_doc_value(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        let leaf = self.reader.leaf_for(doc)?;
        let doc_values = leaf.reader.doc_values()?;
        Ok(doc_values
            .column(field)
            .and_then(|column| column.binary(doc - leaf.doc_base))
            .map(<[u8]>::to_vec))
    }

    /// Stored fields of global doc id `doc`.
    pub fn doc(&self, doc: u32) -> Result<StoredDocument> {
        self.reader.document(doc)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::document::document::Document;
    use crate::document::field::Store;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::MergeSchedulerConfig;
    use crate::index::{Directory, IndexWriter, IndexWriterConfig, Term};

    fn build_index() -> Directory {
        let directory = Directory::in_memory();
        let config = IndexWriterConfig::default()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial);
        let writer = IndexWriter::open(directory.clone(), config).unwrap();

        let books = [
            ("1", "the quick brown fox", Some(1999)),
            ("2", "a fox and another fox", Some(1987)),
            ("3", "lazy dogs sleep", None),
            ("4", "fox", None),
        ];
        for (i, (id, title, year)) in books.iter().enumerate() {
            let mut builder = Document::builder()
                .add_exact("id", *id, Store::Yes)
                .add_text("title", *title, Store::Yes)
                .add_binary_doc_value("tag", id.as_bytes().to_vec());
            if let Some(year) = year {
                builder = builder.add_numeric_doc_value("year", *year);
            }
            writer.add_document(builder.build()).unwrap();
            if i == 1 {
                writer.commit().unwrap();
            }
        }
        writer.delete_documents(&Term::new("id", "4")).unwrap();
        writer.close().unwrap();
        directory
    }

    #[test]
    fn test_search_term_ranks_by_frequency() {
        let directory = build_index();
        let reader = DirectoryReader::open(&directory).unwrap();
        let searcher = Searcher::new(&reader);

        let top = searcher.search_term("title", "fox", 10).unwrap();
        assert_eq!(top.total_hits, 2);
        assert_eq!(top.docs(), vec![1, 0]);
        assert_eq!(top.hits[0].score, 2.0);

        let top = searcher.search_term("title", "fox", 1).unwrap();
        assert_eq!(top.total_hits, 2);
        assert_eq!(top.docs(), vec![1]);

        assert_eq!(searcher.search_term("title", "cat", 10).unwrap().total_hits, 0);
    }

    #[test]
    fn test_match_all_skips_deleted() {
        let directory = build_index();
        let reader = DirectoryReader::open(&directory).unwrap();
        let top = Searcher::new(&reader).match_all(10).unwrap();
        assert_eq!(top.docs(), vec![0, 1, 2]);
    }

    #[test]
    fn test_sorted_by_numeric_doc_value() {
        let directory = build_index();
        let reader = DirectoryReader::open(&directory).unwrap();
        let searcher = Searcher::new(&reader);

        let top = searcher
            .search_term_sorted_by_numeric("title", "fox", "year", 10)
            .unwrap();
        assert_eq!(top.docs(), vec![1, 0]);
        assert_eq!(top.hits[0].sort_value, Some(1987));

        let top = searcher.search_term_sorted_by_numeric("id", "3", "year", 10).unwrap();
        assert_eq!(top.hits[0].sort_value, None);
    }

    #[test]
    fn test_doc_value_and_stored_access() {
        let directory = build_index();
        let reader = DirectoryReader::open(&directory).unwrap();
        let searcher = Searcher::new(&reader);

        assert_eq!(searcher.numeric_doc_value("year", 0).unwrap(), Some(1999));
        assert_eq!(searcher.numeric_doc_value("year", 2).unwrap(), None);
        assert_eq!(searcher.binary_doc_value("tag", 2).unwrap(), Some(b"3".to_vec()));
        assert_eq!(searcher.doc(1).unwrap().get_text("title"), Some("a fox and another fox"));
        assert!(searcher.doc(99).is_err());
    }
}

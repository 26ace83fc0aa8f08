//! Segment merging.
//!
//! [`SegmentMerger`] concatenates the live documents of its inputs, in input
//! order, into one new segment. Ordinals are reassigned contiguously and the
//! per-input [`DocMap`]s record the translation, so deletions that arrive
//! while the merge runs can be carried over to the result.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::codec::{Codec, DocValues, DocValuesColumn, Posting, PostingList, SegmentPostings, StoredFields};
use crate::document::field::IndexingMode;
use crate::error::{Result, XiphosError};
use crate::index::directory::Directory;
use crate::index::live_docs::LiveDocs;
use crate::index::schema::FieldInfos;
use crate::index::segment::{SegmentInfo, segment_name};
use crate::index::segment_reader::SegmentCore;

/// One merge input: a segment and the deletions it had when the merge
/// started.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub core: Arc<SegmentCore>,
    pub live: Option<Arc<LiveDocs>>,
}

impl MergeInput {
    fn is_live(&self, doc: u32) -> bool {
        self.live.as_ref().is_none_or(|live| live.is_live(doc))
    }
}

/// Old ordinal to new ordinal for one input; `None` for dropped documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMap {
    map: Vec<Option<u32>>,
}

impl DocMap {
    pub fn get(&self, old: u32) -> Option<u32> {
        self.map.get(old as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Result of a merge.
#[derive(Debug)]
pub struct MergeOutput {
    /// The new segment, or `None` when no input had a live document.
    pub info: Option<SegmentInfo>,
    pub doc_maps: Vec<DocMap>,
}

pub struct SegmentMerger<'a> {
    directory: &'a Directory,
    codec: Arc<dyn Codec>,
    inputs: &'a [MergeInput],
    abort: Option<&'a AtomicBool>,
}

impl<'a> SegmentMerger<'a> {
    pub fn new(directory: &'a Directory, codec: Arc<dyn Codec>, inputs: &'a [MergeInput]) -> Self {
        SegmentMerger {
            directory,
            codec,
            inputs,
            abort: None,
        }
    }

    /// Stop between phases once `flag` is set.
    pub fn with_abort_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.abort = Some(flag);
        self
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(XiphosError::merge_aborted("writer is closing"));
        }
        Ok(())
    }

    fn doc_maps(&self) -> (Vec<DocMap>, u32) {
        let mut next = 0u32;
        let maps = self
            .inputs
            .iter()
            .map(|input| {
                let map = (0..input.core.max_doc())
                    .map(|doc| {
                        input.is_live(doc).then(|| {
                            next += 1;
                            next - 1
                        })
                    })
                    .collect();
                DocMap { map }
            })
            .collect();
        (maps, next)
    }

    /// Write the merged segment as segment `id`.
    pub fn merge(&self, id: u64) -> Result<MergeOutput> {
        let (doc_maps, doc_count) = self.doc_maps();
        if doc_count == 0 {
            return Ok(MergeOutput {
                info: None,
                doc_maps,
            });
        }

        let mut fields = FieldInfos::new();
        for input in self.inputs {
            fields
                .merge(&input.core.info().fields)
                .map_err(|e| e.in_segment(input.core.name()))?;
        }

        let name = segment_name(id);
        let storage = self.directory.storage();

        self.check_abort()?;
        let postings = self.merge_postings(&doc_maps)?;
        let mut files = vec![self.codec.write_postings(storage, &name, &postings)?];
        drop(postings);

        self.check_abort()?;
        let doc_values = self.merge_doc_values(&fields, &doc_maps, doc_count)?;
        files.push(self.codec.write_doc_values(storage, &name, &doc_values)?);

        self.check_abort()?;
        let stored = self.merge_stored_fields(&doc_maps)?;
        files.push(self.codec.write_stored_fields(storage, &name, &stored)?);

        let merged_from: Vec<&str> = self.inputs.iter().map(|i| i.core.name()).collect();
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("source".to_string(), "merge".to_string());
        diagnostics.insert("merged_from".to_string(), merged_from.join(","));
        diagnostics.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        diagnostics.insert("version".to_string(), crate::VERSION.to_string());

        let mut info = SegmentInfo {
            id,
            name,
            codec: self.codec.name().to_string(),
            doc_count,
            fields,
            files,
            diagnostics,
        };
        info.write(storage)?;

        info!(
            segment = %info.name,
            inputs = ?merged_from,
            docs = doc_count,
            "merged segments"
        );
        Ok(MergeOutput {
            info: Some(info),
            doc_maps,
        })
    }

    /// K-way merge of the term dictionaries, field by field.
    fn merge_postings(&self, doc_maps: &[DocMap]) -> Result<SegmentPostings> {
        let sources = self
            .inputs
            .iter()
            .map(|input| input.core.postings())
            .collect::<Result<Vec<_>>>()?;

        let fields: BTreeSet<&str> = sources
            .iter()
            .flat_map(|postings| postings.fields().map(|(field, _)| field))
            .collect();

        let mut merged = SegmentPostings::new();
        for field in fields {
            let mut iters: Vec<_> = sources
                .iter()
                .map(|postings| postings.field(field).map(|terms| terms.iter()))
                .collect();
            let mut heads: Vec<Option<(&String, &PostingList)>> = iters
                .iter_mut()
                .map(|iter| iter.as_mut().and_then(Iterator::next))
                .collect();

            let mut heap = BinaryHeap::new();
            for (idx, head) in heads.iter().enumerate() {
                if let Some((term, _)) = head {
                    heap.push(Reverse((term.as_str(), idx)));
                }
            }

            while let Some(&Reverse((term, _))) = heap.peek() {
                let mut list = PostingList::new();
                // Ties pop in input order, which keeps new ordinals ascending.
                while let Some(&Reverse((next_term, idx))) = heap.peek() {
                    if next_term != term {
                        break;
                    }
                    heap.pop();
                    if let Some((_, source)) = heads[idx] {
                        for posting in source.iter() {
                            if let Some(doc) = doc_maps[idx].get(posting.doc) {
                                list.push(Posting {
                                    doc,
                                    frequency: posting.frequency,
                                    positions: posting.positions.clone(),
                                });
                            }
                        }
                    }
                    heads[idx] = iters[idx].as_mut().and_then(Iterator::next);
                    if let Some((following, _)) = heads[idx] {
                        heap.push(Reverse((following.as_str(), idx)));
                    }
                }
                merged.insert(field, term, list);
            }
        }
        Ok(merged)
    }

    fn merge_doc_values(
        &self,
        fields: &FieldInfos,
        doc_maps: &[DocMap],
        doc_count: u32,
    ) -> Result<DocValues> {
        let sources = self
            .inputs
            .iter()
            .map(|input| input.core.doc_values())
            .collect::<Result<Vec<_>>>()?;

        let mut merged = DocValues::new(doc_count);
        for (field, mode) in fields.iter() {
            let IndexingMode::DocValue(kind) = mode else {
                continue;
            };
            let mut column = DocValuesColumn::empty(kind, 0);
            for (source, map) in sources.iter().zip(doc_maps) {
                let source_column = source.column(field);
                for old in 0..map.len() as u32 {
                    let Some(new) = map.get(old) else {
                        continue;
                    };
                    column.pad_to(new as usize);
                    if let Some(source_column) = source_column {
                        column.push_from(source_column, old)?;
                    }
                }
            }
            column.pad_to(doc_count as usize);
            merged.insert(field, column)?;
        }
        Ok(merged)
    }

    fn merge_stored_fields(&self, doc_maps: &[DocMap]) -> Result<StoredFields> {
        let mut merged = StoredFields::new();
        for (input, map) in self.inputs.iter().zip(doc_maps) {
            let stored = input.core.stored_fields()?;
            for old in 0..map.len() as u32 {
                if map.get(old).is_some() {
                    merged.push(stored.get(old)?.clone());
                }
            }
        }
        Ok(merged)
    }
}

//! Commit points.
//!
//! A commit is a `segments_<gen>` file listing the segments of the index in
//! order, with the live-docs generation and deletion count of each, plus a
//! user-data map. It is written under a temporary `pending_segments_<gen>`
//! name, synced together with every file it references, and then renamed.
//! A reader that sees `segments_<gen>` therefore sees a complete commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, XiphosError};
use crate::index::segment::{SegmentCommitInfo, SegmentInfo, from_base36, to_base36};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub const SEGMENTS_PREFIX: &str = "segments_";
pub const PENDING_SEGMENTS_PREFIX: &str = "pending_segments_";

const COMMIT_MAGIC: u32 = 0x5843_4D54; // "XCMT"
const COMMIT_VERSION: u32 = 1;

/// `segments_<gen base36>`
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{}", to_base36(generation))
}

fn pending_file_name(generation: u64) -> String {
    format!("{PENDING_SEGMENTS_PREFIX}{}", to_base36(generation))
}

/// Generation encoded in a `segments_<gen>` file name.
pub fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENTS_PREFIX).and_then(from_base36)
}

/// One published commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPoint {
    pub generation: u64,
    /// Assigned when the index is created; identical across commits.
    pub index_id: Uuid,
    /// Next segment id to hand out.
    pub segment_counter: u64,
    pub segments: Vec<SegmentCommitInfo>,
    pub user_data: BTreeMap<String, String>,
}

impl CommitPoint {
    pub fn file_name(&self) -> String {
        segments_file_name(self.generation)
    }

    pub fn num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    pub fn max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.info.doc_count as u64).sum()
    }

    /// Every file this commit needs, the commit file included.
    pub fn files(&self) -> HashSet<String> {
        let mut files: HashSet<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        files.insert(self.file_name());
        files
    }

    /// Publish this commit.
    ///
    /// `to_sync` lists the not yet synced files it references. They are
    /// synced together with the pending commit file before the rename.
    pub fn write(&self, storage: &dyn Storage, to_sync: &[String]) -> Result<()> {
        let pending = pending_file_name(self.generation);
        let target = self.file_name();
        if storage.file_exists(&target) {
            return Err(XiphosError::index(format!("{target} already exists")));
        }
        // A leftover from an earlier failed attempt at this generation.
        storage.delete_file(&pending)?;

        let mut writer = StructWriter::create(storage, &pending)?;
        writer.write_header(COMMIT_MAGIC, COMMIT_VERSION)?;
        writer.write_raw(self.index_id.as_bytes())?;
        writer.write_u64(self.generation)?;
        writer.write_u64(self.segment_counter)?;
        writer.write_varint(self.segments.len() as u64)?;
        for sci in &self.segments {
            writer.write_u64(sci.info.id)?;
            writer.write_string(&sci.info.name)?;
            writer.write_varint(sci.del_gen)?;
            writer.write_u32(sci.del_count)?;
        }
        writer.write_string_map(&self.user_data)?;
        writer.close()?;

        let mut names = to_sync.to_vec();
        names.push(pending.clone());
        storage.sync(&names)?;
        storage.rename_file(&pending, &target)?;

        debug!(
            generation = self.generation,
            segments = self.segments.len(),
            synced = names.len(),
            "published commit"
        );
        Ok(())
    }

    /// Read `segments_<generation>` and the `.si` of every segment it lists.
    pub fn read(storage: &dyn Storage, generation: u64) -> Result<CommitPoint> {
        let file = segments_file_name(generation);
        let mut reader = StructReader::open(storage, &file)?;
        reader.check_header(COMMIT_MAGIC, COMMIT_VERSION, COMMIT_VERSION)?;
        let id_bytes = reader.read_raw(16)?;
        let index_id = Uuid::from_slice(&id_bytes)
            .map_err(|e| XiphosError::corrupt(&file, format!("bad index id: {e}")))?;
        let stored_generation = reader.read_u64()?;
        let segment_counter = reader.read_u64()?;

        let count = reader.read_len()?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let id = reader.read_u64()?;
            let name = reader.read_string()?;
            let del_gen = reader.read_varint()?;
            let del_count = reader.read_u32()?;
            entries.push((id, name, del_gen, del_count));
        }
        let user_data = reader.read_string_map()?;
        reader.finish()?;

        if stored_generation != generation {
            return Err(XiphosError::corrupt(
                &file,
                format!("file records generation {stored_generation}"),
            ));
        }

        let mut segments = Vec::with_capacity(entries.len());
        for (id, name, del_gen, del_count) in entries {
            let info = SegmentInfo::read(storage, &name)?;
            if info.id != id {
                return Err(XiphosError::corrupt(&name, format!("expected segment id {id}")));
            }
            if del_count > info.doc_count {
                return Err(XiphosError::corrupt(
                    &name,
                    format!("{del_count} deletions in a segment of {} documents", info.doc_count),
                ));
            }
            segments.push(SegmentCommitInfo {
                info: Arc::new(info),
                del_gen,
                del_count,
            });
        }

        Ok(CommitPoint {
            generation,
            index_id,
            segment_counter,
            segments,
            user_data,
        })
    }

    /// Highest generation with a `segments_<gen>` file.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| parse_generation(name))
            .max())
    }

    /// The most recent commit, if the index has one.
    pub fn read_latest(storage: &dyn Storage) -> Result<Option<CommitPoint>> {
        match Self::latest_generation(storage)? {
            Some(generation) => Ok(Some(Self::read(storage, generation)?)),
            None => Ok(None),
        }
    }

    /// Every readable commit on storage, oldest first. Commits that fail to
    /// load are skipped.
    pub fn list_commits(storage: &dyn Storage) -> Result<Vec<CommitPoint>> {
        let mut generations: Vec<u64> = storage
            .list_files()?
            .iter()
            .filter_map(|name| parse_generation(name))
            .collect();
        generations.sort_unstable();

        let mut commits = Vec::with_capacity(generations.len());
        for generation in generations {
            match Self::read(storage, generation) {
                Ok(commit) => commits.push(commit),
                Err(e) => warn!(generation, error = %e, "skipping unreadable commit"),
            }
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::schema::FieldInfos;
    use crate::storage::memory::MemoryStorage;

    fn segment(storage: &MemoryStorage, id: u64, docs: u32) -> SegmentCommitInfo {
        let mut info = SegmentInfo {
            id,
            name: crate::index::segment::segment_name(id),
            codec: "binary".into(),
            doc_count: docs,
            fields: FieldInfos::new(),
            files: Vec::new(),
            diagnostics: BTreeMap::new(),
        };
        info.write(storage).unwrap();
        SegmentCommitInfo::new(Arc::new(info))
    }

    #[test]
    fn test_write_read_latest() {
        let storage = MemoryStorage::new_default();
        assert!(CommitPoint::read_latest(&storage).unwrap().is_none());

        let mut commit = CommitPoint {
            generation: 1,
            index_id: Uuid::new_v4(),
            segment_counter: 2,
            segments: vec![segment(&storage, 0, 3), segment(&storage, 1, 5)],
            user_data: BTreeMap::from([("k".to_string(), "v".to_string())]),
        };
        commit.segments[1].del_gen = 1;
        commit.segments[1].del_count = 2;
        commit.write(&storage, &[]).unwrap();
        assert!(storage.file_exists("segments_1"));
        assert!(!storage.file_exists("pending_segments_1"));

        commit.generation = 2;
        commit.user_data.clear();
        commit.write(&storage, &[]).unwrap();

        let latest = CommitPoint::read_latest(&storage).unwrap().unwrap();
        assert_eq!(latest, commit);
        assert_eq!(latest.num_docs(), 6);
        assert_eq!(latest.max_doc(), 8);
        assert!(latest.files().contains("_1_1.liv"));
        assert_eq!(CommitPoint::list_commits(&storage).unwrap().len(), 2);
    }

    #[test]
    fn test_existing_generation_is_not_overwritten() {
        let storage = MemoryStorage::new_default();
        let commit = CommitPoint {
            generation: 1,
            index_id: Uuid::new_v4(),
            segment_counter: 0,
            segments: Vec::new(),
            user_data: BTreeMap::new(),
        };
        commit.write(&storage, &[]).unwrap();
        assert!(commit.write(&storage, &[]).is_err());
    }

    #[test]
    fn test_parse_generation() {
        assert_eq!(parse_generation("segments_a"), Some(10));
        assert_eq!(parse_generation("pending_segments_a"), None);
        assert_eq!(parse_generation("segments_"), None);
    }
}

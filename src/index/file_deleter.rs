//! Reclamation of unreferenced index files.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::Result;
use crate::index::commit::{PENDING_SEGMENTS_PREFIX, SEGMENTS_PREFIX};
use crate::index::directory::Directory;
use crate::index::segment::{belongs_to, parse_segment_file};

pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Whether the engine owns `name`. Foreign files are never deleted.
pub fn is_index_file(name: &str) -> bool {
    name.starts_with(SEGMENTS_PREFIX)
        || name.starts_with(PENDING_SEGMENTS_PREFIX)
        || parse_segment_file(name).is_some()
}

/// Files that must survive a deletion pass.
#[derive(Debug, Default)]
pub struct KeepSet {
    files: HashSet<String>,
    /// Segments still being written; every file they own is kept.
    segments: HashSet<String>,
}

impl KeepSet {
    pub fn new() -> Self {
        KeepSet::default()
    }

    pub fn keep_files<I: IntoIterator<Item = String>>(&mut self, files: I) {
        self.files.extend(files);
    }

    pub fn keep_segment(&mut self, segment: &str) {
        self.segments.insert(segment.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains(name)
            || name == WRITE_LOCK_NAME
            || self.segments.iter().any(|segment| belongs_to(name, segment))
    }
}

/// Deletes index files that are neither kept nor pinned.
#[derive(Debug)]
pub struct FileDeleter<'a> {
    directory: &'a Directory,
}

impl<'a> FileDeleter<'a> {
    pub fn new(directory: &'a Directory) -> Self {
        FileDeleter { directory }
    }

    /// Index files currently eligible for deletion.
    pub fn candidates(&self, keep: &KeepSet) -> Result<Vec<String>> {
        let refs = self.directory.file_refs();
        Ok(self
            .directory
            .storage()
            .list_files()?
            .into_iter()
            .filter(|name| is_index_file(name) && !keep.contains(name) && !refs.is_pinned(name))
            .collect())
    }

    /// Delete `files`. Failures are logged and skipped; the names that
    /// were actually removed are returned.
    pub fn delete(&self, files: Vec<String>) -> Vec<String> {
        let storage = self.directory.storage();
        let refs = self.directory.file_refs();
        let mut deleted = Vec::with_capacity(files.len());
        for name in files {
            // A reader may have pinned it since the candidates were listed.
            if refs.is_pinned(&name) {
                continue;
            }
            match storage.delete_file(&name) {
                Ok(()) => {
                    debug!(file = %name, "deleted unused file");
                    deleted.push(name);
                }
                Err(e) => warn!(file = %name, error = %e, "failed to delete unused file"),
            }
        }
        deleted
    }
}

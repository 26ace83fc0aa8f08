//! The storage handle shared by writers, readers and merges.
//!
//! A [`Directory`] couples a [`Storage`] backend with a [`FileRefs`]
//! registry. Open readers and running merges pin the files they depend on;
//! the file deleter never removes a pinned file. Every component that must
//! see the same pins has to be handed a clone of the same `Directory`.

use std::collections::HashSet;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Reference counts for index files.
#[derive(Debug, Default)]
pub struct FileRefs {
    counts: Mutex<AHashMap<String, usize>>,
}

impl FileRefs {
    pub fn new() -> Self {
        FileRefs::default()
    }

    /// Pin `files` until the returned guard is dropped.
    pub fn pin(self: &Arc<Self>, files: Vec<String>) -> FilePin {
        {
            let mut counts = self.counts.lock();
            for file in &files {
                *counts.entry(file.clone()).or_insert(0) += 1;
            }
        }
        FilePin {
            refs: Arc::clone(self),
            files,
        }
    }

    fn release(&self, files: &[String]) {
        let mut counts = self.counts.lock();
        for file in files {
            if let Some(count) = counts.get_mut(file) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(file);
                }
            }
        }
    }

    /// Whether any guard currently pins `name`.
    pub fn is_pinned(&self, name: &str) -> bool {
        self.counts.lock().contains_key(name)
    }

    /// Reference count of `name`.
    pub fn ref_count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    /// Snapshot of all pinned names.
    pub fn pinned(&self) -> HashSet<String> {
        self.counts.lock().keys().cloned().collect()
    }
}

/// Guard returned by [`FileRefs::pin`].
#[derive(Debug)]
pub struct FilePin {
    refs: Arc<FileRefs>,
    files: Vec<String>,
}

impl FilePin {
    pub fn files(&self) -> &[String] {
        &self.files
    }
}

impl Drop for FilePin {
    fn drop(&mut self) {
        self.refs.release(&self.files);
    }
}

/// Storage plus file reference registry.
#[derive(Debug, Clone)]
pub struct Directory {
    storage: Arc<dyn Storage>,
    refs: Arc<FileRefs>,
}

impl Directory {
    /// Wrap an existing storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Directory {
            storage,
            refs: Arc::new(FileRefs::new()),
        }
    }

    /// Create the backend described by `config`.
    pub fn open(config: StorageConfig) -> Result<Self> {
        Ok(Directory::new(StorageFactory::create(config)?))
    }

    /// A fresh in-memory directory.
    pub fn in_memory() -> Self {
        Directory::new(Arc::new(crate::storage::memory::MemoryStorage::new_default()))
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn storage_arc(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn file_refs(&self) -> &Arc<FileRefs> {
        &self.refs
    }

    /// Pin `files` for as long as the guard lives.
    pub fn pin(&self, files: Vec<String>) -> FilePin {
        self.refs.pin(files)
    }

    /// Total size of the named files. Missing files count as zero.
    pub fn size_of(&self, files: &[String]) -> u64 {
        files
            .iter()
            .filter_map(|name| self.storage.file_size(name).ok())
            .sum()
    }
}

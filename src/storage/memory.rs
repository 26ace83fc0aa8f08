//! In-memory storage implementation for testing and caching.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration specific to memory-based storage.
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryFiles {
    /// Published files.
    files: HashMap<String, Arc<[u8]>>,
    /// Names reserved by an output that has not been closed yet.
    pending: HashSet<String>,
    /// Files whose current content survived a `sync`.
    synced: HashSet<String>,
    /// Held locks.
    locks: HashSet<String>,
}

/// An in-memory storage implementation.
///
/// Outputs become visible when they are closed. The storage also tracks which
/// files have been synced, so [`MemoryStorage::crash`] can simulate losing
/// everything that was never made durable.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryFiles>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        let state = MemoryFiles {
            files: HashMap::with_capacity(config.initial_capacity),
            ..Default::default()
        };
        MemoryStorage {
            state: Arc::new(Mutex::new(state)),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        let state = self.state.lock();
        state.files.values().map(|data| data.len() as u64).sum()
    }

    /// Drop every file that was not synced, and all held locks.
    ///
    /// Models a process crash followed by a restart on the same storage.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        let MemoryFiles {
            files,
            pending,
            synced,
            locks,
        } = &mut *state;
        files.retain(|name, _| synced.contains(name));
        pending.clear();
        locks.clear();
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let state = self.state.lock();
        let data = state
            .files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let mut state = self.state.lock();
        if state.files.contains_key(name) || state.pending.contains(name) {
            return Err(StorageError::FileExists(name.to_string()).into());
        }
        state.pending.insert(name.to_string());

        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.state),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        self.state.lock().files.contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        state.files.remove(name);
        state.synced.remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let state = self.state.lock();
        let mut file_names: Vec<String> = state.files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let state = self.state.lock();
        let data = state
            .files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        let data = state
            .files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        let was_synced = state.synced.remove(old_name);

        state.files.insert(new_name.to_string(), data);
        if was_synced {
            state.synced.insert(new_name.to_string());
        } else {
            state.synced.remove(new_name);
        }
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        for name in names {
            if !state.files.contains_key(name) {
                return Err(StorageError::FileNotFound(name.clone()).into());
            }
            state.synced.insert(name.clone());
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let mut state = self.state.lock();
        if !state.locks.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            released: false,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// An in-memory input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<MemoryFiles>>,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, state: Arc<Mutex<MemoryFiles>>) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            state,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("output is closed"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer).into_boxed_slice());
        let mut state = self.state.lock();
        state.pending.remove(&self.name);
        state.files.insert(self.name.clone(), data);
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        if !self.closed {
            self.state.lock().pending.remove(&self.name);
        }
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    state: Arc<Mutex<MemoryFiles>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.state.lock().locks.remove(&self.name);
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.state.lock().locks.contains(&self.name)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.state.lock().locks.remove(&self.name);
        }
    }
}

//! File-based storage implementation.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, XiphosError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Outputs are written under `<name>.partial` and renamed on close.
const PARTIAL_SUFFIX: &str = ".partial";

/// Configuration specific to file-based storage.
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Directory holding the index files.
    pub path: PathBuf,

    /// Buffer size for file I/O operations in bytes.
    pub buffer_size: usize,

    /// Fsync the directory after `sync` and `rename_file`.
    pub sync_directory: bool,
}

impl FileStorageConfig {
    /// Create a new FileStorageConfig with the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_directory: true,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
    /// Lock names held by this process.
    held_locks: Arc<Mutex<HashSet<String>>>,
    /// Outputs created but not yet closed.
    pending: Arc<Mutex<HashSet<String>>>,
    /// Whether the storage is closed.
    closed: AtomicBool,
}

impl FileStorage {
    /// Create a new file storage, creating the directory if needed.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| XiphosError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(XiphosError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            held_locks: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// The root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn sync_dir(&self) -> Result<()> {
        if !self.config.sync_directory {
            return Ok(());
        }
        // Directories cannot be opened for fsync on every platform.
        #[cfg(unix)]
        {
            File::open(&self.directory)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| StorageError::IoError(format!("Failed to sync directory: {e}")))?;
        }
        Ok(())
    }
}

fn not_found_or_io(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(e.to_string())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let file = File::open(self.file_path(name)).map_err(|e| not_found_or_io(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let mut pending = self.pending.lock();
        if pending.contains(name) || path.exists() {
            return Err(StorageError::FileExists(name.to_string()).into());
        }

        // A leftover partial file is never visible; overwrite it.
        let partial_path = self.file_path(&format!("{name}{PARTIAL_SUFFIX}"));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial_path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        pending.insert(name.to_string());

        Ok(Box::new(FileOutput {
            name: name.to_string(),
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            partial_path,
            path,
            pending: Arc::clone(&self.pending),
            position: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(StorageError::IoError(format!("Failed to delete file {name}: {e}")).into())
            }
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut files = Vec::new();

        for entry in
            std::fs::read_dir(&self.directory).map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if !name.ends_with(PARTIAL_SUFFIX) {
                        files.push(name.to_string());
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| not_found_or_io(name, e))?;

        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| StorageError::IoError(format!("Failed to rename file: {e}")))?;

        self.sync_dir()
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.check_closed()?;

        for name in names {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.file_path(name))
                .map_err(|e| not_found_or_io(name, e))?;
            file.sync_all()
                .map_err(|e| StorageError::IoError(format!("Failed to sync {name}: {e}")))?;
        }

        self.sync_dir()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let mut held = self.held_locks.lock();
        if held.contains(name) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::LockFailed(name.to_string())
                } else {
                    StorageError::IoError(e.to_string())
                }
            })?;

        held.insert(name.to_string());

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            _file: Some(file),
            held_locks: Arc::clone(&self.held_locks),
            released: false,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| XiphosError::storage(format!("Failed to get file metadata: {e}")))?;

        Ok(FileInput {
            size: metadata.len(),
            reader: BufReader::with_capacity(buffer_size, file),
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file output. Content lives in a partial file until `close` renames it
/// to its final name.
#[derive(Debug)]
pub struct FileOutput {
    name: String,
    writer: Option<BufWriter<File>>,
    partial_path: PathBuf,
    path: PathBuf,
    pending: Arc<Mutex<HashSet<String>>>,
    position: u64,
}

impl FileOutput {
    fn closed_error() -> std::io::Error {
        std::io::Error::other("output already closed")
    }

    fn publish(&self, writer: BufWriter<File>) -> Result<()> {
        let file = writer
            .into_inner()
            .map_err(|e| XiphosError::storage(format!("Failed to flush {}: {e}", self.name)))?;
        file.sync_data()
            .map_err(|e| XiphosError::storage(format!("Failed to sync {}: {e}", self.name)))?;
        drop(file);
        if self.path.exists() {
            return Err(StorageError::FileExists(self.name.clone()).into());
        }
        std::fs::rename(&self.partial_path, &self.path)
            .map_err(|e| XiphosError::storage(format!("Failed to publish {}: {e}", self.name)))
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self.writer.as_mut().ok_or_else(Self::closed_error)?;
        let bytes_written = writer.write(buf)?;
        self.position += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer
            .as_mut()
            .ok_or_else(Self::closed_error)?
            .flush()
    }
}

impl StorageOutput for FileOutput {
    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let published = self.publish(writer);
        if published.is_err() {
            let _ = std::fs::remove_file(&self.partial_path);
        }
        self.pending.lock().remove(&self.name);
        published
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        // Dropped without close: the content is discarded.
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.partial_path);
            self.pending.lock().remove(&self.name);
        }
    }
}

/// A lock backed by an exclusively created file.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    _file: Option<File>,
    held_locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self._file = None;
        self.held_locks.lock().remove(&self.name);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(XiphosError::storage(format!("Failed to release lock: {e}"))),
        }
    }

    fn is_valid(&self) -> bool {
        !self.released && self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(lock = %self.name, error = %e, "failed to release lock on drop");
        }
    }
}

//! Storage abstraction layer for Xiphos.
//!
//! Every index component talks to named byte streams through the [`Storage`]
//! trait, so the on-disk and in-memory backends are interchangeable.
//!
//! # Contract
//!
//! - `create_output` is exclusive: it fails if the name already exists. Index
//!   files are write-once; a name is never reused for different content.
//! - `rename_file` atomically replaces the target. Commit points are published
//!   by writing a temporary file and renaming it.
//! - `sync` is the durability barrier. Nothing is durable before it returns.
//! - `obtain_lock` grants an exclusive lease on a name until the returned
//!   guard is released or dropped.
//!
//! # Example
//!
//! ```
//! use xiphos::storage::{StorageFactory, StorageConfig};
//! use xiphos::storage::memory::MemoryStorageConfig;
//! use std::io::Write;
//!
//! # fn main() -> xiphos::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//!
//! let mut output = storage.create_output("_0.si")?;
//! output.write_all(b"segment info")?;
//! output.close()?;
//!
//! storage.sync(&["_0.si".to_string()])?;
//! assert!(storage.file_exists("_0.si"));
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{Result, XiphosError};

pub mod file;
pub mod memory;
pub mod structured;

/// A trait for storage backends that can store and retrieve named files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a new file for writing.
    ///
    /// Fails with [`StorageError::FileExists`] if the name is already taken.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Obtain an exclusive lock with the given name.
    ///
    /// Fails with [`XiphosError::LockContention`] if the lock is already held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Close the storage. Later operations fail.
    fn close(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush buffered data and publish the file.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn position(&self) -> u64 {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// An exclusive lock on a storage location.
pub trait StorageLock: Send + Sync + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let storage = file::FileStorage::new(file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// File already exists.
    FileExists(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Storage is closed.
    StorageClosed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::FileExists(name) => write!(f, "File already exists: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for XiphosError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockFailed(name) => XiphosError::locked(name),
            other => XiphosError::storage(other.to_string()),
        }
    }
}

//! In-memory storage implementation for testing and staging.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{Storage, StorageConfig, StorageError, StorageInput, StorageOutput};

/// An in-memory storage implementation.
///
/// Useful for tests and for staging merge output before it is flushed to a
/// real directory. Finalized files are stored as `Arc<[u8]>` so inputs are
/// cheap clones of the same buffer.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
    /// Storage configuration.
    #[allow(dead_code)]
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Vec::new(),
            Arc::clone(&self.files),
        )))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let existing = self
            .files
            .lock()
            .get(name)
            .map(|data| data.to_vec())
            .unwrap_or_default();

        let mut output = MemoryOutput::new(name.to_string(), existing, Arc::clone(&self.files));
        output.seek(SeekFrom::End(0))?;
        Ok(Box::new(output))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn rename_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<()> {
        let mut files = self.files.lock();
        let old_dir = format!("{old_prefix}/");
        let moved: Vec<String> = files
            .keys()
            .filter(|name| name.starts_with(&old_dir))
            .cloned()
            .collect();

        for name in moved {
            let data = files.remove(&name).unwrap();
            let new_name = format!("{new_prefix}/{}", &name[old_dir.len()..]);
            files.insert(new_name, data);
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut files = self.files.lock();
        let dir = format!("{prefix}/");
        files.retain(|name, _| !name.starts_with(&dir));
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Read side of a memory file. Shares the finalized buffer with the store.
#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write side of a memory file. Content becomes visible on flush or close.
#[derive(Debug)]
struct MemoryOutput {
    name: String,
    cursor: Cursor<Vec<u8>>,
    files: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryOutput {
    fn new(name: String, data: Vec<u8>, files: Arc<Mutex<HashMap<String, Arc<[u8]>>>>) -> Self {
        MemoryOutput {
            name,
            cursor: Cursor::new(data),
            files,
        }
    }

    fn commit(&mut self) {
        let data: Arc<[u8]> = Arc::from(self.cursor.get_ref().as_slice());
        self.files.lock().insert(self.name.clone(), data);
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn close(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.commit();
    }
}

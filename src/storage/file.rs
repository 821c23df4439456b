//! File-system storage implementation.
//!
//! Production backend. Nested names map to real sub-directories under the
//! storage root; `use_mmap` serves inputs with a shared memory map so readers
//! like the compressed offset table can bind zero-copy to the file contents.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::error::{FalcataError, Result};
use crate::storage::traits::{Storage, StorageConfig, StorageError, StorageInput, StorageOutput};

/// A file-based storage implementation rooted at one directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| FalcataError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(FalcataError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn collect_files(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir).map_err(|e| StorageError::IoError(e.to_string()))? {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let full = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };

            if path.is_dir() {
                self.collect_files(&path, &full, out)?;
            } else {
                out.push(full);
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;

        let mmap = if self.config.use_mmap && file.metadata().map(|m| m.len() > 0).unwrap_or(false)
        {
            let map = unsafe {
                MmapOptions::new()
                    .map(&file)
                    .map_err(|e| FalcataError::storage(format!("Failed to mmap {name}: {e}")))?
            };
            Some(Arc::new(map))
        } else {
            None
        };

        Ok(Box::new(FileInput::new(file, self.config.buffer_size, mmap)))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            0,
            self.config.sync_writes,
        )))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        let existing_len = file
            .metadata()
            .map_err(|e| StorageError::IoError(e.to_string()))?
            .len();

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            existing_len,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        self.collect_files(&self.directory.clone(), "", &mut files)?;
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.file_path(name);
        let metadata = path.metadata().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let new_path = self.file_path(new_name);
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }

        std::fs::rename(self.file_path(old_name), new_path)
            .map_err(|e| StorageError::IoError(format!("Failed to rename file: {e}")))?;
        Ok(())
    }

    fn rename_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<()> {
        let old_path = self.file_path(old_prefix);
        if !old_path.is_dir() {
            return Ok(());
        }

        std::fs::rename(old_path, self.file_path(new_prefix))
            .map_err(|e| StorageError::IoError(format!("Failed to rename directory: {e}")))?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.file_path(prefix);
        if path.is_dir() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete directory: {e}")))?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        // Outputs sync themselves on close; directory-level fsync is left to
        // the caller's platform conventions.
        Ok(())
    }
}

/// Buffered reader over one file, optionally carrying a shared memory map.
#[derive(Debug)]
struct FileInput {
    reader: BufReader<File>,
    size: u64,
    mmap: Option<Arc<Mmap>>,
}

impl FileInput {
    fn new(file: File, buffer_size: usize, mmap: Option<Arc<Mmap>>) -> Self {
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            mmap,
        }
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn mmap(&self) -> Option<Arc<Mmap>> {
        self.mmap.as_ref().map(Arc::clone)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Buffered writer over one file.
#[derive(Debug)]
struct FileOutput {
    writer: BufWriter<File>,
    // Tracked here because `position` takes `&self` and cannot seek the writer.
    position: u64,
    sync_writes: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, position: u64, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            position,
            sync_writes,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.position += written as u64;
        if self.sync_writes {
            self.writer.flush()?;
            self.writer.get_ref().sync_data()?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.writer.seek(pos)?;
        Ok(self.position)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();

        let mut output = storage.create_output("segment_1/attr_0/data").unwrap();
        output.write_all(b"payload").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("segment_1/attr_0/data").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");

        let files = storage.list_files().unwrap();
        assert_eq!(files, vec!["segment_1/attr_0/data".to_string()]);
    }

    #[test]
    fn test_output_position_tracks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();

        let mut output = storage.create_output("oplog").unwrap();
        assert_eq!(output.position().unwrap(), 0);
        output.write_all(b"first").unwrap();
        assert_eq!(output.position().unwrap(), 5);
        output.close().unwrap();

        // Appending resumes at the existing file length, buffered bytes included.
        let mut output = storage.create_output_append("oplog").unwrap();
        assert_eq!(output.position().unwrap(), 5);
        output.write_all(b"-second").unwrap();
        assert_eq!(output.position().unwrap(), 12);
        output.close().unwrap();

        assert_eq!(storage.file_size("oplog").unwrap(), 12);
    }

    #[test]
    fn test_mmap_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            use_mmap: true,
            ..Default::default()
        };
        let storage = FileStorage::new(dir.path(), config).unwrap();

        let mut output = storage.create_output("data").unwrap();
        output.write_all(b"mapped").unwrap();
        output.close().unwrap();

        let input = storage.open_input("data").unwrap();
        let mmap = input.mmap().expect("mmap-backed input");
        assert_eq!(&mmap[..], b"mapped");
    }

    #[test]
    fn test_prefix_rename_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();

        let mut output = storage.create_output("segment_3.tmp/attr_0/data").unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();

        storage.rename_prefix("segment_3.tmp", "segment_3").unwrap();
        assert!(storage.file_exists("segment_3/attr_0/data"));
        assert!(!storage.file_exists("segment_3.tmp/attr_0/data"));

        storage.delete_prefix("segment_3").unwrap();
        assert!(!storage.file_exists("segment_3/attr_0/data"));
    }
}

//! Structured file I/O for binary data serialization.
//!
//! Fixed-width little-endian primitives plus varints and length-prefixed
//! byte runs, with a running CRC32 so log and patch files can be verified
//! after append-only writes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FalcataError, Result};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint;

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    checksum: crc32fast::Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            checksum: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.checksum.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a u128 value (little-endian).
    pub fn write_u128(&mut self, value: u128) -> Result<()> {
        self.writer.write_u128::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 16;
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = varint::encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.checksum.update(&encoded);
        self.position += encoded.len() as u64;
        Ok(())
    }

    /// Write raw bytes with a varint length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.writer.write_all(value)?;
        self.checksum.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a string with a varint length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.checksum.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Get the current position in the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get the running checksum of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.checksum.clone().finalize()
    }

    /// Append the running checksum as a fixed-width trailer.
    pub fn write_checksum_trailer(&mut self) -> Result<()> {
        let sum = self.checksum();
        self.writer.write_u32::<LittleEndian>(sum)?;
        self.position += 4;
        Ok(())
    }

    /// Flush everything and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush_and_sync()?;
        self.writer.close()
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    checksum: crc32fast::Hasher,
    position: u64,
    size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let size = reader.size()?;
        Ok(StructReader {
            reader,
            checksum: crc32fast::Hasher::new(),
            position: 0,
            size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.checksum.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a u128 value (little-endian).
    pub fn read_u128(&mut self) -> Result<u128> {
        let value = self.reader.read_u128::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 16;
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let value = varint::read_u64(&mut self.reader)?;
        let encoded = varint::encode_u64(value);
        self.checksum.update(&encoded);
        self.position += encoded.len() as u64;
        Ok(value)
    }

    /// Read length-prefixed bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        self.read_raw(len)
    }

    /// Read a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| FalcataError::serialization(format!("Invalid UTF-8 string: {e}")))
    }

    /// Read exactly `length` raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.reader.read_exact(&mut buf)?;
        self.checksum.update(&buf);
        self.position += length as u64;
        Ok(buf)
    }

    /// Get the current position in the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get the total size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check whether the reader is at end of data.
    pub fn is_eof(&self) -> bool {
        self.position >= self.size
    }

    /// Get the running checksum of everything read so far.
    pub fn checksum(&self) -> u32 {
        self.checksum.clone().finalize()
    }

    /// Read a checksum trailer and compare it against the running checksum
    /// of everything read before it.
    pub fn verify_checksum_trailer(&mut self) -> Result<()> {
        let expected = self.checksum();
        let stored = self.reader.read_u32::<LittleEndian>()?;
        self.position += 4;

        if stored != expected {
            return Err(FalcataError::corruption(format!(
                "Checksum mismatch: stored {stored:#010x}, computed {expected:#010x}"
            )));
        }
        Ok(())
    }
}

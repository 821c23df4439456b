//! Bitmap-based logical deletion per segment.
//!
//! Deletions never touch sealed segment data; they accumulate in a side
//! bitmap that merge planning reads for delete counts and the reclaim map
//! consults to drop dead documents.

use bit_vec::BitVec;

use crate::error::{FalcataError, Result};
use crate::segment::{LocalDocId, SegmentId, segment_dir_name};
use crate::storage::{Storage, StructReader, StructWriter};

/// A bitmap of deleted documents for one segment.
#[derive(Debug, Clone)]
pub struct DeletionBitmap {
    /// Segment this bitmap belongs to.
    pub segment_id: SegmentId,

    /// Bit set = document deleted.
    deleted_docs: BitVec,

    /// Total number of documents in the segment.
    total_docs: u32,

    /// Number of deleted documents.
    deleted_count: u32,
}

impl DeletionBitmap {
    /// Create an empty bitmap for a segment.
    pub fn new(segment_id: SegmentId, total_docs: u32) -> Self {
        DeletionBitmap {
            segment_id,
            deleted_docs: BitVec::from_elem(total_docs as usize, false),
            total_docs,
            deleted_count: 0,
        }
    }

    /// Mark a document as deleted. Returns whether the document was live.
    pub fn delete_document(&mut self, doc_id: LocalDocId) -> Result<bool> {
        if doc_id >= self.total_docs {
            return Err(FalcataError::index(format!(
                "Document id {doc_id} out of range for segment {}",
                self.segment_id
            )));
        }

        let was_deleted = self.deleted_docs.get(doc_id as usize).unwrap_or(false);
        if !was_deleted {
            self.deleted_docs.set(doc_id as usize, true);
            self.deleted_count += 1;
        }
        Ok(!was_deleted)
    }

    /// Check if a document is deleted. Out-of-range ids read as live.
    pub fn is_deleted(&self, doc_id: LocalDocId) -> bool {
        if doc_id >= self.total_docs {
            return false;
        }
        self.deleted_docs.get(doc_id as usize).unwrap_or(false)
    }

    /// Number of deleted documents.
    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    /// Number of live documents.
    pub fn live_count(&self) -> u32 {
        self.total_docs - self.deleted_count
    }

    /// Total documents covered.
    pub fn total_docs(&self) -> u32 {
        self.total_docs
    }

    /// File name this bitmap persists under.
    fn file_path(segment_id: SegmentId) -> String {
        format!("{}/deletion.bitmap", segment_dir_name(segment_id))
    }

    /// Persist the bitmap.
    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        let output = storage.create_output(&Self::file_path(self.segment_id))?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(self.total_docs)?;
        writer.write_u32(self.deleted_count)?;
        writer.write_bytes(&self.deleted_docs.to_bytes())?;
        writer.write_checksum_trailer()?;
        writer.close()
    }

    /// Load a segment's bitmap, or an empty one when none was ever dumped.
    pub fn load(storage: &dyn Storage, segment_id: SegmentId, total_docs: u32) -> Result<Self> {
        let path = Self::file_path(segment_id);
        if !storage.file_exists(&path) {
            return Ok(Self::new(segment_id, total_docs));
        }

        let input = storage.open_input(&path)?;
        let mut reader = StructReader::new(input)?;

        let stored_total = reader.read_u32()?;
        let deleted_count = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        reader.verify_checksum_trailer()?;

        if stored_total != total_docs {
            return Err(FalcataError::corruption(format!(
                "Deletion bitmap of segment {segment_id} covers {stored_total} docs, \
                 segment declares {total_docs}"
            )));
        }

        let mut deleted_docs = BitVec::from_bytes(&bytes);
        deleted_docs.truncate(total_docs as usize);

        Ok(DeletionBitmap {
            segment_id,
            deleted_docs,
            total_docs,
            deleted_count,
        })
    }
}

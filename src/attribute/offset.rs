//! Equivalence-compressed per-document offset tables.
//!
//! Variable-length attribute data is addressed through a per-document offset
//! table. Consecutive documents sharing an offset collapse into one run, so a
//! sparsely-updated attribute costs far less than `doc_count * 8` bytes.
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! item_count: u32
//! run_count:  u32
//! run start doc ids: run_count x u32
//! run values:        run_count x (u32 | u64)
//! magic tail: u32        // selects the item width, so the reader
//!                        // self-describes its own word size
//! ```
//!
//! Post-build updates go through an append-only expand-slice file overlaying
//! individual documents; the compressed table itself is never rewritten in
//! place.

use std::sync::Arc;

use ahash::AHashMap;
use memmap2::Mmap;

use crate::error::{FalcataError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput, StructReader, StructWriter};

/// Tail magic for 32-bit offset items.
pub const OFFSET_TAIL_MAGIC_U32: u32 = 0x0F0F_3232;

/// Tail magic for 64-bit offset items.
pub const OFFSET_TAIL_MAGIC_U64: u32 = 0x0F0F_6464;

/// Item width of an offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetWidth {
    /// 4-byte items.
    U32,
    /// 8-byte items.
    U64,
}

impl OffsetWidth {
    fn byte_len(self) -> usize {
        match self {
            OffsetWidth::U32 => 4,
            OffsetWidth::U64 => 8,
        }
    }
}

/// Write an offset table with run compression.
///
/// The 32-bit layout is chosen automatically when every offset fits.
pub fn write_offsets<W: StorageOutput>(offsets: &[u64], output: W) -> Result<()> {
    let width = if offsets.iter().all(|&off| off <= u32::MAX as u64) {
        OffsetWidth::U32
    } else {
        OffsetWidth::U64
    };

    let mut run_starts: Vec<u32> = Vec::new();
    let mut run_values: Vec<u64> = Vec::new();
    for (doc, &off) in offsets.iter().enumerate() {
        if run_values.last() != Some(&off) {
            run_starts.push(doc as u32);
            run_values.push(off);
        }
    }

    let mut writer = StructWriter::new(output);
    writer.write_u32(offsets.len() as u32)?;
    writer.write_u32(run_starts.len() as u32)?;
    for &start in &run_starts {
        writer.write_u32(start)?;
    }
    for &value in &run_values {
        match width {
            OffsetWidth::U32 => writer.write_u32(value as u32)?,
            OffsetWidth::U64 => writer.write_u64(value)?,
        }
    }
    writer.write_u32(match width {
        OffsetWidth::U32 => OFFSET_TAIL_MAGIC_U32,
        OffsetWidth::U64 => OFFSET_TAIL_MAGIC_U64,
    })?;
    writer.close()
}

/// Raw table bytes: owned, or a zero-copy session over a mapped file.
#[derive(Debug)]
enum OffsetData {
    Owned(Vec<u8>),
    Mapped(Arc<Mmap>),
}

impl OffsetData {
    fn as_slice(&self) -> &[u8] {
        match self {
            OffsetData::Owned(data) => data,
            OffsetData::Mapped(mmap) => &mmap[..],
        }
    }
}

/// Append-only expand-slice file carrying post-build offset updates.
struct ExpandAppender {
    output: Box<dyn StorageOutput>,
}

impl std::fmt::Debug for ExpandAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpandAppender").finish()
    }
}

/// Reader over one compressed offset table.
///
/// Width-self-describing via the magic tail; fatal if the decoded item count
/// does not match the segment's declared doc count or the tail matches
/// neither known magic.
#[derive(Debug)]
pub struct CompressedOffsetReader {
    doc_count: u32,
    width: OffsetWidth,
    data: OffsetData,
    run_count: usize,
    /// Byte position of the run start-doc array within `data`.
    starts_pos: usize,
    /// Byte position of the run value array within `data`.
    values_pos: usize,
    /// Post-build per-document overrides from the expand-slice file.
    overlay: AHashMap<u32, u64>,
    expand: Option<ExpandAppender>,
}

impl CompressedOffsetReader {
    /// Open an offset table.
    ///
    /// `expand_slice` optionally attaches the append-only expand file; its
    /// records are replayed into the overlay and later [`set_offset`] calls
    /// append to it.
    ///
    /// [`set_offset`]: CompressedOffsetReader::set_offset
    pub fn init(
        doc_count: u32,
        input: Box<dyn StorageInput>,
        expand_slice: Option<(&dyn Storage, &str)>,
    ) -> Result<Self> {
        let data = match input.mmap() {
            Some(mmap) => OffsetData::Mapped(mmap),
            None => {
                let mut input = input;
                let mut buf = Vec::new();
                std::io::Read::read_to_end(&mut input, &mut buf)?;
                OffsetData::Owned(buf)
            }
        };

        let bytes = data.as_slice();
        if bytes.len() < 12 {
            return Err(FalcataError::corruption(format!(
                "Offset table too small: {} bytes",
                bytes.len()
            )));
        }

        let tail = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        let width = match tail {
            OFFSET_TAIL_MAGIC_U32 => OffsetWidth::U32,
            OFFSET_TAIL_MAGIC_U64 => OffsetWidth::U64,
            other => {
                return Err(FalcataError::corruption(format!(
                    "Unknown offset table magic tail {other:#010x}"
                )));
            }
        };

        let item_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let run_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;

        let starts_pos = 8;
        let values_pos = starts_pos + run_count * 4;
        let expected_len = values_pos + run_count * width.byte_len() + 4;
        if bytes.len() != expected_len {
            return Err(FalcataError::corruption(format!(
                "Offset table length {} does not match header (expected {expected_len})",
                bytes.len()
            )));
        }

        if item_count != doc_count {
            return Err(FalcataError::corruption(format!(
                "Offset table holds {item_count} items, segment declares {doc_count} docs"
            )));
        }
        if doc_count > 0 && run_count == 0 {
            return Err(FalcataError::corruption(
                "Offset table declares documents but no runs",
            ));
        }

        // The run lookup assumes start docs begin at 0 and strictly increase.
        let mut prev_start = 0u32;
        for idx in 0..run_count {
            let pos = starts_pos + idx * 4;
            let start = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            if idx == 0 && start != 0 {
                return Err(FalcataError::corruption(format!(
                    "Offset table first run starts at doc {start}, expected 0"
                )));
            }
            if idx > 0 && start <= prev_start {
                return Err(FalcataError::corruption(format!(
                    "Offset table run starts not strictly increasing at run {idx}"
                )));
            }
            if start >= item_count {
                return Err(FalcataError::corruption(format!(
                    "Offset table run {idx} starts at doc {start} beyond item count {item_count}"
                )));
            }
            prev_start = start;
        }

        let mut reader = CompressedOffsetReader {
            doc_count,
            width,
            data,
            run_count,
            starts_pos,
            values_pos,
            overlay: AHashMap::new(),
            expand: None,
        };

        if let Some((storage, expand_path)) = expand_slice {
            reader.attach_expand_slice(storage, expand_path)?;
        }

        Ok(reader)
    }

    fn attach_expand_slice(&mut self, storage: &dyn Storage, path: &str) -> Result<()> {
        if storage.file_exists(path) {
            let input = storage.open_input(path)?;
            let mut reader = StructReader::new(input)?;
            while !reader.is_eof() {
                let doc = reader.read_u32()?;
                let offset = reader.read_u64()?;
                if doc >= self.doc_count {
                    return Err(FalcataError::corruption(format!(
                        "Expand slice entry for doc {doc} beyond doc count {}",
                        self.doc_count
                    )));
                }
                self.overlay.insert(doc, offset);
            }
        }

        self.expand = Some(ExpandAppender {
            output: storage.create_output_append(path)?,
        });
        Ok(())
    }

    fn run_start(&self, idx: usize) -> u32 {
        let pos = self.starts_pos + idx * 4;
        u32::from_le_bytes(self.data.as_slice()[pos..pos + 4].try_into().unwrap())
    }

    fn run_value(&self, idx: usize) -> u64 {
        let bytes = self.data.as_slice();
        match self.width {
            OffsetWidth::U32 => {
                let pos = self.values_pos + idx * 4;
                u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as u64
            }
            OffsetWidth::U64 => {
                let pos = self.values_pos + idx * 8;
                u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap())
            }
        }
    }

    /// Item width decoded from the magic tail.
    pub fn width(&self) -> OffsetWidth {
        self.width
    }

    /// Number of documents covered.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Offset of one document.
    pub fn offset(&self, doc_id: u32) -> Result<u64> {
        if doc_id >= self.doc_count {
            return Err(FalcataError::index(format!(
                "Document id {doc_id} out of range (doc count {})",
                self.doc_count
            )));
        }

        if let Some(&off) = self.overlay.get(&doc_id) {
            return Ok(off);
        }

        // Last run whose start doc is <= doc_id.
        let mut lo = 0usize;
        let mut hi = self.run_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.run_start(mid) <= doc_id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(self.run_value(lo - 1))
    }

    /// All current offsets, overlay applied, in doc order.
    pub fn collect(&self) -> Result<Vec<u64>> {
        (0..self.doc_count).map(|doc| self.offset(doc)).collect()
    }

    /// Record a post-build offset update in the expand-slice file.
    ///
    /// Requires an attached expand slice; builds without one are immutable.
    pub fn set_offset(&mut self, doc_id: u32, offset: u64) -> Result<()> {
        if doc_id >= self.doc_count {
            return Err(FalcataError::index(format!(
                "Document id {doc_id} out of range (doc count {})",
                self.doc_count
            )));
        }

        let Some(expand) = self.expand.as_mut() else {
            return Err(FalcataError::invalid_operation(
                "Offset table has no expand slice attached",
            ));
        };

        {
            let mut writer = StructWriter::new(&mut expand.output);
            writer.write_u32(doc_id)?;
            writer.write_u64(offset)?;
        }
        expand.output.flush_and_sync()?;

        self.overlay.insert(doc_id, offset);
        Ok(())
    }
}

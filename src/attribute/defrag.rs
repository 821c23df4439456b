//! Slab allocator and compactor for variable-length attribute values.
//!
//! Values are packed into fixed-length slices with a varint length prefix, so
//! a value's extent is recoverable from its offset alone. Overwrites mark the
//! old extent wasted; once a sealed slice crosses the waste threshold it is
//! defragmented by copying every live value to fresh storage and retargeting
//! the offsets, after which the slice holds no live data and can be released.
//!
//! Ordering contract: defrag moves values through the *current* offset table,
//! so it must only run after all pending patches for the attribute have been
//! flushed into that table.

use ahash::AHashSet;
use parking_lot::Mutex;

use crate::error::{FalcataError, Result};
use crate::util::varint;

/// Configuration for the slice array.
#[derive(Debug, Clone)]
pub struct DefragConfig {
    /// Length of each slice in bytes.
    pub slice_len: usize,

    /// Waste ratio at which a sealed slice becomes defrag-eligible.
    pub defrag_percent_threshold: f64,
}

impl Default for DefragConfig {
    fn default() -> Self {
        DefragConfig {
            slice_len: 64 * 1024,
            defrag_percent_threshold: 0.5,
        }
    }
}

/// Incrementally-updated defrag counters (write-only metrics sink).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragMetrics {
    /// Slices fully reclaimed so far.
    pub reclaimed_slice_count: u64,

    /// Bytes reclaimed through defrag.
    pub reclaimed_bytes: u64,

    /// Bytes currently wasted across all slices.
    pub wasted_bytes: u64,
}

/// View over a document offset table consulted and retargeted during defrag.
///
/// Implemented by in-memory tables during merge and by
/// [`CompressedOffsetReader`](crate::attribute::offset::CompressedOffsetReader)
/// with an expand slice attached for post-build defrag.
pub trait OffsetSource {
    /// Number of documents in the table.
    fn doc_count(&self) -> u32;

    /// Current offset of a document.
    fn offset(&self, doc_id: u32) -> Result<u64>;

    /// Retarget a document to a new offset.
    fn set_offset(&mut self, doc_id: u32, offset: u64) -> Result<()>;
}

impl OffsetSource for Vec<u64> {
    fn doc_count(&self) -> u32 {
        self.len() as u32
    }

    fn offset(&self, doc_id: u32) -> Result<u64> {
        self.get(doc_id as usize)
            .copied()
            .ok_or_else(|| FalcataError::index(format!("Document id {doc_id} out of range")))
    }

    fn set_offset(&mut self, doc_id: u32, offset: u64) -> Result<()> {
        let slot = self
            .get_mut(doc_id as usize)
            .ok_or_else(|| FalcataError::index(format!("Document id {doc_id} out of range")))?;
        *slot = offset;
        Ok(())
    }
}

impl OffsetSource for crate::attribute::offset::CompressedOffsetReader {
    fn doc_count(&self) -> u32 {
        crate::attribute::offset::CompressedOffsetReader::doc_count(self)
    }

    fn offset(&self, doc_id: u32) -> Result<u64> {
        crate::attribute::offset::CompressedOffsetReader::offset(self, doc_id)
    }

    fn set_offset(&mut self, doc_id: u32, offset: u64) -> Result<()> {
        crate::attribute::offset::CompressedOffsetReader::set_offset(self, doc_id, offset)
    }
}

/// One fixed-length allocation unit.
#[derive(Debug)]
struct Slice {
    data: Vec<u8>,
    used: usize,
    wasted: usize,
    /// Set once defrag has relocated every live value out of the slice.
    freed: bool,
}

impl Slice {
    fn new(slice_len: usize) -> Self {
        Slice {
            data: vec![0u8; slice_len],
            used: 0,
            wasted: 0,
            freed: false,
        }
    }
}

/// Slab allocator packing variable-length values into fixed-length slices,
/// with copying defragmentation of high-waste slices.
#[derive(Debug)]
pub struct DefragSliceArray {
    slices: Vec<Slice>,
    slice_len: usize,
    threshold: f64,
    /// Slices whose live data was fully relocated, awaiting release.
    useless_slices: Mutex<Vec<usize>>,
    /// Offsets already freed, so a repeated free cannot inflate the waste.
    freed_offsets: AHashSet<u64>,
    metrics: DefragMetrics,
}

impl DefragSliceArray {
    /// Create an empty slice array.
    pub fn new(config: DefragConfig) -> Self {
        DefragSliceArray {
            slices: vec![Slice::new(config.slice_len)],
            slice_len: config.slice_len,
            threshold: config.defrag_percent_threshold,
            useless_slices: Mutex::new(Vec::new()),
            freed_offsets: AHashSet::new(),
            metrics: DefragMetrics::default(),
        }
    }

    /// Index of the currently-active slice.
    pub fn current_slice(&self) -> usize {
        self.slices.len() - 1
    }

    /// Number of slices, released ones included.
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Wasted bytes of one slice. Zero for indices never allocated.
    pub fn wasted_size(&self, slice_idx: usize) -> usize {
        self.slices.get(slice_idx).map_or(0, |slice| slice.wasted)
    }

    /// Current metric counters.
    pub fn metrics(&self) -> DefragMetrics {
        self.metrics
    }

    fn encoded_entry_len(value_len: usize) -> usize {
        varint::encoded_len(value_len as u64) + value_len
    }

    /// Append a value, returning its global offset.
    pub fn append(&mut self, value: &[u8]) -> Result<u64> {
        let entry_len = Self::encoded_entry_len(value.len());
        if entry_len > self.slice_len {
            return Err(FalcataError::invalid_operation(format!(
                "Value of {} bytes does not fit a {}-byte slice",
                value.len(),
                self.slice_len
            )));
        }

        if self.slice_len - self.slices[self.current_slice()].used < entry_len {
            // Seal the active slice; the tail it cannot fill is waste.
            let idx = self.current_slice();
            let tail = self.slice_len - self.slices[idx].used;
            self.slices[idx].wasted += tail;
            self.slices[idx].used = self.slice_len;
            self.metrics.wasted_bytes += tail as u64;
            self.slices.push(Slice::new(self.slice_len));
        }

        let idx = self.current_slice();
        let in_slice = self.slices[idx].used;
        let header = varint::encode_u64(value.len() as u64);
        let slice = &mut self.slices[idx];
        slice.data[in_slice..in_slice + header.len()].copy_from_slice(&header);
        slice.data[in_slice + header.len()..in_slice + entry_len].copy_from_slice(value);
        slice.used += entry_len;

        Ok((idx * self.slice_len + in_slice) as u64)
    }

    /// Read the value stored at a global offset.
    pub fn get(&self, offset: u64) -> Result<&[u8]> {
        let (idx, in_slice) = self.locate(offset)?;
        let slice = &self.slices[idx];
        if slice.freed {
            return Err(FalcataError::invalid_operation(format!(
                "Offset {offset} points into released slice {idx}"
            )));
        }

        let (len, header) = varint::decode_u64(&slice.data[in_slice..])?;
        let start = in_slice + header;
        let end = start + len as usize;
        if end > slice.data.len() {
            return Err(FalcataError::corruption(format!(
                "Value at offset {offset} overruns its slice"
            )));
        }
        Ok(&slice.data[start..end])
    }

    /// Mark the value at a global offset as wasted (superseded or dropped).
    ///
    /// Freeing an offset twice is rejected; the waste would otherwise be
    /// counted twice and could exceed the slice length.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        let (idx, in_slice) = self.locate(offset)?;
        if self.slices[idx].freed {
            return Err(FalcataError::invalid_operation(format!(
                "Offset {offset} points into released slice {idx}"
            )));
        }
        if !self.freed_offsets.insert(offset) {
            return Err(FalcataError::invalid_operation(format!(
                "Offset {offset} was already freed"
            )));
        }
        let (len, header) = varint::decode_u64(&self.slices[idx].data[in_slice..])?;
        let entry_len = header + len as usize;
        self.slices[idx].wasted += entry_len;
        self.metrics.wasted_bytes += entry_len as u64;
        Ok(())
    }

    /// Whether a slice is worth defragmenting.
    ///
    /// Always false for the active slice and for slices already reclaimed;
    /// otherwise true once the waste ratio reaches the threshold.
    pub fn need_defrag(&self, slice_idx: usize) -> bool {
        let Some(slice) = self.slices.get(slice_idx) else {
            return false;
        };
        if slice_idx == self.current_slice() || slice.freed {
            return false;
        }
        slice.wasted as f64 / self.slice_len as f64 >= self.threshold
    }

    /// Relocate every live value out of `slice_idx` and queue the slice for
    /// release.
    ///
    /// Scans each document's current offset; offsets inside the slice are
    /// moved to fresh storage and retargeted. The slice ends fully wasted.
    pub fn defrag<O: OffsetSource + ?Sized>(
        &mut self,
        slice_idx: usize,
        offsets: &mut O,
    ) -> Result<()> {
        if slice_idx == self.current_slice() {
            return Err(FalcataError::invalid_operation(
                "Cannot defrag the active slice",
            ));
        }
        if self.slices[slice_idx].freed {
            return Err(FalcataError::invalid_operation(format!(
                "Slice {slice_idx} was already reclaimed"
            )));
        }

        let begin = (slice_idx * self.slice_len) as u64;
        let end = begin + self.slice_len as u64;

        for doc_id in 0..offsets.doc_count() {
            let offset = offsets.offset(doc_id)?;
            if offset < begin || offset >= end {
                continue;
            }
            let new_offset = self.move_data(offset)?;
            offsets.set_offset(doc_id, new_offset)?;
        }

        let live = self.slice_len - self.slices[slice_idx].wasted;
        let slice = &mut self.slices[slice_idx];
        slice.wasted = self.slice_len;
        slice.freed = true;
        // The freed-slice check covers this range from now on.
        self.freed_offsets
            .retain(|&off| off < begin || off >= end);

        self.metrics.wasted_bytes += live as u64;
        self.metrics.reclaimed_slice_count += 1;
        self.metrics.reclaimed_bytes += self.slice_len as u64;
        self.useless_slices.lock().push(slice_idx);

        Ok(())
    }

    /// Copy the value at `offset` to fresh storage, returning its new offset.
    fn move_data(&mut self, offset: u64) -> Result<u64> {
        let value = self.get(offset)?.to_vec();
        self.append(&value)
    }

    /// Release the memory of every queued slice. Safe because defrag only
    /// queues a slice after relocating all live offsets out of it.
    pub fn release_useless_slices(&mut self) -> usize {
        let queued: Vec<usize> = self.useless_slices.lock().drain(..).collect();
        let released = queued.len();
        for idx in queued {
            self.slices[idx].data = Vec::new();
        }
        released
    }

    fn locate(&self, offset: u64) -> Result<(usize, usize)> {
        let idx = (offset / self.slice_len as u64) as usize;
        if idx >= self.slices.len() {
            return Err(FalcataError::index(format!(
                "Offset {offset} beyond allocated slices"
            )));
        }
        Ok((idx, (offset % self.slice_len as u64) as usize))
    }
}

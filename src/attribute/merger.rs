//! Attribute storage rewrite during segment merge.
//!
//! Both mergers walk the plan's source segments in reclaim-map order,
//! reconcile pending patch files on the fly, and emit target files addressed
//! by new doc ids. Single-value attributes rewrite one fixed-stride data
//! file; variable-length attributes rewrite the data file and its compressed
//! offset table.

use crate::attribute::offset::{CompressedOffsetReader, write_offsets};
use crate::attribute::updater::{PatchValue, SegmentPatchIterator};
use crate::error::{FalcataError, Result};
use crate::merge::reclaim::ReclaimMap;
use crate::segment::{AttributeId, SegmentId, attr_data_path, attr_expand_path, attr_offset_path};
use crate::storage::{Storage, StructWriter};
use crate::util::varint;

/// One source segment of an attribute merge.
#[derive(Debug, Clone)]
pub struct AttributeSegmentSource {
    /// Segment id, as known to the reclaim map.
    pub segment_id: SegmentId,

    /// Segment directory prefix.
    pub segment_dir: String,

    /// Documents in the segment.
    pub doc_count: u32,

    /// Patch files targeting this segment for the merged attribute,
    /// in originating-segment order. Later patches win.
    pub patch_paths: Vec<String>,
}

impl AttributeSegmentSource {
    fn load_patches(&self, storage: &dyn Storage) -> Result<Vec<SegmentPatchIterator>> {
        self.patch_paths
            .iter()
            .map(|path| SegmentPatchIterator::load(storage, path))
            .collect()
    }
}

/// Latest patch value for a doc, scanning the patch list newest-first.
fn patched_value<'a>(
    patches: &'a mut [SegmentPatchIterator],
    doc_id: u32,
) -> Option<&'a PatchValue> {
    let idx = patches
        .iter_mut()
        .enumerate()
        .rev()
        .find_map(|(idx, patch)| patch.seek(doc_id).map(|_| idx))?;
    patches[idx].seek(doc_id)
}

/// Merger for fixed-stride single-value attributes.
#[derive(Debug)]
pub struct FixedStrideAttributeMerger {
    attr_id: AttributeId,
    stride: usize,
}

impl FixedStrideAttributeMerger {
    /// Create a merger for one attribute of `stride` bytes per document.
    pub fn new(attr_id: AttributeId, stride: usize) -> Self {
        FixedStrideAttributeMerger { attr_id, stride }
    }

    /// Rewrite the attribute into `target_dir` in new-doc-id order.
    /// Returns the number of documents written.
    pub fn merge(
        &self,
        storage: &dyn Storage,
        sources: &[AttributeSegmentSource],
        reclaim: &ReclaimMap,
        target_dir: &str,
    ) -> Result<u32> {
        let new_doc_count = reclaim.new_doc_count() as usize;
        let mut out = vec![0u8; new_doc_count * self.stride];

        for source in sources {
            let data = read_file(storage, &attr_data_path(&source.segment_dir, self.attr_id))?;
            let expected = source.doc_count as usize * self.stride;
            if data.len() != expected {
                return Err(FalcataError::corruption(format!(
                    "Attribute {} data of segment {} is {} bytes, expected {expected}",
                    self.attr_id,
                    source.segment_id,
                    data.len()
                )));
            }

            let mut patches = source.load_patches(storage)?;
            for doc_id in 0..source.doc_count {
                let Some(new_id) = reclaim.get_new_id(source.segment_id, doc_id) else {
                    continue;
                };

                let dst = new_id as usize * self.stride;
                match patched_value(&mut patches, doc_id) {
                    Some(patch) if patch.is_null => {
                        // Null rows are zeroed; `out` starts zeroed.
                    }
                    Some(patch) => {
                        if patch.value.len() != self.stride {
                            return Err(FalcataError::corruption(format!(
                                "Patch value of {} bytes for fixed-stride attribute {} ({})",
                                patch.value.len(),
                                self.attr_id,
                                self.stride
                            )));
                        }
                        out[dst..dst + self.stride].copy_from_slice(&patch.value);
                    }
                    None => {
                        let src = doc_id as usize * self.stride;
                        out[dst..dst + self.stride].copy_from_slice(&data[src..src + self.stride]);
                    }
                }
            }
        }

        let mut output = storage.create_output(&attr_data_path(target_dir, self.attr_id))?;
        std::io::Write::write_all(&mut output, &out)?;
        output.close()?;

        Ok(new_doc_count as u32)
    }
}

/// Merger for variable-length attributes (data file + compressed offsets).
#[derive(Debug)]
pub struct VarLenAttributeMerger {
    attr_id: AttributeId,
}

impl VarLenAttributeMerger {
    /// Create a merger for one variable-length attribute.
    pub fn new(attr_id: AttributeId) -> Self {
        VarLenAttributeMerger { attr_id }
    }

    /// Rewrite data and offset files into `target_dir` in new-doc-id order.
    /// Returns the number of documents written.
    pub fn merge(
        &self,
        storage: &dyn Storage,
        sources: &[AttributeSegmentSource],
        reclaim: &ReclaimMap,
        target_dir: &str,
    ) -> Result<u32> {
        let new_doc_count = reclaim.new_doc_count() as usize;
        let mut new_offsets = vec![0u64; new_doc_count];
        let mut data_writer =
            StructWriter::new(storage.create_output(&attr_data_path(target_dir, self.attr_id))?);

        for source in sources {
            let data = read_file(storage, &attr_data_path(&source.segment_dir, self.attr_id))?;

            let offset_input =
                storage.open_input(&attr_offset_path(&source.segment_dir, self.attr_id))?;
            let expand_path = attr_expand_path(&source.segment_dir, self.attr_id);
            let expand = storage
                .file_exists(&expand_path)
                .then_some((storage, expand_path.as_str()));
            let offsets =
                CompressedOffsetReader::init(source.doc_count, offset_input, expand)?;

            let mut patches = source.load_patches(storage)?;
            for doc_id in 0..source.doc_count {
                let Some(new_id) = reclaim.get_new_id(source.segment_id, doc_id) else {
                    continue;
                };

                new_offsets[new_id as usize] = data_writer.position();
                match patched_value(&mut patches, doc_id) {
                    Some(patch) if patch.is_null => data_writer.write_bytes(&[])?,
                    Some(patch) => data_writer.write_bytes(&patch.value)?,
                    None => {
                        let value = read_var_value(&data, offsets.offset(doc_id)?)?;
                        data_writer.write_bytes(value)?;
                    }
                }
            }
        }

        data_writer.close()?;

        let offset_output = storage.create_output(&attr_offset_path(target_dir, self.attr_id))?;
        write_offsets(&new_offsets, offset_output)?;

        Ok(new_doc_count as u32)
    }
}

fn read_file(storage: &dyn Storage, path: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(path)?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut input, &mut buf)?;
    Ok(buf)
}

/// Decode one varint-length-prefixed value at `offset`.
fn read_var_value(data: &[u8], offset: u64) -> Result<&[u8]> {
    let start = offset as usize;
    if start >= data.len() {
        return Err(FalcataError::corruption(format!(
            "Value offset {offset} beyond data file of {} bytes",
            data.len()
        )));
    }

    let (len, header) = varint::decode_u64(&data[start..])?;
    let begin = start + header;
    let end = begin + len as usize;
    if end > data.len() {
        return Err(FalcataError::corruption(format!(
            "Value at offset {offset} overruns data file"
        )));
    }
    Ok(&data[begin..end])
}

/// Write a var-length attribute segment: values in doc order, plus the
/// compressed offset table. Build-side helper shared by tests and the merge
/// engine's target writing.
pub fn write_var_len_segment(
    storage: &dyn Storage,
    segment_dir: &str,
    attr_id: AttributeId,
    values: &[&[u8]],
) -> Result<()> {
    let mut offsets = Vec::with_capacity(values.len());
    let mut writer = StructWriter::new(storage.create_output(&attr_data_path(segment_dir, attr_id))?);
    for value in values {
        offsets.push(writer.position());
        writer.write_bytes(value)?;
    }
    writer.close()?;

    let offset_output = storage.create_output(&attr_offset_path(segment_dir, attr_id))?;
    write_offsets(&offsets, offset_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::updater::AttributeUpdater;
    use crate::merge::reclaim::SegmentDocSource;
    use crate::segment::DeletionBitmap;
    use crate::storage::MemoryStorage;

    fn write_fixed_segment(
        storage: &dyn Storage,
        segment_dir: &str,
        attr_id: AttributeId,
        rows: &[&[u8]],
    ) {
        let mut output = storage
            .create_output(&attr_data_path(segment_dir, attr_id))
            .unwrap();
        for row in rows {
            std::io::Write::write_all(&mut output, row).unwrap();
        }
        output.close().unwrap();
    }

    fn source(segment_id: SegmentId, doc_count: u32, patches: Vec<String>) -> AttributeSegmentSource {
        AttributeSegmentSource {
            segment_id,
            segment_dir: format!("segment_{segment_id}"),
            doc_count,
            patch_paths: patches,
        }
    }

    #[test]
    fn test_fixed_stride_merge_with_deletes() {
        let storage = MemoryStorage::new_default();
        write_fixed_segment(&storage, "segment_1", 0, &[&[1, 1], &[2, 2], &[3, 3]]);
        write_fixed_segment(&storage, "segment_2", 0, &[&[4, 4]]);

        let mut deleted = DeletionBitmap::new(1, 3);
        deleted.delete_document(1).unwrap();
        let doc_sources = vec![
            SegmentDocSource {
                segment_id: 1,
                doc_count: 3,
                deleted: Some(deleted),
                primary_keys: None,
            },
            SegmentDocSource::plain(2, 1),
        ];
        let reclaim = ReclaimMap::build(&doc_sources).unwrap();

        let merger = FixedStrideAttributeMerger::new(0, 2);
        let sources = vec![source(1, 3, vec![]), source(2, 1, vec![])];
        let written = merger.merge(&storage, &sources, &reclaim, "segment_3.tmp").unwrap();
        assert_eq!(written, 3);

        let mut input = storage.open_input("segment_3.tmp/attr_0/data").unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![1, 1, 3, 3, 4, 4]);
    }

    #[test]
    fn test_fixed_stride_merge_applies_patches() {
        let storage = MemoryStorage::new_default();
        write_fixed_segment(&storage, "segment_1", 0, &[&[1, 1], &[2, 2]]);

        let mut updater = AttributeUpdater::new(0);
        updater.update(1, &[9, 9], false);
        let patch = updater.dump(&storage, "segment_1", 5).unwrap();

        let reclaim = ReclaimMap::build(&[SegmentDocSource::plain(1, 2)]).unwrap();
        let merger = FixedStrideAttributeMerger::new(0, 2);
        let sources = vec![source(1, 2, vec![patch])];
        merger.merge(&storage, &sources, &reclaim, "out").unwrap();

        let mut input = storage.open_input("out/attr_0/data").unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![1, 1, 9, 9]);
    }

    #[test]
    fn test_fixed_stride_later_patch_wins() {
        let storage = MemoryStorage::new_default();
        write_fixed_segment(&storage, "segment_1", 0, &[&[0, 0]]);

        let mut early = AttributeUpdater::new(0);
        early.update(0, &[1, 1], false);
        let early_path = early.dump(&storage, "segment_1", 2).unwrap();

        let mut late = AttributeUpdater::new(0);
        late.update(0, &[2, 2], false);
        let late_path = late.dump(&storage, "segment_1", 3).unwrap();

        let reclaim = ReclaimMap::build(&[SegmentDocSource::plain(1, 1)]).unwrap();
        let merger = FixedStrideAttributeMerger::new(0, 2);
        let sources = vec![source(1, 1, vec![early_path, late_path])];
        merger.merge(&storage, &sources, &reclaim, "out").unwrap();

        let mut input = storage.open_input("out/attr_0/data").unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![2, 2]);
    }

    #[test]
    fn test_fixed_stride_size_mismatch_fatal() {
        let storage = MemoryStorage::new_default();
        write_fixed_segment(&storage, "segment_1", 0, &[&[1, 1]]);

        let reclaim = ReclaimMap::build(&[SegmentDocSource::plain(1, 3)]).unwrap();
        let merger = FixedStrideAttributeMerger::new(0, 2);
        let sources = vec![source(1, 3, vec![])];
        let err = merger.merge(&storage, &sources, &reclaim, "out").unwrap_err();
        assert!(matches!(err, FalcataError::Corruption(_)));
    }

    #[test]
    fn test_var_len_merge_rewrites_offsets() {
        let storage = MemoryStorage::new_default();
        write_var_len_segment(&storage, "segment_1", 0, &[b"alpha", b"beta", b"gamma"]).unwrap();
        write_var_len_segment(&storage, "segment_2", 0, &[b"delta"]).unwrap();

        let mut deleted = DeletionBitmap::new(1, 3);
        deleted.delete_document(0).unwrap();
        let doc_sources = vec![
            SegmentDocSource {
                segment_id: 1,
                doc_count: 3,
                deleted: Some(deleted),
                primary_keys: None,
            },
            SegmentDocSource::plain(2, 1),
        ];
        let reclaim = ReclaimMap::build(&doc_sources).unwrap();

        let merger = VarLenAttributeMerger::new(0);
        let sources = vec![source(1, 3, vec![]), source(2, 1, vec![])];
        let written = merger.merge(&storage, &sources, &reclaim, "out").unwrap();
        assert_eq!(written, 3);

        // Read back through the rewritten offset table.
        let data = {
            let mut input = storage.open_input("out/attr_0/data").unwrap();
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut input, &mut buf).unwrap();
            buf
        };
        let offsets =
            CompressedOffsetReader::init(3, storage.open_input("out/attr_0/offset").unwrap(), None)
                .unwrap();

        let expected: [&[u8]; 3] = [b"beta", b"gamma", b"delta"];
        for (doc, want) in expected.iter().enumerate() {
            let value = read_var_value(&data, offsets.offset(doc as u32).unwrap()).unwrap();
            assert_eq!(&value, want);
        }
    }

    #[test]
    fn test_var_len_merge_applies_patch_and_null() {
        let storage = MemoryStorage::new_default();
        write_var_len_segment(&storage, "segment_1", 0, &[b"one", b"two"]).unwrap();

        let mut updater = AttributeUpdater::new(0);
        updater.update(0, b"patched", false);
        updater.update(1, b"", true);
        let patch = updater.dump(&storage, "segment_1", 4).unwrap();

        let reclaim = ReclaimMap::build(&[SegmentDocSource::plain(1, 2)]).unwrap();
        let merger = VarLenAttributeMerger::new(0);
        let sources = vec![source(1, 2, vec![patch])];
        merger.merge(&storage, &sources, &reclaim, "out").unwrap();

        let data = {
            let mut input = storage.open_input("out/attr_0/data").unwrap();
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut input, &mut buf).unwrap();
            buf
        };
        let offsets =
            CompressedOffsetReader::init(2, storage.open_input("out/attr_0/offset").unwrap(), None)
                .unwrap();
        assert_eq!(
            read_var_value(&data, offsets.offset(0).unwrap()).unwrap(),
            b"patched"
        );
        assert_eq!(read_var_value(&data, offsets.offset(1).unwrap()).unwrap(), b"");
    }
}

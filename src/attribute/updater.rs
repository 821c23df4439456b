//! Buffered per-segment, per-attribute value updates.
//!
//! Updates against sealed segments never touch segment data directly. They
//! buffer in an [`AttributeUpdater`] and flush to small patch files that
//! readers and mergers replay through a [`SegmentPatchIterator`].

use ahash::AHashMap;

use crate::error::Result;
use crate::segment::{AttributeId, LocalDocId, SegmentId, attr_patch_path};
use crate::storage::{Storage, StructReader, StructWriter};

/// One buffered or patched attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchValue {
    /// Serialized field value. Empty for null.
    pub value: Vec<u8>,

    /// Whether the field was set to null.
    pub is_null: bool,
}

/// Buffer of pending updates for one (segment, attribute) pair.
///
/// Later updates to the same document overwrite earlier ones; the dump is
/// sorted by doc id so patch replay and merge consumption stay sequential.
#[derive(Debug)]
pub struct AttributeUpdater {
    attr_id: AttributeId,
    values: AHashMap<LocalDocId, PatchValue>,
}

impl AttributeUpdater {
    /// Create an empty updater for one attribute.
    pub fn new(attr_id: AttributeId) -> Self {
        AttributeUpdater {
            attr_id,
            values: AHashMap::new(),
        }
    }

    /// Attribute this updater covers.
    pub fn attr_id(&self) -> AttributeId {
        self.attr_id
    }

    /// Buffer one update.
    pub fn update(&mut self, doc_id: LocalDocId, value: &[u8], is_null: bool) {
        self.values.insert(
            doc_id,
            PatchValue {
                value: if is_null { Vec::new() } else { value.to_vec() },
                is_null,
            },
        );
    }

    /// Number of buffered updates.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Flush the buffer to a patch file under `segment_dir`, named by this
    /// attribute and the segment the updates originated from.
    pub fn dump(
        &self,
        storage: &dyn Storage,
        segment_dir: &str,
        src_segment: SegmentId,
    ) -> Result<String> {
        let path = attr_patch_path(segment_dir, self.attr_id, src_segment);

        let mut entries: Vec<(&LocalDocId, &PatchValue)> = self.values.iter().collect();
        entries.sort_by_key(|(doc_id, _)| **doc_id);

        let output = storage.create_output(&path)?;
        let mut writer = StructWriter::new(output);
        writer.write_u32(entries.len() as u32)?;
        for (doc_id, patch) in entries {
            writer.write_u32(*doc_id)?;
            writer.write_u8(patch.is_null as u8)?;
            writer.write_bytes(&patch.value)?;
        }
        writer.write_checksum_trailer()?;
        writer.close()?;

        Ok(path)
    }
}

/// Pending updates against one sealed segment; one lazily-created
/// [`AttributeUpdater`] per touched attribute.
#[derive(Debug)]
pub struct BuiltAttributeSegmentModifier {
    segment_id: SegmentId,
    updaters: AHashMap<AttributeId, AttributeUpdater>,
}

impl BuiltAttributeSegmentModifier {
    /// Create a modifier with no pending updates.
    pub fn new(segment_id: SegmentId) -> Self {
        BuiltAttributeSegmentModifier {
            segment_id,
            updaters: AHashMap::new(),
        }
    }

    /// Segment this modifier targets.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Buffer an update, creating the attribute's updater on first touch.
    pub fn update(&mut self, doc_id: LocalDocId, attr_id: AttributeId, value: &[u8], is_null: bool) {
        self.updaters
            .entry(attr_id)
            .or_insert_with(|| AttributeUpdater::new(attr_id))
            .update(doc_id, value, is_null);
    }

    /// Whether any attribute has pending updates.
    pub fn has_updates(&self) -> bool {
        self.updaters.values().any(|u| !u.is_empty())
    }

    /// Flush every updater to its patch file. Returns the written paths;
    /// none of them should be referenced by a new version until all of them
    /// are on storage.
    pub fn dump(
        &self,
        storage: &dyn Storage,
        segment_dir: &str,
        src_segment: SegmentId,
    ) -> Result<Vec<String>> {
        let mut attr_ids: Vec<AttributeId> = self.updaters.keys().copied().collect();
        attr_ids.sort_unstable();

        let mut paths = Vec::with_capacity(attr_ids.len());
        for attr_id in attr_ids {
            let updater = &self.updaters[&attr_id];
            if updater.is_empty() {
                continue;
            }
            paths.push(updater.dump(storage, segment_dir, src_segment)?);
        }
        Ok(paths)
    }
}

/// Sequential reader over one patch file, in doc-id order.
#[derive(Debug)]
pub struct SegmentPatchIterator {
    entries: Vec<(LocalDocId, PatchValue)>,
    pos: usize,
}

impl SegmentPatchIterator {
    /// Load and verify a patch file.
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let input = storage.open_input(path)?;
        let mut reader = StructReader::new(input)?;

        let count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let doc_id = reader.read_u32()?;
            let is_null = reader.read_u8()? != 0;
            let value = reader.read_bytes()?;
            entries.push((doc_id, PatchValue { value, is_null }));
        }
        reader.verify_checksum_trailer()?;

        Ok(SegmentPatchIterator { entries, pos: 0 })
    }

    /// Number of patch entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the patch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advance to `doc_id` and return its patch value if one exists.
    /// Callers must seek with non-decreasing doc ids.
    pub fn seek(&mut self, doc_id: LocalDocId) -> Option<&PatchValue> {
        while self.pos < self.entries.len() && self.entries[self.pos].0 < doc_id {
            self.pos += 1;
        }
        match self.entries.get(self.pos) {
            Some((entry_doc, patch)) if *entry_doc == doc_id => Some(patch),
            _ => None,
        }
    }

    /// Next entry in doc order, if any.
    pub fn next_entry(&mut self) -> Option<(LocalDocId, &PatchValue)> {
        let (doc_id, patch) = self.entries.get(self.pos)?;
        self.pos += 1;
        Some((*doc_id, patch))
    }
}

//! Global-doc-id routing of attribute updates across sealed segments.
//!
//! Online update traffic addresses documents by global id. The patch
//! modifier routes each update to the owning segment via a sorted
//! (segment, base doc id) list, lazily creating that segment's
//! [`BuiltAttributeSegmentModifier`]. Its dirty flag is what tells readers a
//! reload is due.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::attribute::updater::BuiltAttributeSegmentModifier;
use crate::error::{FalcataError, Result};
use crate::segment::{AttributeId, GlobalDocId, LocalDocId, SegmentId, segment_dir_name};
use crate::storage::Storage;

/// Routing entry: one segment and the global doc id its documents start at.
#[derive(Debug, Clone, Copy)]
struct SegmentRange {
    segment_id: SegmentId,
    base_doc_id: GlobalDocId,
    doc_count: u32,
}

/// Mutable state behind the modifier's lock: the routing table and the
/// lazily-created per-segment modifiers.
#[derive(Debug)]
struct PatchState {
    /// Sorted by base doc id.
    segments: Vec<SegmentRange>,
    modifiers: AHashMap<SegmentId, BuiltAttributeSegmentModifier>,
    dirty: bool,
}

/// Routes attribute updates by global doc id to per-segment modifiers.
///
/// Shared between the online update path and dump; protected by a plain
/// mutex, matching the engine's coarse online-state locking.
#[derive(Debug)]
pub struct PatchAttributeModifier {
    state: Mutex<PatchState>,
}

impl PatchAttributeModifier {
    /// Create a modifier for the given segment layout, `(segment id,
    /// doc count)` in version order.
    pub fn new(layout: &[(SegmentId, u32)]) -> Self {
        let mut segments = Vec::with_capacity(layout.len());
        let mut base: GlobalDocId = 0;
        for &(segment_id, doc_count) in layout {
            segments.push(SegmentRange {
                segment_id,
                base_doc_id: base,
                doc_count,
            });
            base += doc_count;
        }

        PatchAttributeModifier {
            state: Mutex::new(PatchState {
                segments,
                modifiers: AHashMap::new(),
                dirty: false,
            }),
        }
    }

    /// Total documents across the routed segments.
    pub fn total_doc_count(&self) -> u32 {
        let state = self.state.lock();
        state
            .segments
            .last()
            .map(|range| range.base_doc_id + range.doc_count)
            .unwrap_or(0)
    }

    /// Route one update to its owning segment.
    pub fn update(
        &self,
        global_doc_id: GlobalDocId,
        attr_id: AttributeId,
        value: &[u8],
        is_null: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let (segment_id, local_doc_id) = Self::route(&state.segments, global_doc_id)?;
        state
            .modifiers
            .entry(segment_id)
            .or_insert_with(|| BuiltAttributeSegmentModifier::new(segment_id))
            .update(local_doc_id, attr_id, value, is_null);
        state.dirty = true;
        Ok(())
    }

    /// Whether any patch exists since the last dump. Drives reader reload.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Dump every touched segment's pending updates to patch files, named
    /// with `src_segment` as the originating segment. Clears the dirty flag
    /// only after every per-attribute dump item completed.
    pub fn dump(&self, storage: &dyn Storage, src_segment: SegmentId) -> Result<Vec<String>> {
        let mut state = self.state.lock();

        let mut segment_ids: Vec<SegmentId> = state
            .modifiers
            .iter()
            .filter(|(_, modifier)| modifier.has_updates())
            .map(|(id, _)| *id)
            .collect();
        segment_ids.sort_unstable();

        let mut paths = Vec::new();
        for segment_id in segment_ids {
            let modifier = &state.modifiers[&segment_id];
            let dir = segment_dir_name(segment_id);
            paths.extend(modifier.dump(storage, &dir, src_segment)?);
        }

        state.modifiers.clear();
        state.dirty = false;
        Ok(paths)
    }

    fn route(
        segments: &[SegmentRange],
        global_doc_id: GlobalDocId,
    ) -> Result<(SegmentId, LocalDocId)> {
        // Last range whose base is <= the doc id.
        let idx = segments.partition_point(|range| range.base_doc_id <= global_doc_id);
        if idx == 0 {
            return Err(FalcataError::index(format!(
                "Global doc id {global_doc_id} precedes every segment"
            )));
        }

        let range = &segments[idx - 1];
        let local = global_doc_id - range.base_doc_id;
        if local >= range.doc_count {
            return Err(FalcataError::index(format!(
                "Global doc id {global_doc_id} beyond the last segment"
            )));
        }
        Ok((range.segment_id, local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::updater::SegmentPatchIterator;
    use crate::storage::MemoryStorage;

    fn modifier() -> PatchAttributeModifier {
        // Segment 1: docs 0..10, segment 4: docs 10..15, segment 6: docs 15..35.
        PatchAttributeModifier::new(&[(1, 10), (4, 5), (6, 20)])
    }

    #[test]
    fn test_routing() {
        let modifier = modifier();
        assert_eq!(modifier.total_doc_count(), 35);

        let storage = MemoryStorage::new_default();
        modifier.update(0, 0, b"a", false).unwrap();
        modifier.update(9, 0, b"b", false).unwrap();
        modifier.update(10, 0, b"c", false).unwrap();
        modifier.update(34, 0, b"d", false).unwrap();
        assert!(modifier.update(35, 0, b"x", false).is_err());

        let paths = modifier.dump(&storage, 7).unwrap();
        assert_eq!(
            paths,
            vec![
                "segment_1/attr_0_7.patch".to_string(),
                "segment_4/attr_0_7.patch".to_string(),
                "segment_6/attr_0_7.patch".to_string(),
            ]
        );

        // Doc 34 routes to segment 6, local id 19.
        let mut iter = SegmentPatchIterator::load(&storage, "segment_6/attr_0_7.patch").unwrap();
        assert_eq!(iter.seek(19).unwrap().value, b"d");
    }

    #[test]
    fn test_dirty_flag() {
        let modifier = modifier();
        assert!(!modifier.is_dirty());

        modifier.update(3, 1, b"v", false).unwrap();
        assert!(modifier.is_dirty());

        let storage = MemoryStorage::new_default();
        modifier.dump(&storage, 9).unwrap();
        assert!(!modifier.is_dirty());
    }

    #[test]
    fn test_empty_layout() {
        let modifier = PatchAttributeModifier::new(&[]);
        assert_eq!(modifier.total_doc_count(), 0);
        assert!(modifier.update(0, 0, b"v", false).is_err());
    }
}

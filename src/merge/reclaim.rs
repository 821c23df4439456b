//! Old-to-new document id mapping for one merge plan.
//!
//! The reclaim map is built exactly once per plan, before any storage work,
//! and is immutable afterwards: every downstream worker (attribute mergers,
//! pk index rewrite) shares it read-only, so lookups need no locking.
//!
//! Non-removed outputs form a dense, gap-free, duplicate-free surjection onto
//! `[0, new_doc_count)`.

use ahash::AHashMap;
use bit_vec::BitVec;
use tracing::error;

use crate::error::{FalcataError, Result};
use crate::segment::{DeletionBitmap, GlobalDocId, LocalDocId, SegmentId};

/// Per-segment input to reclaim map construction.
#[derive(Debug)]
pub struct SegmentDocSource {
    /// Segment id.
    pub segment_id: SegmentId,

    /// Documents in the segment.
    pub doc_count: u32,

    /// Deletion state accumulated against the segment, if any.
    pub deleted: Option<DeletionBitmap>,

    /// Primary-key hash per document, when the table is pk-addressed.
    /// Absent for doc-id-ordered merges (no cross-segment dedup).
    pub primary_keys: Option<Vec<u64>>,
}

impl SegmentDocSource {
    /// Source without deletions or primary keys.
    pub fn plain(segment_id: SegmentId, doc_count: u32) -> Self {
        SegmentDocSource {
            segment_id,
            doc_count,
            deleted: None,
            primary_keys: None,
        }
    }

    fn is_deleted(&self, doc_id: LocalDocId) -> bool {
        self.deleted
            .as_ref()
            .map(|bitmap| bitmap.is_deleted(doc_id))
            .unwrap_or(false)
    }
}

/// Mapping (old segment, old local doc id) -> new global doc id or removed.
#[derive(Debug)]
pub struct ReclaimMap {
    /// Segment ids in slot order (the plan's source order).
    segments: Vec<SegmentId>,

    /// Slot lookup by segment id.
    slot_of: AHashMap<SegmentId, usize>,

    /// Per slot, old local id -> new global id, `REMOVED` sentinel for dead docs.
    maps: Vec<Vec<GlobalDocId>>,

    /// Total live documents after the merge.
    new_doc_count: u32,
}

const REMOVED: GlobalDocId = GlobalDocId::MAX;

impl ReclaimMap {
    /// Build the map from the plan's source segments, in order.
    ///
    /// Deleted documents are skipped. When primary keys are present, a pk
    /// seen in more than one segment is logged as an error and the
    /// later-iterated occurrence wins.
    pub fn build(sources: &[SegmentDocSource]) -> Result<Self> {
        let mut slot_of = AHashMap::with_capacity(sources.len());
        for (slot, source) in sources.iter().enumerate() {
            if slot_of.insert(source.segment_id, slot).is_some() {
                return Err(FalcataError::index(format!(
                    "Segment {} appears twice in one merge plan",
                    source.segment_id
                )));
            }
            if let Some(pks) = &source.primary_keys {
                if pks.len() != source.doc_count as usize {
                    return Err(FalcataError::index(format!(
                        "Segment {} has {} primary keys for {} docs",
                        source.segment_id,
                        pks.len(),
                        source.doc_count
                    )));
                }
            }
        }

        // Pass 1: decide survivors. With primary keys, the last occurrence
        // of a pk across the iteration order wins.
        let mut survivors: Vec<BitVec> = sources
            .iter()
            .map(|s| BitVec::from_elem(s.doc_count as usize, false))
            .collect();

        let mut pk_winner: AHashMap<u64, (usize, LocalDocId)> = AHashMap::new();
        for (slot, source) in sources.iter().enumerate() {
            for doc_id in 0..source.doc_count {
                if source.is_deleted(doc_id) {
                    continue;
                }

                match source.primary_keys.as_ref() {
                    Some(pks) => {
                        let pk = pks[doc_id as usize];
                        if let Some((prev_slot, prev_doc)) =
                            pk_winner.insert(pk, (slot, doc_id))
                        {
                            error!(
                                pk,
                                first_segment = sources[prev_slot].segment_id,
                                second_segment = source.segment_id,
                                "Duplicate primary key across merged segments; \
                                 keeping the later occurrence"
                            );
                            survivors[prev_slot].set(prev_doc as usize, false);
                        }
                        survivors[slot].set(doc_id as usize, true);
                    }
                    None => survivors[slot].set(doc_id as usize, true),
                }
            }
        }

        // Pass 2: assign dense increasing new ids in iteration order.
        let mut maps: Vec<Vec<GlobalDocId>> = Vec::with_capacity(sources.len());
        let mut next_id: GlobalDocId = 0;
        for (slot, source) in sources.iter().enumerate() {
            let mut map = vec![REMOVED; source.doc_count as usize];
            for doc_id in 0..source.doc_count as usize {
                if survivors[slot].get(doc_id).unwrap_or(false) {
                    map[doc_id] = next_id;
                    next_id += 1;
                }
            }
            maps.push(map);
        }

        Ok(ReclaimMap {
            segments: sources.iter().map(|s| s.segment_id).collect(),
            slot_of,
            maps,
            new_doc_count: next_id,
        })
    }

    /// New global id of one old document, or `None` if it was removed.
    ///
    /// Pure and read-only; safe for unsynchronized concurrent reads.
    pub fn get_new_id(&self, segment_id: SegmentId, doc_id: LocalDocId) -> Option<GlobalDocId> {
        let slot = *self.slot_of.get(&segment_id)?;
        match self.maps[slot].get(doc_id as usize) {
            Some(&REMOVED) | None => None,
            Some(&new_id) => Some(new_id),
        }
    }

    /// Total live documents after the merge.
    pub fn new_doc_count(&self) -> u32 {
        self.new_doc_count
    }

    /// Source segment ids in slot order.
    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }
}

/// One live entry yielded by [`PrimaryKeyMergeIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkMergeEntry {
    /// Primary-key hash.
    pub pk: u64,

    /// Source segment.
    pub segment_id: SegmentId,

    /// Local doc id within the source segment.
    pub old_doc_id: LocalDocId,

    /// Assigned new global doc id.
    pub new_doc_id: GlobalDocId,
}

/// Iterates surviving documents of a plan in new-id order, filtering entries
/// the reclaim map marked removed.
#[derive(Debug)]
pub struct PrimaryKeyMergeIterator<'a> {
    reclaim: &'a ReclaimMap,
    sources: &'a [SegmentDocSource],
    slot: usize,
    doc_id: LocalDocId,
}

impl<'a> PrimaryKeyMergeIterator<'a> {
    /// Create an iterator over the plan's sources. The source order must be
    /// the order the reclaim map was built from.
    pub fn new(reclaim: &'a ReclaimMap, sources: &'a [SegmentDocSource]) -> Self {
        PrimaryKeyMergeIterator {
            reclaim,
            sources,
            slot: 0,
            doc_id: 0,
        }
    }
}

impl<'a> Iterator for PrimaryKeyMergeIterator<'a> {
    type Item = PkMergeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.sources.len() {
            let source = &self.sources[self.slot];
            if self.doc_id >= source.doc_count {
                self.slot += 1;
                self.doc_id = 0;
                continue;
            }

            let doc_id = self.doc_id;
            self.doc_id += 1;

            if let Some(new_doc_id) = self.reclaim.get_new_id(source.segment_id, doc_id) {
                let pk = source
                    .primary_keys
                    .as_ref()
                    .map(|pks| pks[doc_id as usize])
                    .unwrap_or(0);
                return Some(PkMergeEntry {
                    pk,
                    segment_id: source.segment_id,
                    old_doc_id: doc_id,
                    new_doc_id,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_pks(segment_id: SegmentId, pks: &[u64]) -> SegmentDocSource {
        SegmentDocSource {
            segment_id,
            doc_count: pks.len() as u32,
            deleted: None,
            primary_keys: Some(pks.to_vec()),
        }
    }

    #[test]
    fn test_dense_surjection_without_pks() {
        let mut deleted = DeletionBitmap::new(1, 4);
        deleted.delete_document(1).unwrap();

        let sources = vec![
            SegmentDocSource {
                segment_id: 1,
                doc_count: 4,
                deleted: Some(deleted),
                primary_keys: None,
            },
            SegmentDocSource::plain(2, 3),
        ];

        let reclaim = ReclaimMap::build(&sources).unwrap();
        assert_eq!(reclaim.new_doc_count(), 6);

        // Non-removed outputs exactly cover 0..new_doc_count.
        let mut seen = vec![false; 6];
        for source in &sources {
            for doc in 0..source.doc_count {
                if let Some(new_id) = reclaim.get_new_id(source.segment_id, doc) {
                    assert!(!seen[new_id as usize], "duplicate new id {new_id}");
                    seen[new_id as usize] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));

        assert_eq!(reclaim.get_new_id(1, 1), None); // deleted
        assert_eq!(reclaim.get_new_id(1, 0), Some(0));
        assert_eq!(reclaim.get_new_id(2, 0), Some(3));
    }

    #[test]
    fn test_duplicate_pk_later_occurrence_wins() {
        let sources = vec![
            source_with_pks(1, &[10, 20, 30]),
            source_with_pks(2, &[20, 40]),
        ];

        let reclaim = ReclaimMap::build(&sources).unwrap();
        assert_eq!(reclaim.new_doc_count(), 4);

        // pk 20 in segment 1 lost to the later occurrence in segment 2.
        assert_eq!(reclaim.get_new_id(1, 1), None);
        assert!(reclaim.get_new_id(2, 0).is_some());
    }

    #[test]
    fn test_pk_iterator_order_and_filtering() {
        let mut deleted = DeletionBitmap::new(2, 2);
        deleted.delete_document(1).unwrap();

        let sources = vec![
            source_with_pks(1, &[10, 20]),
            SegmentDocSource {
                segment_id: 2,
                doc_count: 2,
                deleted: Some(deleted),
                primary_keys: Some(vec![30, 40]),
            },
        ];

        let reclaim = ReclaimMap::build(&sources).unwrap();
        let entries: Vec<PkMergeEntry> =
            PrimaryKeyMergeIterator::new(&reclaim, &sources).collect();

        assert_eq!(entries.len(), 3);
        // New-id order is dense and increasing.
        for (expected, entry) in entries.iter().enumerate() {
            assert_eq!(entry.new_doc_id, expected as u32);
        }
        assert_eq!(entries[0].pk, 10);
        assert_eq!(entries[2].pk, 30);
        assert!(entries.iter().all(|e| e.pk != 40)); // deleted doc filtered
    }

    #[test]
    fn test_unknown_segment_lookup() {
        let reclaim = ReclaimMap::build(&[SegmentDocSource::plain(1, 2)]).unwrap();
        assert_eq!(reclaim.get_new_id(9, 0), None);
        assert_eq!(reclaim.get_new_id(1, 99), None);
    }

    #[test]
    fn test_duplicate_segment_in_plan_rejected() {
        let sources = vec![SegmentDocSource::plain(1, 2), SegmentDocSource::plain(1, 2)];
        assert!(ReclaimMap::build(&sources).is_err());
    }
}

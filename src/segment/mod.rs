//! Segment model: immutable on-disk units, merge statistics and level layout.
//!
//! A segment is produced by one build or merge round, becomes immutable once
//! sealed, and is referenced by published [`Version`]s until no open snapshot
//! needs it. Merge planning consumes per-segment statistics
//! ([`SegmentMergeInfo`]) plus the level/column placement ([`LevelInfo`]).

pub mod deletion;
pub mod version;

pub use deletion::*;
pub use version::*;

use serde::{Deserialize, Serialize};

use crate::error::{FalcataError, Result};
use crate::storage::Storage;

/// Identifier of one segment. Monotonically assigned by the build/merge path.
pub type SegmentId = u32;

/// Identifier of one attribute within the schema.
pub type AttributeId = u32;

/// Local document id within one segment.
pub type LocalDocId = u32;

/// Global document id within one version.
pub type GlobalDocId = u32;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Still accumulating documents in memory.
    Building,
    /// Sealed and immutable on disk.
    Built,
}

/// Metadata describing one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Monotonic segment id.
    pub segment_id: SegmentId,

    /// Number of documents in the segment.
    pub doc_count: u32,

    /// Creation timestamp (seconds since epoch).
    pub timestamp: u64,

    /// Opaque progress locator carried through from the build pipeline.
    pub locator: String,

    /// Lifecycle state.
    pub state: SegmentState,
}

impl SegmentInfo {
    /// Create metadata for a sealed segment.
    pub fn built(segment_id: SegmentId, doc_count: u32, timestamp: u64) -> Self {
        SegmentInfo {
            segment_id,
            doc_count,
            timestamp,
            locator: String::new(),
            state: SegmentState::Built,
        }
    }

    /// Persist this metadata into the segment's directory.
    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        self.save_to(storage, &segment_dir_name(self.segment_id))
    }

    /// Persist this metadata under an explicit directory, used while the
    /// segment is still being staged.
    pub fn save_to(&self, storage: &dyn Storage, segment_dir: &str) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut output = storage.create_output(&format!("{segment_dir}/segment_info.json"))?;
        std::io::Write::write_all(&mut output, &json)?;
        output.close()
    }

    /// Load segment metadata from storage.
    pub fn load(storage: &dyn Storage, segment_id: SegmentId) -> Result<Self> {
        let path = segment_info_path(segment_id);
        let mut input = storage.open_input(&path)?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

/// Per-segment statistics consumed by merge planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMergeInfo {
    /// Segment id.
    pub segment_id: SegmentId,

    /// Total documents in the segment.
    pub doc_count: u32,

    /// Documents marked deleted.
    pub delete_count: u32,

    /// Level the segment currently sits on.
    pub level: u32,

    /// Column placement within the level, for hash-partitioned layouts.
    pub column: u32,
}

impl SegmentMergeInfo {
    /// Number of live documents.
    pub fn live_count(&self) -> u32 {
        self.doc_count.saturating_sub(self.delete_count)
    }

    /// Deletion ratio in `[0.0, 1.0]`.
    pub fn deletion_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.delete_count as f64 / self.doc_count as f64
        }
    }
}

/// Topology of one level of the segment layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelTopology {
    /// Segments form an ordered sequence shared by all columns.
    Sequence,
    /// Segments are partitioned across columns by primary-key hash.
    HashMod,
}

/// One level of the layered segment layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelMeta {
    /// Level index, 0 is the topmost (freshest) level.
    pub level_idx: u32,

    /// Topology of this level.
    pub topology: LevelTopology,

    /// Segment ids on this level, ordered. For `HashMod` levels the position
    /// is the column index.
    pub segment_ids: Vec<SegmentId>,

    /// Whether this is the bottom level of the layout.
    pub is_bottom: bool,
}

/// Layered segment layout description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelInfo {
    /// Overall topology of the layout.
    pub topology: LevelTopology,

    /// Number of hash columns (1 for pure sequence layouts).
    pub column_count: u32,

    /// Levels, top first.
    pub levels: Vec<LevelMeta>,
}

impl LevelInfo {
    /// A single-level sequence layout, the default for non-partitioned tables.
    pub fn sequence() -> Self {
        LevelInfo {
            topology: LevelTopology::Sequence,
            column_count: 1,
            levels: Vec::new(),
        }
    }

    /// Find the level a segment sits on.
    pub fn level_of(&self, segment_id: SegmentId) -> Option<&LevelMeta> {
        self.levels
            .iter()
            .find(|level| level.segment_ids.contains(&segment_id))
    }

    /// Whether the segment is already on the bottom level.
    pub fn is_bottom_level(&self, segment_id: SegmentId) -> bool {
        self.level_of(segment_id).map(|l| l.is_bottom).unwrap_or(false)
    }

    /// Validate that every level respects the column count.
    pub fn validate(&self) -> Result<()> {
        for level in &self.levels {
            if level.topology == LevelTopology::HashMod
                && level.segment_ids.len() as u32 > self.column_count
            {
                return Err(FalcataError::config(format!(
                    "Level {} holds {} segments but the layout has only {} columns",
                    level.level_idx,
                    level.segment_ids.len(),
                    self.column_count
                )));
            }
        }
        Ok(())
    }
}

/// Directory name of a sealed segment.
pub fn segment_dir_name(segment_id: SegmentId) -> String {
    format!("segment_{segment_id}")
}

/// Directory name a segment is written under while a merge is in flight.
/// Renamed to [`segment_dir_name`] only when every file is complete.
pub fn segment_temp_dir_name(segment_id: SegmentId) -> String {
    format!("segment_{segment_id}.tmp")
}

/// Path of a segment's metadata file.
pub fn segment_info_path(segment_id: SegmentId) -> String {
    format!("{}/segment_info.json", segment_dir_name(segment_id))
}

/// Path of a single-value or var-length attribute data file.
pub fn attr_data_path(segment_dir: &str, attr_id: AttributeId) -> String {
    format!("{segment_dir}/attr_{attr_id}/data")
}

/// Path of a var-length attribute's compressed offset file.
pub fn attr_offset_path(segment_dir: &str, attr_id: AttributeId) -> String {
    format!("{segment_dir}/attr_{attr_id}/offset")
}

/// Path of a var-length attribute's append-only expand-slice file.
pub fn attr_expand_path(segment_dir: &str, attr_id: AttributeId) -> String {
    format!("{segment_dir}/attr_{attr_id}/offset.expand")
}

/// Path of a patch file recording updates from `src_segment` against the
/// segment owning `segment_dir`.
pub fn attr_patch_path(segment_dir: &str, attr_id: AttributeId, src_segment: SegmentId) -> String {
    format!("{segment_dir}/attr_{attr_id}_{src_segment}.patch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_segment_info_roundtrip() {
        let storage = MemoryStorage::new_default();
        let info = SegmentInfo::built(3, 100, 1_700_000_000);
        info.save(&storage).unwrap();

        let loaded = SegmentInfo::load(&storage, 3).unwrap();
        assert_eq!(loaded.segment_id, 3);
        assert_eq!(loaded.doc_count, 100);
        assert_eq!(loaded.state, SegmentState::Built);
    }

    #[test]
    fn test_merge_info_ratios() {
        let info = SegmentMergeInfo {
            segment_id: 1,
            doc_count: 100,
            delete_count: 25,
            level: 0,
            column: 0,
        };
        assert_eq!(info.live_count(), 75);
        assert!((info.deletion_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_level_info_bottom_lookup() {
        let level_info = LevelInfo {
            topology: LevelTopology::HashMod,
            column_count: 2,
            levels: vec![
                LevelMeta {
                    level_idx: 0,
                    topology: LevelTopology::Sequence,
                    segment_ids: vec![5],
                    is_bottom: false,
                },
                LevelMeta {
                    level_idx: 1,
                    topology: LevelTopology::HashMod,
                    segment_ids: vec![3, 4],
                    is_bottom: true,
                },
            ],
        };

        assert!(!level_info.is_bottom_level(5));
        assert!(level_info.is_bottom_level(3));
        assert!(level_info.is_bottom_level(4));
        assert!(!level_info.is_bottom_level(99));
        level_info.validate().unwrap();
    }

    #[test]
    fn test_level_info_validate_rejects_overflow() {
        let level_info = LevelInfo {
            topology: LevelTopology::HashMod,
            column_count: 1,
            levels: vec![LevelMeta {
                level_idx: 0,
                topology: LevelTopology::HashMod,
                segment_ids: vec![1, 2],
                is_bottom: true,
            }],
        };
        assert!(level_info.validate().is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(segment_dir_name(7), "segment_7");
        assert_eq!(segment_temp_dir_name(7), "segment_7.tmp");
        assert_eq!(attr_data_path("segment_7", 2), "segment_7/attr_2/data");
        assert_eq!(attr_offset_path("segment_7", 2), "segment_7/attr_2/offset");
        assert_eq!(attr_patch_path("segment_7", 2, 4), "segment_7/attr_2_4.patch");
    }
}

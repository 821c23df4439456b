//! Published index versions.
//!
//! A version is one queryable snapshot: an ordered, duplicate-free set of
//! segment ids plus a timestamp and an opaque locator checkpoint. A version
//! file only becomes visible once fully written, so a failed merge round
//! leaves the previous version intact.

use serde::{Deserialize, Serialize};

use crate::error::{FalcataError, Result};
use crate::segment::SegmentId;
use crate::storage::Storage;

/// One queryable snapshot of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// Monotonic version id.
    pub version_id: u64,

    /// Ordered, duplicate-free segment ids forming the snapshot.
    pub segment_ids: Vec<SegmentId>,

    /// Publish timestamp (seconds since epoch).
    pub timestamp: u64,

    /// Opaque progress checkpoint, treated as a blob here.
    pub locator: String,
}

impl Version {
    /// Create an empty version.
    pub fn new(version_id: u64, timestamp: u64) -> Self {
        Version {
            version_id,
            segment_ids: Vec::new(),
            timestamp,
            locator: String::new(),
        }
    }

    /// Append a segment id. Rejects duplicates.
    pub fn add_segment(&mut self, segment_id: SegmentId) -> Result<()> {
        if self.segment_ids.contains(&segment_id) {
            return Err(FalcataError::index(format!(
                "Segment {segment_id} is already part of version {}",
                self.version_id
            )));
        }
        self.segment_ids.push(segment_id);
        Ok(())
    }

    /// Remove a segment id if present.
    pub fn remove_segment(&mut self, segment_id: SegmentId) {
        self.segment_ids.retain(|id| *id != segment_id);
    }

    /// Whether the version references the segment.
    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.segment_ids.contains(&segment_id)
    }

    /// File name this version publishes under.
    pub fn file_name(&self) -> String {
        format!("version.{}", self.version_id)
    }

    /// Publish the version: write to a temp name, then rename into place so
    /// readers only ever observe a complete file.
    pub fn publish(&self, storage: &dyn Storage) -> Result<()> {
        let final_name = self.file_name();
        let temp_name = format!("{final_name}.tmp");

        let json = serde_json::to_vec_pretty(self)?;
        let mut output = storage.create_output(&temp_name)?;
        std::io::Write::write_all(&mut output, &json)?;
        output.close()?;

        storage.rename_file(&temp_name, &final_name)
    }

    /// Load one version file.
    pub fn load(storage: &dyn Storage, version_id: u64) -> Result<Self> {
        let name = format!("version.{version_id}");
        let mut input = storage.open_input(&name)?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Load the latest published version, if any. Unfinished `.tmp` files
    /// are ignored.
    pub fn load_latest(storage: &dyn Storage) -> Result<Option<Self>> {
        let mut latest: Option<u64> = None;
        for name in storage.list_files()? {
            if let Some(rest) = name.strip_prefix("version.") {
                if let Ok(id) = rest.parse::<u64>() {
                    latest = Some(latest.map_or(id, |cur| cur.max(id)));
                }
            }
        }

        match latest {
            Some(id) => Ok(Some(Self::load(storage, id)?)),
            None => Ok(None),
        }
    }
}

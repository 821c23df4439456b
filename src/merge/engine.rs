//! Merge execution.
//!
//! The engine runs a [`MergeTask`]: plans in parallel on a rayon pool, and
//! within each plan the per-attribute rewrites as independent parallel items.
//! A failing plan aborts only itself; sibling plans finish and the previous
//! version stays valid. Target segments are staged under `segment_<id>.tmp/`
//! and renamed into place only when every file is complete, so a crash at any
//! point leaves either the old layout or the new one, never a half-written
//! segment.

use std::sync::Arc;
use std::time::SystemTime;

use rayon::prelude::*;
use tracing::{error, info};

use crate::attribute::{AttributeSegmentSource, FixedStrideAttributeMerger, VarLenAttributeMerger};
use crate::error::{FalcataError, Result};
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::reclaim::{ReclaimMap, SegmentDocSource};
use crate::segment::{
    AttributeId, DeletionBitmap, SegmentId, SegmentInfo, Version, segment_dir_name,
    segment_temp_dir_name,
};
use crate::storage::Storage;

/// Upper bound on merge worker threads regardless of configuration.
pub const MAX_MERGE_THREADS: usize = 16;

/// Storage kind of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Fixed number of bytes per document.
    FixedStride(usize),
    /// Variable-length values behind a compressed offset table.
    VarLen,
}

/// Schema entry the engine needs per attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    pub attr_id: AttributeId,
    pub kind: AttributeKind,
}

impl AttributeSchema {
    pub fn fixed(attr_id: AttributeId, stride: usize) -> Self {
        AttributeSchema {
            attr_id,
            kind: AttributeKind::FixedStride(stride),
        }
    }

    pub fn var_len(attr_id: AttributeId) -> Self {
        AttributeSchema {
            attr_id,
            kind: AttributeKind::VarLen,
        }
    }
}

/// Configuration for merge execution.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Worker threads for the merge pool, capped at [`MAX_MERGE_THREADS`].
    pub thread_count: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            thread_count: num_cpus::get().min(MAX_MERGE_THREADS),
        }
    }
}

/// Counters collected over one merge round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Plans that completed.
    pub plans_executed: usize,

    /// Plans that aborted.
    pub plans_failed: usize,

    /// Source documents read across completed plans.
    pub docs_processed: u64,

    /// Deleted documents dropped during rewriting.
    pub docs_removed: u64,

    /// Time taken for the round, in milliseconds.
    pub merge_time_ms: u64,
}

/// Outcome of one merge round.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub stats: MergeStats,

    /// Segments produced by completed plans.
    pub new_segments: Vec<SegmentId>,

    /// Source segments of completed plans, superseded by the new ones.
    pub merged_segments: Vec<SegmentId>,
}

#[derive(Debug)]
struct PlanResult {
    new_segment: SegmentId,
    sources: Vec<SegmentId>,
    docs_processed: u64,
    docs_removed: u64,
}

/// Executes merge tasks against a storage backend.
#[derive(Debug)]
pub struct MergeEngine {
    config: MergeConfig,
    storage: Arc<dyn Storage>,
}

impl MergeEngine {
    pub fn new(config: MergeConfig, storage: Arc<dyn Storage>) -> Self {
        MergeEngine { config, storage }
    }

    /// Run every plan of `task`, producing target segments numbered from
    /// `next_segment_id`. A failing plan is logged and counted; the others
    /// are unaffected.
    pub fn execute(
        &self,
        task: &MergeTask,
        attributes: &[AttributeSchema],
        next_segment_id: SegmentId,
    ) -> Result<MergeOutcome> {
        let start_time = SystemTime::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.thread_count.clamp(1, MAX_MERGE_THREADS))
            .build()
            .map_err(|e| FalcataError::other(format!("Merge pool setup failed: {e}")))?;

        let results: Vec<Result<PlanResult>> = pool.install(|| {
            task.plans
                .par_iter()
                .enumerate()
                .map(|(idx, plan)| {
                    self.execute_plan(plan, attributes, next_segment_id + idx as SegmentId)
                })
                .collect()
        });

        let mut stats = MergeStats::default();
        let mut new_segments = Vec::new();
        let mut merged_segments = Vec::new();
        for result in results {
            match result {
                Ok(plan_result) => {
                    stats.plans_executed += 1;
                    stats.docs_processed += plan_result.docs_processed;
                    stats.docs_removed += plan_result.docs_removed;
                    new_segments.push(plan_result.new_segment);
                    merged_segments.extend(plan_result.sources);
                }
                Err(err) => {
                    error!("merge plan aborted: {err}");
                    stats.plans_failed += 1;
                }
            }
        }

        stats.merge_time_ms = SystemTime::now()
            .duration_since(start_time)
            .unwrap_or_default()
            .as_millis() as u64;
        info!(
            plans = stats.plans_executed,
            failed = stats.plans_failed,
            docs = stats.docs_processed,
            "merge round finished"
        );

        Ok(MergeOutcome {
            stats,
            new_segments,
            merged_segments,
        })
    }

    fn execute_plan(
        &self,
        plan: &MergePlan,
        attributes: &[AttributeSchema],
        target_id: SegmentId,
    ) -> Result<PlanResult> {
        let storage = self.storage.as_ref();

        let mut doc_sources = Vec::with_capacity(plan.src_segment_ids.len());
        let mut infos = Vec::with_capacity(plan.src_segment_ids.len());
        for &segment_id in &plan.src_segment_ids {
            let info = SegmentInfo::load(storage, segment_id)?;
            let deleted = DeletionBitmap::load(storage, segment_id, info.doc_count)?;
            doc_sources.push(SegmentDocSource {
                segment_id,
                doc_count: info.doc_count,
                deleted: Some(deleted),
                primary_keys: None,
            });
            infos.push(info);
        }

        let docs_processed: u64 = infos.iter().map(|info| info.doc_count as u64).sum();
        let reclaim = ReclaimMap::build(&doc_sources)?;
        let docs_removed = docs_processed - reclaim.new_doc_count() as u64;

        let temp_dir = segment_temp_dir_name(target_id);
        let attr_sources = self.attribute_sources(&infos)?;

        // ReclaimMap lookups are read-only, so attribute rewrites are
        // independent parallel items.
        attributes
            .par_iter()
            .map(|schema| {
                let sources = attr_sources(schema.attr_id);
                match schema.kind {
                    AttributeKind::FixedStride(stride) => {
                        FixedStrideAttributeMerger::new(schema.attr_id, stride)
                            .merge(storage, &sources, &reclaim, &temp_dir)
                            .map(|_| ())
                    }
                    AttributeKind::VarLen => VarLenAttributeMerger::new(schema.attr_id)
                        .merge(storage, &sources, &reclaim, &temp_dir)
                        .map(|_| ()),
                }
            })
            .collect::<Result<Vec<()>>>()?;

        let timestamp = infos.iter().map(|info| info.timestamp).max().unwrap_or(0);
        let target_info = SegmentInfo::built(target_id, reclaim.new_doc_count(), timestamp);
        target_info.save_to(storage, &temp_dir)?;

        storage.rename_prefix(&temp_dir, &segment_dir_name(target_id))?;
        storage.sync()?;

        Ok(PlanResult {
            new_segment: target_id,
            sources: plan.src_segment_ids.clone(),
            docs_processed,
            docs_removed,
        })
    }

    /// Per-attribute source descriptors, with patch files discovered from the
    /// segment directories and ordered by originating segment.
    fn attribute_sources(
        &self,
        infos: &[SegmentInfo],
    ) -> Result<impl Fn(AttributeId) -> Vec<AttributeSegmentSource> + Sync> {
        let all_files = self.storage.list_files()?;
        let infos: Vec<(SegmentId, u32)> = infos
            .iter()
            .map(|info| (info.segment_id, info.doc_count))
            .collect();

        Ok(move |attr_id: AttributeId| {
            infos
                .iter()
                .map(|&(segment_id, doc_count)| {
                    let segment_dir = segment_dir_name(segment_id);
                    let mut patches: Vec<(SegmentId, String)> = all_files
                        .iter()
                        .filter_map(|path| {
                            let name = path.strip_prefix(&format!("{segment_dir}/"))?;
                            let src = name
                                .strip_prefix(&format!("attr_{attr_id}_"))?
                                .strip_suffix(".patch")?;
                            Some((src.parse::<SegmentId>().ok()?, path.clone()))
                        })
                        .collect();
                    patches.sort_by_key(|(src, _)| *src);
                    AttributeSegmentSource {
                        segment_id,
                        segment_dir,
                        doc_count,
                        patch_paths: patches.into_iter().map(|(_, path)| path).collect(),
                    }
                })
                .collect()
        })
    }

    /// Remove stale `segment_<id>.tmp/` staging directories left behind by
    /// an interrupted merge.
    pub fn discard_partial_segments(&self) -> Result<usize> {
        let mut stale: Vec<String> = self
            .storage
            .list_files()?
            .iter()
            .filter_map(|path| {
                let (dir, _) = path.split_once('/')?;
                (dir.starts_with("segment_") && dir.ends_with(".tmp")).then(|| dir.to_string())
            })
            .collect();
        stale.sort_unstable();
        stale.dedup();

        for dir in &stale {
            info!("discarding partial segment {dir}");
            self.storage.delete_prefix(dir)?;
        }
        Ok(stale.len())
    }

    /// Publish the layout after a merge round: the previous version's
    /// segments minus the merged-away sources, plus the new targets.
    pub fn publish_version(
        &self,
        previous: Option<&Version>,
        outcome: &MergeOutcome,
        timestamp: u64,
    ) -> Result<Version> {
        let version_id = previous.map(|v| v.version_id + 1).unwrap_or(0);
        let mut version = Version::new(version_id, timestamp);

        if let Some(previous) = previous {
            for &segment_id in &previous.segment_ids {
                if !outcome.merged_segments.contains(&segment_id) {
                    version.add_segment(segment_id)?;
                }
            }
        }
        for &segment_id in &outcome.new_segments {
            version.add_segment(segment_id)?;
        }

        version.publish(self.storage.as_ref())?;
        Ok(version)
    }
}

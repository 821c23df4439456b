//! Merge planning strategies.
//!
//! A strategy turns per-segment statistics plus the level layout into a
//! [`MergeTask`]. Planning is pure: it never touches storage, and malformed
//! parameters are rejected in `set_parameter`, before any I/O happens.
//! Strategies are a closed set of variants; the registry is an explicit
//! object built at startup and passed by reference.

use ahash::AHashMap;

use crate::error::{FalcataError, Result};
use crate::merge::plan::{MergePlan, MergeTask};
use crate::segment::{LevelInfo, LevelTopology, SegmentId, SegmentMergeInfo};

pub const OPTIMIZE_STRATEGY: &str = "optimize";
pub const SPECIFIC_SEGMENTS_STRATEGY: &str = "specific_segments";
pub const KEY_VALUE_OPTIMIZE_STRATEGY: &str = "key_value_optimize";

/// Parameters of [`MergeStrategy::Optimize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeParams {
    /// Segments with more documents than this are left out of the merge.
    pub max_doc_count: Option<u32>,

    /// Split the merge into at most this many balanced plans.
    pub after_merge_max_segment_count: Option<u32>,
}

/// Parameters of [`MergeStrategy::SpecificSegments`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecificSegmentsParams {
    /// Operator-specified plan groups.
    pub groups: Vec<Vec<SegmentId>>,
}

/// Merge planning strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Merge everything toward a minimal segment count.
    Optimize(OptimizeParams),

    /// Merge exactly the operator-specified segment groups.
    SpecificSegments(SpecificSegmentsParams),

    /// Full compaction of a hash-partitioned layout, one plan per column.
    KeyValueOptimize,
}

impl MergeStrategy {
    /// Strategy name, as used by the registry.
    pub fn name(&self) -> &'static str {
        match self {
            MergeStrategy::Optimize(_) => OPTIMIZE_STRATEGY,
            MergeStrategy::SpecificSegments(_) => SPECIFIC_SEGMENTS_STRATEGY,
            MergeStrategy::KeyValueOptimize => KEY_VALUE_OPTIMIZE_STRATEGY,
        }
    }

    /// Parse and apply a parameter string. Malformed input fails here.
    pub fn set_parameter(&mut self, param: &str) -> Result<()> {
        match self {
            MergeStrategy::Optimize(params) => {
                *params = parse_optimize_params(param)?;
            }
            MergeStrategy::SpecificSegments(params) => {
                params.groups = parse_segment_groups(param)?;
            }
            MergeStrategy::KeyValueOptimize => {
                if !param.is_empty() {
                    return Err(FalcataError::config(format!(
                        "{KEY_VALUE_OPTIMIZE_STRATEGY} takes no parameters, got: {param}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Current parameter string, round-trippable through [`set_parameter`].
    ///
    /// [`set_parameter`]: MergeStrategy::set_parameter
    pub fn parameter(&self) -> String {
        match self {
            MergeStrategy::Optimize(params) => {
                let mut parts = Vec::new();
                if let Some(n) = params.max_doc_count {
                    parts.push(format!("max-doc-count={n}"));
                }
                if let Some(k) = params.after_merge_max_segment_count {
                    parts.push(format!("after-merge-max-segment-count={k}"));
                }
                parts.join(";")
            }
            MergeStrategy::SpecificSegments(params) => {
                if params.groups.is_empty() {
                    String::new()
                } else {
                    let groups: Vec<String> = params
                        .groups
                        .iter()
                        .map(|group| {
                            group
                                .iter()
                                .map(|id| id.to_string())
                                .collect::<Vec<_>>()
                                .join(",")
                        })
                        .collect();
                    format!("merge_segments={}", groups.join(";"))
                }
            }
            MergeStrategy::KeyValueOptimize => String::new(),
        }
    }

    /// Whether this strategy would produce any work for the given layout.
    pub fn need_merge(&self, infos: &[SegmentMergeInfo], level_info: &LevelInfo) -> bool {
        match self {
            MergeStrategy::KeyValueOptimize => level_info
                .levels
                .iter()
                .flat_map(|level| &level.segment_ids)
                .any(|id| !level_info.is_bottom_level(*id)),
            _ => self
                .create_merge_task(infos, level_info)
                .map(|task| !task.is_empty())
                .unwrap_or(false),
        }
    }

    /// Plan one merge round. Returns an empty task when nothing qualifies.
    pub fn create_merge_task(
        &self,
        infos: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        match self {
            MergeStrategy::Optimize(params) => Ok(optimize_task(params, infos)),
            MergeStrategy::SpecificSegments(params) => Ok(specific_segments_task(params, infos)),
            MergeStrategy::KeyValueOptimize => key_value_optimize_task(infos, level_info),
        }
    }

    /// Plan a forced full compaction.
    ///
    /// `SpecificSegments` delegates to `Optimize` here: an operator grouping
    /// does not constrain a full-compaction request.
    pub fn create_merge_task_for_optimize(
        &self,
        infos: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        match self {
            MergeStrategy::SpecificSegments(_) => {
                Ok(optimize_task(&OptimizeParams::default(), infos))
            }
            _ => self.create_merge_task(infos, level_info),
        }
    }
}

fn parse_optimize_params(param: &str) -> Result<OptimizeParams> {
    let mut params = OptimizeParams::default();
    for part in param.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            FalcataError::config(format!("Malformed {OPTIMIZE_STRATEGY} parameter: {part}"))
        })?;
        let value: u32 = value.parse().map_err(|_| {
            FalcataError::config(format!("Invalid value for {key}: {value}"))
        })?;
        match key {
            "max-doc-count" => params.max_doc_count = Some(value),
            "after-merge-max-segment-count" => {
                if value == 0 {
                    return Err(FalcataError::config(
                        "after-merge-max-segment-count must be at least 1",
                    ));
                }
                params.after_merge_max_segment_count = Some(value);
            }
            other => {
                return Err(FalcataError::config(format!(
                    "Unknown {OPTIMIZE_STRATEGY} parameter: {other}"
                )));
            }
        }
    }
    Ok(params)
}

fn parse_segment_groups(param: &str) -> Result<Vec<Vec<SegmentId>>> {
    if param.is_empty() {
        return Ok(Vec::new());
    }
    let grouping = param.strip_prefix("merge_segments=").ok_or_else(|| {
        FalcataError::config(format!(
            "{SPECIFIC_SEGMENTS_STRATEGY} expects merge_segments=<groups>, got: {param}"
        ))
    })?;

    let mut groups = Vec::new();
    for group in grouping.split(';') {
        let ids: Vec<SegmentId> = group
            .split(',')
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse().map_err(|_| {
                    FalcataError::config(format!("Invalid segment id in merge_segments: {id}"))
                })
            })
            .collect::<Result<_>>()?;
        if ids.is_empty() {
            return Err(FalcataError::config(format!(
                "Empty plan group in merge_segments: {param}"
            )));
        }
        groups.push(ids);
    }
    Ok(groups)
}

fn optimize_task(params: &OptimizeParams, infos: &[SegmentMergeInfo]) -> MergeTask {
    let qualifying: Vec<&SegmentMergeInfo> = infos
        .iter()
        .filter(|info| match params.max_doc_count {
            Some(max) => info.doc_count <= max,
            None => true,
        })
        .collect();

    // Already optimal: a single segment with no deletes has nothing to gain.
    if qualifying.is_empty()
        || (qualifying.len() == 1 && qualifying[0].delete_count == 0)
    {
        return MergeTask::empty();
    }

    let plan_count = params
        .after_merge_max_segment_count
        .map(|k| (k as usize).min(qualifying.len()))
        .unwrap_or(1);

    // Balance plans by live doc count: largest segments first, each into the
    // currently lightest plan.
    let mut by_live = qualifying;
    by_live.sort_by(|a, b| {
        b.live_count()
            .cmp(&a.live_count())
            .then(a.segment_id.cmp(&b.segment_id))
    });

    let mut buckets: Vec<(u64, Vec<SegmentId>)> = vec![(0, Vec::new()); plan_count];
    for info in by_live {
        let lightest = buckets
            .iter_mut()
            .min_by_key(|(weight, _)| *weight)
            .unwrap();
        lightest.0 += info.live_count() as u64;
        lightest.1.push(info.segment_id);
    }

    let mut plans = Vec::new();
    for (_, mut ids) in buckets {
        if ids.is_empty() {
            continue;
        }
        ids.sort_unstable();
        // A lone segment without deletes is already its own merged output.
        if ids.len() == 1 {
            let info = infos.iter().find(|i| i.segment_id == ids[0]).unwrap();
            if info.delete_count == 0 {
                continue;
            }
        }
        let mut plan = MergePlan::new(ids);
        plan.compute_data_ratio(infos);
        plans.push(plan);
    }

    MergeTask { plans }
}

fn specific_segments_task(
    params: &SpecificSegmentsParams,
    infos: &[SegmentMergeInfo],
) -> MergeTask {
    let mut plans = Vec::new();
    for group in &params.groups {
        // Ids no longer in the layout (merged away since the operator looked)
        // are silently dropped.
        let ids: Vec<SegmentId> = group
            .iter()
            .copied()
            .filter(|id| infos.iter().any(|info| info.segment_id == *id))
            .collect();
        if ids.is_empty() {
            continue;
        }
        let mut plan = MergePlan::new(ids);
        plan.compute_data_ratio(infos);
        plans.push(plan);
    }
    MergeTask { plans }
}

fn key_value_optimize_task(
    infos: &[SegmentMergeInfo],
    level_info: &LevelInfo,
) -> Result<MergeTask> {
    if level_info.topology != LevelTopology::HashMod {
        return Err(FalcataError::config(
            "key_value_optimize requires a hash-partitioned layout",
        ));
    }
    level_info.validate()?;

    let all_bottom = level_info
        .levels
        .iter()
        .flat_map(|level| &level.segment_ids)
        .all(|id| level_info.is_bottom_level(*id));
    if all_bottom {
        return Ok(MergeTask::empty());
    }

    let column_count = level_info.column_count as usize;
    let mut columns: Vec<Vec<SegmentId>> = vec![Vec::new(); column_count];
    for level in &level_info.levels {
        match level.topology {
            LevelTopology::Sequence => {
                for column in &mut columns {
                    column.extend_from_slice(&level.segment_ids);
                }
            }
            LevelTopology::HashMod => {
                for (idx, segment_id) in level.segment_ids.iter().enumerate() {
                    columns[idx % column_count].push(*segment_id);
                }
            }
        }
    }

    let mut plans = Vec::new();
    for (column, ids) in columns.into_iter().enumerate() {
        if ids.is_empty() {
            continue;
        }
        let mut plan = MergePlan::for_column(ids, column as u32);
        plan.compute_data_ratio(infos);
        plans.push(plan);
    }
    Ok(MergeTask { plans })
}

/// Maps strategy names to constructors. Built explicitly at startup and
/// passed by reference wherever planning happens.
#[derive(Debug, Default)]
pub struct MergeStrategyRegistry {
    factories: AHashMap<String, fn() -> MergeStrategy>,
}

impl MergeStrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        MergeStrategyRegistry::default()
    }

    /// A registry with every built-in strategy.
    pub fn with_defaults() -> Self {
        let mut registry = MergeStrategyRegistry::new();
        registry.register(OPTIMIZE_STRATEGY, || {
            MergeStrategy::Optimize(OptimizeParams::default())
        });
        registry.register(SPECIFIC_SEGMENTS_STRATEGY, || {
            MergeStrategy::SpecificSegments(SpecificSegmentsParams::default())
        });
        registry.register(KEY_VALUE_OPTIMIZE_STRATEGY, || {
            MergeStrategy::KeyValueOptimize
        });
        registry
    }

    /// Register a strategy constructor under `name`.
    pub fn register(&mut self, name: &str, factory: fn() -> MergeStrategy) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate the strategy registered under `name`.
    pub fn create(&self, name: &str) -> Result<MergeStrategy> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| FalcataError::config(format!("Unknown merge strategy: {name}")))
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

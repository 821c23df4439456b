//! Merge planning and execution: strategies produce [`MergeTask`]s, the
//! engine rewrites the picked segments through a [`ReclaimMap`].
//!
//! [`MergeTask`]: plan::MergeTask
//! [`ReclaimMap`]: reclaim::ReclaimMap

pub mod engine;
pub mod plan;
pub mod reclaim;
pub mod strategy;

pub use engine::{
    AttributeKind, AttributeSchema, MAX_MERGE_THREADS, MergeConfig, MergeEngine, MergeOutcome,
    MergeStats,
};
pub use plan::{MergePlan, MergeTask, TargetSegment};
pub use reclaim::{PkMergeEntry, PrimaryKeyMergeIterator, ReclaimMap, SegmentDocSource};
pub use strategy::{
    MergeStrategy, MergeStrategyRegistry, OptimizeParams, SpecificSegmentsParams,
};

//! Merge plans and tasks.

use crate::segment::{SegmentId, SegmentMergeInfo};

/// One segment a plan produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSegment {
    /// Hash column the target belongs to, for partitioned layouts.
    pub column: Option<u32>,
}

impl TargetSegment {
    pub fn plain() -> Self {
        TargetSegment { column: None }
    }

    pub fn for_column(column: u32) -> Self {
        TargetSegment {
            column: Some(column),
        }
    }
}

/// One unit of merge work: a set of source segments rewritten into one or
/// more target segments.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Source segments, in merge order.
    pub src_segment_ids: Vec<SegmentId>,

    /// Segments the plan produces.
    pub targets: Vec<TargetSegment>,

    /// Live-to-total document ratio across the sources, in `[0.0, 1.0]`.
    pub data_ratio: f64,
}

impl MergePlan {
    /// Plan merging `src_segment_ids` into one unpartitioned target.
    pub fn new(src_segment_ids: Vec<SegmentId>) -> Self {
        MergePlan {
            src_segment_ids,
            targets: vec![TargetSegment::plain()],
            data_ratio: 1.0,
        }
    }

    /// Plan producing one target in hash column `column`.
    pub fn for_column(src_segment_ids: Vec<SegmentId>, column: u32) -> Self {
        MergePlan {
            src_segment_ids,
            targets: vec![TargetSegment::for_column(column)],
            data_ratio: 1.0,
        }
    }

    /// Recompute `data_ratio` from the per-segment statistics.
    pub fn compute_data_ratio(&mut self, infos: &[SegmentMergeInfo]) {
        let mut total: u64 = 0;
        let mut live: u64 = 0;
        for info in infos {
            if self.src_segment_ids.contains(&info.segment_id) {
                total += info.doc_count as u64;
                live += info.live_count() as u64;
            }
        }
        self.data_ratio = if total == 0 {
            1.0
        } else {
            live as f64 / total as f64
        };
    }
}

/// The outcome of one planning round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeTask {
    pub plans: Vec<MergePlan>,
}

impl MergeTask {
    pub fn empty() -> Self {
        MergeTask { plans: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_ratio_from_infos() {
        let infos = vec![
            SegmentMergeInfo {
                segment_id: 1,
                doc_count: 100,
                delete_count: 25,
                level: 0,
                column: 0,
            },
            SegmentMergeInfo {
                segment_id: 2,
                doc_count: 100,
                delete_count: 0,
                level: 0,
                column: 0,
            },
        ];

        let mut plan = MergePlan::new(vec![1, 2]);
        plan.compute_data_ratio(&infos);
        assert!((plan.data_ratio - 0.875).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_task() {
        let task = MergeTask::empty();
        assert!(task.is_empty());
        assert_eq!(task.len(), 0);
    }
}

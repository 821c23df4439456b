//! Attribute (column) storage: offset tables, in-place update plumbing,
//! defragmentation, and merge-time rewriting.

pub mod defrag;
pub mod merger;
pub mod offset;
pub mod patch;
pub mod updater;

pub use defrag::{DefragConfig, DefragMetrics, DefragSliceArray, OffsetSource};
pub use merger::{
    AttributeSegmentSource, FixedStrideAttributeMerger, VarLenAttributeMerger,
    write_var_len_segment,
};
pub use offset::{CompressedOffsetReader, write_offsets};
pub use patch::PatchAttributeModifier;
pub use updater::{AttributeUpdater, BuiltAttributeSegmentModifier, PatchValue, SegmentPatchIterator};

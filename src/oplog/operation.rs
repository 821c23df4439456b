//! Document operations addressed by primary key.
//!
//! Operations are recorded against a primary key, not a doc id, so they stay
//! valid across merges. Processing resolves the key to a concrete segment and
//! local doc id (through a redo hint when the caller already knows the
//! location), applies the change, and records the resolved segment id.
//! Replay is at-least-once: an operation whose document no longer exists is a
//! benign no-op.

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::Result;
use crate::segment::{AttributeId, LocalDocId, SegmentId};
use crate::storage::{StorageInput, StorageOutput, StructReader, StructWriter};

/// Fixed-width primary key codec.
pub trait PrimaryKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Serialized width in bytes.
    const WIDTH: usize;

    fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()>;

    fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self>;
}

impl PrimaryKey for u64 {
    const WIDTH: usize = 8;

    fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_u64(*self)
    }

    fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self> {
        reader.read_u64()
    }
}

impl PrimaryKey for u128 {
    const WIDTH: usize = 16;

    fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_u128(*self)
    }

    fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self> {
        reader.read_u128()
    }
}

/// Resolved document location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocLocation {
    pub segment_id: SegmentId,
    pub doc_id: LocalDocId,
}

/// Index state an operation is applied to.
pub trait OperationTarget<P: PrimaryKey> {
    /// Locate the live document for `pk`, if any.
    fn lookup(&self, pk: &P) -> Option<DocLocation>;

    /// Mark the document at `location` deleted.
    fn remove_document(&mut self, location: DocLocation) -> Result<()>;

    /// Stage an attribute update for the document at `location`.
    fn update_attribute(
        &mut self,
        location: DocLocation,
        attr_id: AttributeId,
        value: &[u8],
        is_null: bool,
    ) -> Result<()>;
}

const OP_TAG_REMOVE: u8 = 1;
const OP_TAG_UPDATE: u8 = 2;

/// Sentinel segment id for an operation not yet resolved.
pub const SEGMENT_UNRESOLVED: SegmentId = SegmentId::MAX;

/// Remove a document by primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOperation<P: PrimaryKey> {
    pub pk: P,
    pub timestamp: u64,
    /// Segment the key resolved to; [`SEGMENT_UNRESOLVED`] until processed.
    pub segment_id: SegmentId,
}

impl<P: PrimaryKey> RemoveOperation<P> {
    pub fn new(pk: P, timestamp: u64) -> Self {
        RemoveOperation {
            pk,
            timestamp,
            segment_id: SEGMENT_UNRESOLVED,
        }
    }

    /// Apply the removal. Returns `Ok(false)` when the document is absent.
    pub fn process<T: OperationTarget<P>>(
        &mut self,
        target: &mut T,
        redo_hint: Option<DocLocation>,
    ) -> Result<bool> {
        let Some(location) = redo_hint.or_else(|| target.lookup(&self.pk)) else {
            return Ok(false);
        };
        target.remove_document(location)?;
        self.segment_id = location.segment_id;
        Ok(true)
    }
}

/// Update one attribute of a document by primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOperation<P: PrimaryKey> {
    pub pk: P,
    pub timestamp: u64,
    /// Segment the key resolved to; [`SEGMENT_UNRESOLVED`] until processed.
    pub segment_id: SegmentId,
    pub attr_id: AttributeId,
    pub value: Vec<u8>,
    pub is_null: bool,
}

impl<P: PrimaryKey> UpdateOperation<P> {
    pub fn new(pk: P, timestamp: u64, attr_id: AttributeId, value: Vec<u8>, is_null: bool) -> Self {
        UpdateOperation {
            pk,
            timestamp,
            segment_id: SEGMENT_UNRESOLVED,
            attr_id,
            value,
            is_null,
        }
    }

    /// Apply the update. Returns `Ok(false)` when the document is absent.
    pub fn process<T: OperationTarget<P>>(
        &mut self,
        target: &mut T,
        redo_hint: Option<DocLocation>,
    ) -> Result<bool> {
        let Some(location) = redo_hint.or_else(|| target.lookup(&self.pk)) else {
            return Ok(false);
        };
        target.update_attribute(location, self.attr_id, &self.value, self.is_null)?;
        self.segment_id = location.segment_id;
        Ok(true)
    }
}

/// One logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation<P: PrimaryKey> {
    Remove(RemoveOperation<P>),
    Update(UpdateOperation<P>),
}

impl<P: PrimaryKey> Operation<P> {
    pub fn pk(&self) -> P {
        match self {
            Operation::Remove(op) => op.pk,
            Operation::Update(op) => op.pk,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Operation::Remove(op) => op.timestamp,
            Operation::Update(op) => op.timestamp,
        }
    }

    /// Apply the operation; see the per-variant `process` methods.
    pub fn process<T: OperationTarget<P>>(
        &mut self,
        target: &mut T,
        redo_hint: Option<DocLocation>,
    ) -> Result<bool> {
        match self {
            Operation::Remove(op) => op.process(target, redo_hint),
            Operation::Update(op) => op.process(target, redo_hint),
        }
    }

    pub(crate) fn serialize<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        match self {
            Operation::Remove(op) => {
                writer.write_u8(OP_TAG_REMOVE)?;
                op.pk.write_to(writer)?;
                writer.write_u64(op.timestamp)?;
                writer.write_u32(op.segment_id)?;
            }
            Operation::Update(op) => {
                writer.write_u8(OP_TAG_UPDATE)?;
                op.pk.write_to(writer)?;
                writer.write_u64(op.timestamp)?;
                writer.write_u32(op.segment_id)?;
                writer.write_u32(op.attr_id)?;
                writer.write_u8(op.is_null as u8)?;
                writer.write_bytes(&op.value)?;
            }
        }
        Ok(())
    }

    pub(crate) fn load<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self> {
        use crate::error::FalcataError;

        let tag = reader.read_u8()?;
        let pk = P::read_from(reader)?;
        let timestamp = reader.read_u64()?;
        let segment_id = reader.read_u32()?;
        match tag {
            OP_TAG_REMOVE => Ok(Operation::Remove(RemoveOperation {
                pk,
                timestamp,
                segment_id,
            })),
            OP_TAG_UPDATE => {
                let attr_id = reader.read_u32()?;
                let is_null = reader.read_u8()? != 0;
                let value = reader.read_bytes()?;
                Ok(Operation::Update(UpdateOperation {
                    pk,
                    timestamp,
                    segment_id,
                    attr_id,
                    value,
                    is_null,
                }))
            }
            other => Err(FalcataError::corruption(format!(
                "Unknown operation tag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    #[derive(Debug, Default)]
    struct TestTarget {
        docs: AHashMap<u64, DocLocation>,
        removed: Vec<DocLocation>,
        updates: Vec<(DocLocation, AttributeId, Vec<u8>, bool)>,
    }

    impl OperationTarget<u64> for TestTarget {
        fn lookup(&self, pk: &u64) -> Option<DocLocation> {
            self.docs.get(pk).copied()
        }

        fn remove_document(&mut self, location: DocLocation) -> Result<()> {
            self.docs.retain(|_, loc| *loc != location);
            self.removed.push(location);
            Ok(())
        }

        fn update_attribute(
            &mut self,
            location: DocLocation,
            attr_id: AttributeId,
            value: &[u8],
            is_null: bool,
        ) -> Result<()> {
            self.updates.push((location, attr_id, value.to_vec(), is_null));
            Ok(())
        }
    }

    #[test]
    fn test_remove_resolves_and_records_segment() {
        let mut target = TestTarget::default();
        let location = DocLocation {
            segment_id: 7,
            doc_id: 3,
        };
        target.docs.insert(42, location);

        let mut op = RemoveOperation::new(42u64, 100);
        assert!(op.process(&mut target, None).unwrap());
        assert_eq!(op.segment_id, 7);
        assert_eq!(target.removed, vec![location]);
    }

    #[test]
    fn test_remove_absent_pk_is_benign() {
        let mut target = TestTarget::default();
        let mut op = RemoveOperation::new(12345u64, 100);
        assert!(!op.process(&mut target, None).unwrap());
        assert_eq!(op.segment_id, SEGMENT_UNRESOLVED);
        assert!(target.removed.is_empty());
    }

    #[test]
    fn test_update_uses_redo_hint_over_lookup() {
        let mut target = TestTarget::default();
        target.docs.insert(
            1,
            DocLocation {
                segment_id: 2,
                doc_id: 0,
            },
        );

        let hint = DocLocation {
            segment_id: 9,
            doc_id: 5,
        };
        let mut op = UpdateOperation::new(1u64, 50, 0, b"v".to_vec(), false);
        assert!(op.process(&mut target, Some(hint)).unwrap());
        assert_eq!(op.segment_id, 9);
        assert_eq!(target.updates[0].0, hint);
    }
}

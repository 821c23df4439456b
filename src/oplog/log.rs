//! Append-only operation log.
//!
//! Records are written sequentially and never rewritten; readers scan from
//! the start to end of file. Replay is in arrival order, so the last logged
//! operation for a primary key wins.

use std::marker::PhantomData;

use crate::error::Result;
use crate::oplog::operation::{DocLocation, Operation, OperationTarget, PrimaryKey};
use crate::storage::{Storage, StructReader, StructWriter, StorageInput, StorageOutput};

/// Appends operations to a log file.
pub struct OperationLogWriter<P: PrimaryKey> {
    writer: StructWriter<Box<dyn StorageOutput>>,
    appended: u64,
    _pk: PhantomData<P>,
}

impl<P: PrimaryKey> OperationLogWriter<P> {
    /// Open `path` for appending, creating it when absent.
    pub fn open(storage: &dyn Storage, path: &str) -> Result<Self> {
        let output = if storage.file_exists(path) {
            storage.create_output_append(path)?
        } else {
            storage.create_output(path)?
        };
        Ok(OperationLogWriter {
            writer: StructWriter::new(output),
            appended: 0,
            _pk: PhantomData,
        })
    }

    /// Append one operation.
    pub fn append(&mut self, op: &Operation<P>) -> Result<()> {
        op.serialize(&mut self.writer)?;
        self.appended += 1;
        Ok(())
    }

    /// Operations appended through this writer.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Flush and close the log.
    pub fn close(self) -> Result<()> {
        self.writer.close()
    }
}

/// Sequential reader over a log file.
pub struct OperationLogReader<P: PrimaryKey> {
    reader: StructReader<Box<dyn StorageInput>>,
    _pk: PhantomData<P>,
}

impl<P: PrimaryKey> OperationLogReader<P> {
    pub fn open(storage: &dyn Storage, path: &str) -> Result<Self> {
        let input = storage.open_input(path)?;
        Ok(OperationLogReader {
            reader: StructReader::new(input)?,
            _pk: PhantomData,
        })
    }

    /// Next operation, or `None` at end of log.
    pub fn next_operation(&mut self) -> Result<Option<Operation<P>>> {
        if self.reader.is_eof() {
            return Ok(None);
        }
        Operation::load(&mut self.reader).map(Some)
    }
}

/// Outcome of a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Operations that resolved to a live document and were applied.
    pub applied: u64,

    /// Operations whose document was already gone.
    pub skipped: u64,
}

/// Replays a log against a target, in order.
#[derive(Debug, Default)]
pub struct OperationReplayer;

impl OperationReplayer {
    /// Replay every operation in `reader` against `target`.
    ///
    /// Operations carrying a resolved segment id are replayed with a fresh
    /// lookup all the same; the key may have moved since the log was written.
    pub fn replay<P: PrimaryKey, T: OperationTarget<P>>(
        &self,
        reader: &mut OperationLogReader<P>,
        target: &mut T,
    ) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        while let Some(mut op) = reader.next_operation()? {
            let hint: Option<DocLocation> = None;
            if op.process(target, hint)? {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }
        Ok(stats)
    }
}

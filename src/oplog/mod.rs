//! Primary-key-addressed operation log: remove/update operations, append-only
//! log files, and in-order replay.

pub mod log;
pub mod operation;

pub use log::{OperationLogReader, OperationLogWriter, OperationReplayer, ReplayStats};
pub use operation::{
    DocLocation, Operation, OperationTarget, PrimaryKey, RemoveOperation, SEGMENT_UNRESOLVED,
    UpdateOperation,
};

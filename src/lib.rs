//! # Falcata
//!
//! Segment merge and attribute reconciliation for a columnar document store.
//!
//! ## Features
//!
//! - Pluggable merge strategies (optimize, operator-specified, key-value)
//! - Dense doc-id reclamation with primary-key deduplication
//! - Fixed-stride and variable-length attribute rewriting with patch replay
//! - Run-compressed offset tables with zero-copy mmap reads
//! - Primary-key-addressed operation log with idempotent replay
//! - Copying defragmentation for variable-length value slices
//! - Pluggable storage backends

pub mod attribute;
pub mod error;
pub mod merge;
pub mod oplog;
pub mod segment;
pub mod storage;
pub mod util;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

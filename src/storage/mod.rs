//! Storage abstraction layer for Falcata.
//!
//! Pluggable storage backends behind the [`Storage`] trait: an in-memory
//! backend for tests and a file-system backend for production, optionally
//! serving memory-mapped inputs. [`StructWriter`]/[`StructReader`] provide
//! checksummed binary framing on top of any backend.
//!
//! Names are flat, `/`-separated paths; a "directory" is a name prefix, which
//! is what the prefix-level rename/delete operations act on.

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

// Re-export commonly used types
pub use file::*;
pub use memory::*;
pub use structured::*;
pub use traits::*;

//! Job store backends
//!
//! The scheduler records job lifecycle and token usage through the
//! `JobStore` trait. `MemoryJobStore` is the default; `SqliteJobStore`
//! persists across restarts.

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use traits::{JobStore, OpenStore, StatusCounts, StorageError, StorageResult};

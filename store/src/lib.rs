//! Persistence stage.
//!
//! Drains the tick-data queue in batches, streams each chunk into an
//! immutable batch file under a run-id-prefixed path, publishes a
//! `BatchInfo` on the notification topic and acknowledges the batch.
//! Redelivered chunks are filtered through an idempotency tracker keyed by
//! the chunk's first tick.

mod batch_files;
mod idempotency;
mod service;
#[cfg(test)]
mod tests;

pub use batch_files::{BatchStorage, BatchWriter, ChunkFileIter, FileBatchStorage};
pub use idempotency::{IdempotencyTracker, MemoryIdempotencyTracker};
pub use service::{PersistConfig, PersistCounters, PersistService};

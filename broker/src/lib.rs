//! Bounded streaming broker.
//!
//! Two behaviourally interchangeable variants sit behind one contract: a
//! bounded in-memory FIFO and a journaled on-disk queue. Producers block on
//! capacity; consumers drain batches under a drain token that serialises the
//! receive window, so competing consumers always see disjoint, consecutive
//! slices of the stream while processing in parallel.

mod journal;
mod memory;
mod segments;
mod token;

pub use journal::{JournalBroker, JournalConfig};
pub use memory::MemoryBroker;

use primordia_error::Error;
use std::time::Duration;

/// Which side of the queue a usage question is asked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageContext {
    /// The writing side
    Producer,
    /// The draining side
    Consumer,
}

/// Coarse resource activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageState {
    /// The context can make progress right now
    Active,
    /// Consumer context: the queue is empty; producer context: at capacity
    Waiting,
}

/// Usage state plus a monitoring-quality marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReport {
    /// The observed state
    pub state: UsageState,
    /// True when the backend could not be consulted and the state is a
    /// fallback rather than an observation
    pub degraded: bool,
}

impl UsageReport {
    pub(crate) fn observed(state: UsageState) -> UsageReport {
        UsageReport {
            state,
            degraded: false,
        }
    }
}

/// A drained batch holding item references with commit/rollback semantics.
///
/// Iteration is ordered and lazy where the item storage is external: the
/// journaled variant materialises one item per `next_item` call. Dropping or
/// closing an uncommitted batch returns its items to the queue.
pub trait StreamingBatch<T>: Send {
    /// Number of items drained into this batch.
    fn len(&self) -> usize;

    /// Whether the batch is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialises the next item, in drain order.
    fn next_item(&mut self) -> Option<Result<T, Error>>;

    /// Acknowledges every item in the batch.
    fn commit(&mut self) -> Result<(), Error>;

    /// Releases batch resources; an uncommitted batch is rolled back for
    /// redelivery where the variant supports it.
    fn close(&mut self) -> Result<(), Error>;
}

/// The broker contract shared by both variants.
pub trait Broker<T>: Send + Sync {
    /// Non-blocking enqueue; false when the queue is at capacity.
    fn offer(&self, item: T) -> Result<bool, Error>;

    /// Blocking enqueue; waits for capacity or a stop signal.
    fn put(&self, item: T) -> Result<(), Error>;

    /// Enqueue waiting up to `timeout` for capacity; false on timeout.
    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<bool, Error>;

    /// Blocking bulk enqueue, preserving order.
    fn put_all(&self, items: Vec<T>) -> Result<(), Error> {
        for item in items {
            self.put(item)?;
        }
        Ok(())
    }

    /// Non-blocking bulk enqueue; returns how many items were accepted.
    fn offer_all(&self, items: Vec<T>) -> Result<usize, Error> {
        let mut accepted = 0;
        for item in items {
            if !self.offer(item)? {
                break;
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Drains the next batch under the drain token.
    ///
    /// Waits up to `timeout` for the token and, when the queue is empty, for
    /// a first item. The token is released before this returns, so multiple
    /// consumers process their batches in parallel while the receive windows
    /// stay serialised.
    fn receive_batch(
        &self,
        max_size: usize,
        timeout: Duration,
    ) -> Result<Box<dyn StreamingBatch<T>>, Error>;

    /// Usage state as seen from `context`.
    fn usage(&self, context: UsageContext) -> UsageReport;

    /// Items accepted since construction.
    fn produced_count(&self) -> u64;
}

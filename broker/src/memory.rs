//! The in-memory broker variant.
//!
//! A bounded crossbeam FIFO. Items leave the queue at drain time, so
//! `commit`/`close` on the batch are no-ops and capacity is freed as soon as
//! a batch is drained. Capacity is counted in items.

use crate::token::DrainToken;
use crate::{Broker, StreamingBatch, UsageContext, UsageReport, UsageState};
use primordia_channel::{bounded, never, select, Receiver, SendTimeoutError, Sender, TrySendError};
use primordia_error::{Error, ErrorKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded in-memory broker.
pub struct MemoryBroker<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    token: DrainToken,
    produced: AtomicU64,
    coalescing_delay: Duration,
    stop_rx: Receiver<()>,
}

impl<T: Send + 'static> MemoryBroker<T> {
    /// Creates a broker bounded to `capacity` items.
    pub fn new(capacity: usize) -> MemoryBroker<T> {
        let (tx, rx) = bounded(capacity);
        MemoryBroker {
            tx,
            rx,
            token: DrainToken::new(),
            produced: AtomicU64::new(0),
            coalescing_delay: Duration::ZERO,
            stop_rx: never(),
        }
    }

    /// Sets the adaptive coalescing delay applied when a batch would
    /// otherwise carry a single item.
    pub fn coalescing_delay(mut self, delay: Duration) -> Self {
        self.coalescing_delay = delay;
        self
    }

    /// Wires a stop signal that unblocks producers promptly.
    pub fn stop_signal(mut self, stop_rx: Receiver<()>) -> Self {
        self.stop_rx = stop_rx;
        self
    }

    fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: Send + 'static> Broker<T> for MemoryBroker<T> {
    fn offer(&self, item: T) -> Result<bool, Error> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.record_produced();
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => {
                Err(ErrorKind::ResourceUnavailable.other("queue disconnected"))
            }
        }
    }

    fn put(&self, item: T) -> Result<(), Error> {
        select! {
            send(self.tx, item) -> res => {
                res.map_err(|_| ErrorKind::ResourceUnavailable.other("queue disconnected"))?;
                self.record_produced();
                Ok(())
            }
            recv(self.stop_rx) -> _ => {
                Err(ErrorKind::ResourceUnavailable.other("stop requested while waiting for capacity"))
            }
        }
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<bool, Error> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => {
                self.record_produced();
                Ok(true)
            }
            Err(SendTimeoutError::Timeout(_)) => Ok(false),
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(ErrorKind::ResourceUnavailable.other("queue disconnected"))
            }
        }
    }

    fn receive_batch(
        &self,
        max_size: usize,
        timeout: Duration,
    ) -> Result<Box<dyn StreamingBatch<T>>, Error> {
        debug_assert!(max_size > 0);
        let started = Instant::now();
        let guard = self.token.acquire(timeout)?;

        let mut items = VecDeque::with_capacity(max_size);
        while items.len() < max_size {
            match self.rx.try_recv() {
                Ok(item) => items.push_back(item),
                Err(_) => break,
            }
        }

        if items.is_empty() {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                guard.release()?;
                return Ok(Box::new(MemoryBatch { items }));
            }
            match self.rx.recv_timeout(remaining) {
                Ok(item) => items.push_back(item),
                Err(_) => {
                    guard.release()?;
                    return Ok(Box::new(MemoryBatch { items }));
                }
            }

            if self.rx.is_empty() && !self.coalescing_delay.is_zero() {
                std::thread::sleep(self.coalescing_delay);
            }

            while items.len() < max_size {
                match self.rx.try_recv() {
                    Ok(item) => items.push_back(item),
                    Err(_) => break,
                }
            }
        }

        guard.release()?;
        Ok(Box::new(MemoryBatch { items }))
    }

    fn usage(&self, context: UsageContext) -> UsageReport {
        let state = match context {
            UsageContext::Consumer if self.rx.is_empty() => UsageState::Waiting,
            UsageContext::Producer if self.tx.is_full() => UsageState::Waiting,
            _ => UsageState::Active,
        };
        UsageReport::observed(state)
    }

    fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

/// Batch of already-materialised items; commit and close are no-ops because
/// the queue forgot the items at drain time.
struct MemoryBatch<T> {
    items: VecDeque<T>,
}

impl<T: Send> StreamingBatch<T> for MemoryBatch<T> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn next_item(&mut self) -> Option<Result<T, Error>> {
        self.items.pop_front().map(Ok)
    }

    fn commit(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

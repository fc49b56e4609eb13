//! The journaled broker variant.
//!
//! Messages are framed in self-describing envelopes and appended to an
//! on-disk journal; consumers drain lightweight sequence references and
//! materialise items one at a time while iterating. Capacity is counted in
//! stored bytes with a BLOCK policy: producers wait while the un-acked
//! backlog exceeds the limit. `commit` durably advances the ack cursor,
//! `close` on an uncommitted batch rewinds the read cursor so the broker
//! redelivers on the next receive (transacted semantics).

use crate::segments::{SegmentedJournal, FRAME_HEADER_LEN};
use crate::token::DrainToken;
use crate::{Broker, StreamingBatch, UsageContext, UsageReport, UsageState};
use parking_lot::{Condvar, Mutex};
use primordia_error::{Error, ErrorKind};
use primordia_logger::{debug, warn};
use primordia_types::{Envelope, WireMessage};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ACK_FILE_NAME: &str = "ACK";
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration of a journaled broker.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Journal directory, created when missing
    pub path: PathBuf,
    /// Byte limit of the un-acked backlog
    pub max_size_bytes: u64,
    /// Adaptive coalescing delay of the receive path
    pub coalescing_delay: Duration,
}

struct JournalState {
    log: SegmentedJournal,
    /// next sequence to hand to a consumer
    read_seq: u64,
    /// everything below this is durably acknowledged
    ack_seq: u64,
    /// out-of-order committed ranges, start -> end, waiting for the prefix
    committed: BTreeMap<u64, u64>,
    /// logical size per un-acked record; the backlog accounting stays in
    /// pre-compression bytes so the BLOCK policy is stable
    entry_sizes: BTreeMap<u64, u64>,
    unacked_bytes: u64,
    stopped: bool,
    degraded: bool,
}

impl JournalState {
    /// First drainable sequence at or after `from`, skipping ranges that
    /// were committed out of order.
    fn next_available(&self, mut from: u64) -> Option<u64> {
        loop {
            if from >= self.log.count() {
                return None;
            }
            match self
                .committed
                .range(..=from)
                .next_back()
                .filter(|(_, end)| **end > from)
            {
                Some((_, end)) => from = *end,
                None => return Some(from),
            }
        }
    }

    fn has_available(&self) -> bool {
        self.next_available(self.read_seq).is_some()
    }
}

struct JournalInner {
    state: Mutex<JournalState>,
    space_cond: Condvar,
    items_cond: Condvar,
    token: DrainToken,
    produced: AtomicU64,
    ack_path: PathBuf,
    max_size_bytes: u64,
    coalescing_delay: Duration,
}

impl JournalInner {
    fn persist_ack(&self, ack_seq: u64) -> Result<(), Error> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.ack_path)?;
        file.write_all(&ack_seq.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Journal-backed broker, the off-heap variant of the contract.
pub struct JournalBroker<T> {
    inner: Arc<JournalInner>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: WireMessage + Send + 'static> JournalBroker<T> {
    /// Opens the journal at `config.path`, repairing and resuming the ack
    /// cursor from the previous run.
    pub fn open(config: JournalConfig) -> Result<JournalBroker<T>, Error> {
        if config.max_size_bytes == 0 {
            return Err(ErrorKind::ConfigInvalid.other("max_size_bytes must be positive"));
        }
        let log = SegmentedJournal::open(config.path.clone())
            .map_err(|e| ErrorKind::ResourceUnavailable.other(format!("journal open: {}", e)))?;

        let ack_path = config.path.join(ACK_FILE_NAME);
        let ack_seq = match fs::read(&ack_path) {
            Ok(bytes) if bytes.len() == 8 => {
                u64::from_le_bytes(bytes.try_into().expect("checked length"))
            }
            _ => 0,
        };
        let ack_seq = ack_seq.min(log.count());

        // after a restart the logical sizes are approximated by the stored
        // sizes; they converge as the backlog drains
        let mut entry_sizes = BTreeMap::new();
        let mut unacked_bytes = 0u64;
        for seq in ack_seq..log.count() {
            let size = log.stored_size(seq).ok_or_else(|| {
                ErrorKind::ResourceUnavailable
                    .other(format!("journal scan: record {} missing", seq))
            })?;
            entry_sizes.insert(seq, size);
            unacked_bytes += size;
        }
        debug!(
            "journal opened with {} records, {} acked, {} backlog bytes",
            log.count(),
            ack_seq,
            unacked_bytes
        );

        Ok(JournalBroker {
            inner: Arc::new(JournalInner {
                state: Mutex::new(JournalState {
                    log,
                    read_seq: ack_seq,
                    ack_seq,
                    committed: BTreeMap::new(),
                    entry_sizes,
                    unacked_bytes,
                    stopped: false,
                    degraded: false,
                }),
                space_cond: Condvar::new(),
                items_cond: Condvar::new(),
                token: DrainToken::new(),
                produced: AtomicU64::new(0),
                ack_path,
                max_size_bytes: config.max_size_bytes,
                coalescing_delay: config.coalescing_delay,
            }),
            _marker: PhantomData,
        })
    }

    /// Signals shutdown: blocked producers and receivers return promptly
    /// with a resource error distinguishable from a timeout.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        self.inner.space_cond.notify_all();
        self.inner.items_cond.notify_all();
    }

    fn encode(item: &T) -> Result<Vec<u8>, Error> {
        Envelope::pack(item)?.encode()
    }

    fn append_locked(&self, state: &mut JournalState, bytes: &[u8]) -> Result<(), Error> {
        let seq = match state.log.append(bytes) {
            Ok((seq, _stored)) => seq,
            Err(e) => {
                state.degraded = true;
                return Err(ErrorKind::Internal.other(format!("journal append: {}", e)));
            }
        };
        let logical = bytes.len() as u64 + FRAME_HEADER_LEN;
        state.entry_sizes.insert(seq, logical);
        state.unacked_bytes += logical;
        self.inner.produced.fetch_add(1, Ordering::Relaxed);
        self.inner.items_cond.notify_all();
        Ok(())
    }

    fn fits(&self, state: &JournalState, len: usize) -> bool {
        // never wedge on a single oversized item
        state.unacked_bytes == 0
            || state.unacked_bytes + len as u64 <= self.inner.max_size_bytes
    }
}

impl<T: WireMessage + Send + 'static> Broker<T> for JournalBroker<T> {
    fn offer(&self, item: T) -> Result<bool, Error> {
        let bytes = Self::encode(&item)?;
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(ErrorKind::ResourceUnavailable.other("journal is shut down"));
        }
        if !self.fits(&state, bytes.len()) {
            return Ok(false);
        }
        self.append_locked(&mut state, &bytes)?;
        Ok(true)
    }

    fn put(&self, item: T) -> Result<(), Error> {
        let bytes = Self::encode(&item)?;
        let mut state = self.inner.state.lock();
        loop {
            if state.stopped {
                return Err(
                    ErrorKind::ResourceUnavailable.other("stop requested while waiting for space")
                );
            }
            if self.fits(&state, bytes.len()) {
                return self.append_locked(&mut state, &bytes);
            }
            self.inner
                .space_cond
                .wait_for(&mut state, BLOCK_POLL_INTERVAL);
        }
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<bool, Error> {
        let bytes = Self::encode(&item)?;
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.stopped {
                return Err(
                    ErrorKind::ResourceUnavailable.other("stop requested while waiting for space")
                );
            }
            if self.fits(&state, bytes.len()) {
                self.append_locked(&mut state, &bytes)?;
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = (deadline - now).min(BLOCK_POLL_INTERVAL);
            self.inner.space_cond.wait_for(&mut state, wait);
        }
    }

    fn receive_batch(
        &self,
        max_size: usize,
        timeout: Duration,
    ) -> Result<Box<dyn StreamingBatch<T>>, Error> {
        debug_assert!(max_size > 0);
        let started = Instant::now();
        let guard = self.inner.token.acquire(timeout)?;

        let mut seqs: Vec<u64> = Vec::with_capacity(max_size);
        {
            let mut state = self.inner.state.lock();
            drain_available(&mut state, &mut seqs, max_size);

            if seqs.is_empty() {
                // wait for a first item inside the remaining window
                loop {
                    if state.stopped {
                        break;
                    }
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        break;
                    }
                    if state.has_available() {
                        break;
                    }
                    self.inner
                        .items_cond
                        .wait_for(&mut state, remaining.min(BLOCK_POLL_INTERVAL));
                }
                drain_available(&mut state, &mut seqs, 1);

                if !seqs.is_empty() {
                    if !state.has_available() && !self.inner.coalescing_delay.is_zero() {
                        drop(state);
                        std::thread::sleep(self.inner.coalescing_delay);
                        state = self.inner.state.lock();
                    }
                    drain_available(&mut state, &mut seqs, max_size);
                }
            }
        }

        guard.release()?;

        let start_seq = seqs.first().copied();
        Ok(Box::new(JournalBatch {
            inner: Arc::clone(&self.inner),
            seqs,
            start_seq,
            cursor: 0,
            committed: false,
            closed: false,
            _marker: PhantomData::<fn(T) -> T>,
        }))
    }

    fn usage(&self, context: UsageContext) -> UsageReport {
        let state = self.inner.state.lock();
        let usage_state = match context {
            UsageContext::Consumer if !state.has_available() => UsageState::Waiting,
            UsageContext::Producer if state.unacked_bytes >= self.inner.max_size_bytes => {
                UsageState::Waiting
            }
            _ => UsageState::Active,
        };
        UsageReport {
            state: usage_state,
            degraded: state.degraded,
        }
    }

    fn produced_count(&self) -> u64 {
        self.inner.produced.load(Ordering::Relaxed)
    }
}

fn drain_available(state: &mut JournalState, seqs: &mut Vec<u64>, max_size: usize) {
    while seqs.len() < max_size {
        match state.next_available(state.read_seq) {
            Some(seq) => {
                seqs.push(seq);
                state.read_seq = seq + 1;
            }
            None => break,
        }
    }
}

/// A drained slice of the journal held as sequence references; items are
/// deserialised one at a time while iterating.
struct JournalBatch<T> {
    inner: Arc<JournalInner>,
    seqs: Vec<u64>,
    start_seq: Option<u64>,
    cursor: usize,
    committed: bool,
    closed: bool,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: WireMessage + Send + 'static> StreamingBatch<T> for JournalBatch<T> {
    fn len(&self) -> usize {
        self.seqs.len()
    }

    fn next_item(&mut self) -> Option<Result<T, Error>> {
        let seq = *self.seqs.get(self.cursor)?;
        self.cursor += 1;
        let mut state = self.inner.state.lock();
        let bytes = match state.log.read(seq) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Some(Err(
                    ErrorKind::Internal.other(format!("journal record {} missing", seq))
                ))
            }
            Err(e) => {
                state.degraded = true;
                return Some(Err(
                    ErrorKind::Internal.other(format!("journal read {}: {}", seq, e))
                ));
            }
        };
        drop(state);
        Some(Envelope::decode(&bytes).and_then(|envelope| envelope.unpack::<T>()))
    }

    fn commit(&mut self) -> Result<(), Error> {
        if self.committed || self.seqs.is_empty() {
            self.committed = true;
            return Ok(());
        }
        let start = self.start_seq.expect("non-empty batch has a start");
        let end = *self.seqs.last().expect("non-empty batch has an end") + 1;

        let mut state = self.inner.state.lock();
        state.committed.insert(start, end);
        // fold the contiguous committed prefix into the ack cursor
        while let Some((&s, &e)) = state.committed.iter().next() {
            if s > state.ack_seq {
                break;
            }
            state.committed.remove(&s);
            if e > state.ack_seq {
                state.ack_seq = e;
            }
        }
        let ack_seq = state.ack_seq;
        self.inner.persist_ack(ack_seq).map_err(|e| {
            state.degraded = true;
            ErrorKind::Internal.other(format!("ack persist: {}", e))
        })?;

        for &seq in &self.seqs {
            if let Some(size) = state.entry_sizes.remove(&seq) {
                state.unacked_bytes = state.unacked_bytes.saturating_sub(size);
            }
        }
        if let Err(e) = state.log.prune_below(ack_seq) {
            warn!("journal prune failed: {}", e);
        }
        self.inner.space_cond.notify_all();
        self.committed = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.committed {
            if let Some(start) = self.start_seq {
                let mut state = self.inner.state.lock();
                if start < state.read_seq {
                    state.read_seq = start;
                }
                self.inner.items_cond.notify_all();
            }
        }
        Ok(())
    }
}

impl<T> Drop for JournalBatch<T> {
    fn drop(&mut self) {
        if !self.closed && !self.committed {
            if let Some(start) = self.start_seq {
                let mut state = self.inner.state.lock();
                if start < state.read_seq {
                    state.read_seq = start;
                }
                self.inner.items_cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_types::BatchInfo;
    use std::thread;

    fn info(tick: u64) -> BatchInfo {
        BatchInfo {
            simulation_run_id: "run".to_string(),
            storage_path: format!("run/batch-{}", tick),
            tick_start: tick,
            tick_end: tick,
            written_at_ms: 0,
        }
    }

    fn open(dir: &std::path::Path, max_bytes: u64) -> JournalBroker<BatchInfo> {
        JournalBroker::open(JournalConfig {
            path: dir.to_path_buf(),
            max_size_bytes: max_bytes,
            coalescing_delay: Duration::ZERO,
        })
        .unwrap()
    }

    fn drain(batch: &mut Box<dyn StreamingBatch<BatchInfo>>) -> Vec<u64> {
        let mut ticks = Vec::new();
        while let Some(item) = batch.next_item() {
            ticks.push(item.unwrap().tick_start);
        }
        ticks
    }

    #[test]
    fn put_receive_commit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let broker = open(dir.path(), 1 << 20);
        for tick in 0..5 {
            broker.put(info(tick)).unwrap();
        }
        let mut batch = broker.receive_batch(8, Duration::from_millis(100)).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(drain(&mut batch), vec![0, 1, 2, 3, 4]);
        batch.commit().unwrap();
        batch.close().unwrap();

        let batch = broker.receive_batch(8, Duration::from_millis(20)).unwrap();
        assert!(batch.is_empty());
    }

    /// Scenario: a consumer receives a batch, its write fails and the batch
    /// is closed without commit. The next receive returns the same items.
    #[test]
    fn close_without_commit_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = open(dir.path(), 1 << 20);
        for tick in [10, 11, 12] {
            broker.put(info(tick)).unwrap();
        }

        let mut batch = broker.receive_batch(8, Duration::from_millis(100)).unwrap();
        assert_eq!(drain(&mut batch), vec![10, 11, 12]);
        batch.close().unwrap();

        let mut redelivered = broker.receive_batch(8, Duration::from_millis(100)).unwrap();
        assert_eq!(drain(&mut redelivered), vec![10, 11, 12]);
        redelivered.commit().unwrap();

        let batch = broker.receive_batch(8, Duration::from_millis(20)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn ack_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let broker = open(dir.path(), 1 << 20);
            for tick in 0..4 {
                broker.put(info(tick)).unwrap();
            }
            let mut batch = broker.receive_batch(2, Duration::from_millis(100)).unwrap();
            assert_eq!(drain(&mut batch), vec![0, 1]);
            batch.commit().unwrap();
            // 2 and 3 drained but never committed
            let mut lost = broker.receive_batch(2, Duration::from_millis(100)).unwrap();
            assert_eq!(drain(&mut lost), vec![2, 3]);
            lost.close().unwrap();
        }
        let broker = open(dir.path(), 1 << 20);
        let mut batch = broker.receive_batch(8, Duration::from_millis(100)).unwrap();
        assert_eq!(drain(&mut batch), vec![2, 3]);
        batch.commit().unwrap();
    }

    #[test]
    fn byte_capacity_blocks_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let one_item =
            Envelope::pack(&info(0)).unwrap().encode().unwrap().len() as u64 + FRAME_HEADER_LEN;
        let broker = Arc::new(open(dir.path(), 3 * one_item));
        for tick in 0..3 {
            broker.put(info(tick)).unwrap();
        }
        assert!(!broker.offer(info(3)).unwrap());
        assert_eq!(
            broker.usage(UsageContext::Producer).state,
            UsageState::Waiting
        );

        let producer = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.put(info(3)))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let mut batch = broker.receive_batch(2, Duration::from_millis(100)).unwrap();
        drain(&mut batch);
        batch.commit().unwrap();
        producer.join().unwrap().unwrap();
    }

    #[test]
    fn shutdown_unblocks_producer_distinguishably() {
        let dir = tempfile::tempdir().unwrap();
        let one_item =
            Envelope::pack(&info(0)).unwrap().encode().unwrap().len() as u64 + FRAME_HEADER_LEN;
        let broker = Arc::new(open(dir.path(), one_item));
        broker.put(info(0)).unwrap();

        let producer = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.put(info(1)))
        };
        thread::sleep(Duration::from_millis(30));
        broker.shutdown();
        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn type_url_mismatch_is_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let broker = open(dir.path(), 1 << 20);
        broker.put(info(7)).unwrap();
        drop(broker);

        // same journal read back expecting a different message type
        let broker: JournalBroker<primordia_types::SimulationMetadata> =
            JournalBroker::open(JournalConfig {
                path: dir.path().to_path_buf(),
                max_size_bytes: 1 << 20,
                coalescing_delay: Duration::ZERO,
            })
            .unwrap();
        let mut batch = broker.receive_batch(1, Duration::from_millis(100)).unwrap();
        let err = batch.next_item().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationFailed);
        batch.close().unwrap();
    }
}

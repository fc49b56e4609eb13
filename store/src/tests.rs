use crate::{
    BatchStorage, BatchWriter, FileBatchStorage, IdempotencyTracker, MemoryIdempotencyTracker,
    PersistConfig, PersistService,
};
use primordia_broker::{Broker, JournalBroker, JournalConfig, MemoryBroker};
use primordia_error::{Error, ErrorKind};
use primordia_types::{BatchInfo, TickData, TickDataChunk};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn chunk(first: u64, count: u32) -> TickDataChunk {
    TickDataChunk {
        run_id: "run-1".to_string(),
        total_cells: 16,
        first_tick: first,
        last_tick: first + u64::from(count) - 1,
        tick_count: count,
        snapshot: TickData {
            tick_number: first,
            cells: Vec::new(),
            organisms: Vec::new(),
            plugins: Vec::new(),
            rng_state: Vec::new(),
        },
        samples: Vec::new(),
    }
}

fn config() -> PersistConfig {
    PersistConfig {
        max_batch_size: 8,
        batch_timeout: Duration::from_millis(100),
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn config_validation_fails_fast() {
    let queue: Arc<dyn Broker<TickDataChunk>> = Arc::new(MemoryBroker::new(4));
    let topic: Arc<dyn Broker<BatchInfo>> = Arc::new(MemoryBroker::new(4));
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileBatchStorage::new(dir.path()));
    let err = match PersistService::new(
        "run-1".to_string(),
        queue,
        topic,
        storage,
        None,
        PersistConfig {
            max_batch_size: 0,
            batch_timeout: Duration::from_secs(1),
        },
    ) {
        Err(err) => err,
        Ok(_) => panic!("expected invalid config to be rejected"),
    };
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn writes_notifies_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let queue: Arc<MemoryBroker<TickDataChunk>> = Arc::new(MemoryBroker::new(16));
    let topic: Arc<MemoryBroker<BatchInfo>> = Arc::new(MemoryBroker::new(16));
    let storage = Arc::new(FileBatchStorage::new(dir.path()));
    let tracker = Arc::new(MemoryIdempotencyTracker::new());

    let service = PersistService::new(
        "run-1".to_string(),
        Arc::clone(&queue) as Arc<dyn Broker<TickDataChunk>>,
        Arc::clone(&topic) as Arc<dyn Broker<BatchInfo>>,
        Arc::clone(&storage) as Arc<dyn BatchStorage>,
        Some(Arc::clone(&tracker) as Arc<dyn IdempotencyTracker>),
        config(),
    )
    .unwrap();
    let (mut handle, counters) = service.start("PersistService");

    for first in [0u64, 8, 16] {
        queue.put(chunk(first, 8)).unwrap();
    }
    wait_until("chunks persisted", || counters.chunks_written() == 3);
    wait_until("batch committed", || counters.batches_written() >= 1);
    handle.stop();

    // notification describes the written range and the file is readable
    let mut batch = topic.receive_batch(8, Duration::from_millis(100)).unwrap();
    let mut infos = Vec::new();
    while let Some(item) = batch.next_item() {
        infos.push(item.unwrap());
    }
    batch.commit().unwrap();
    assert!(!infos.is_empty());
    assert_eq!(infos[0].tick_start, 0);
    assert_eq!(infos.last().unwrap().tick_end, 23);

    let mut read_back = 0;
    for info in &infos {
        for chunk in storage.read_chunks(&info.storage_path).unwrap() {
            chunk.unwrap();
            read_back += 1;
        }
    }
    assert_eq!(read_back, 3);
    assert!(tracker.is_processed(0));
    assert!(tracker.is_processed(16));
}

#[test]
fn duplicates_are_counted_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let queue: Arc<MemoryBroker<TickDataChunk>> = Arc::new(MemoryBroker::new(16));
    let topic: Arc<MemoryBroker<BatchInfo>> = Arc::new(MemoryBroker::new(16));
    let storage = Arc::new(FileBatchStorage::new(dir.path()));
    let tracker = Arc::new(MemoryIdempotencyTracker::new());
    tracker.mark_processed(0);
    tracker.mark_processed(8);

    let service = PersistService::new(
        "run-1".to_string(),
        Arc::clone(&queue) as Arc<dyn Broker<TickDataChunk>>,
        Arc::clone(&topic) as Arc<dyn Broker<BatchInfo>>,
        storage as Arc<dyn BatchStorage>,
        Some(Arc::clone(&tracker) as Arc<dyn IdempotencyTracker>),
        config(),
    )
    .unwrap();
    let (mut handle, counters) = service.start("PersistService");

    queue.put(chunk(0, 8)).unwrap();
    queue.put(chunk(8, 8)).unwrap();
    wait_until("duplicates skipped", || counters.duplicates() == 2);
    assert_eq!(counters.batches_written(), 0);
    assert_eq!(counters.chunks_written(), 0);
    handle.stop();

    // a batch of pure duplicates publishes nothing
    let batch = topic.receive_batch(8, Duration::from_millis(50)).unwrap();
    assert!(batch.is_empty());
}

/// Two competing persistence services over one queue: the drain token gives
/// each a disjoint consecutive slice and together they persist every chunk
/// exactly once.
#[test]
fn competing_persist_services_cover_the_stream_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue: Arc<MemoryBroker<TickDataChunk>> = Arc::new(MemoryBroker::new(64));
    let topic: Arc<MemoryBroker<BatchInfo>> = Arc::new(MemoryBroker::new(64));
    let storage = Arc::new(FileBatchStorage::new(dir.path()));
    let tracker = Arc::new(MemoryIdempotencyTracker::new());

    let mut handles = Vec::new();
    let mut all_counters = Vec::new();
    for name in ["Persist-0", "Persist-1"] {
        let service = PersistService::new(
            "run-1".to_string(),
            Arc::clone(&queue) as Arc<dyn Broker<TickDataChunk>>,
            Arc::clone(&topic) as Arc<dyn Broker<BatchInfo>>,
            Arc::clone(&storage) as Arc<dyn BatchStorage>,
            Some(Arc::clone(&tracker) as Arc<dyn IdempotencyTracker>),
            PersistConfig {
                max_batch_size: 4,
                batch_timeout: Duration::from_millis(100),
            },
        )
        .unwrap();
        let (handle, counters) = service.start(name);
        handles.push(handle);
        all_counters.push(counters);
    }

    for first in (0..80).map(|i| i * 8) {
        queue.put(chunk(first, 8)).unwrap();
    }
    wait_until("all chunks persisted", || {
        all_counters.iter().map(|c| c.chunks_written()).sum::<u64>() == 80
    });
    for handle in &mut handles {
        handle.stop();
    }

    // nothing was delivered to both consumers
    assert_eq!(
        all_counters.iter().map(|c| c.duplicates()).sum::<u64>(),
        0
    );
    let mut persisted: Vec<u64> = Vec::new();
    for path in storage.list_batches("run-1").unwrap() {
        for item in storage.read_chunks(&path).unwrap() {
            persisted.push(item.unwrap().first_tick);
        }
    }
    persisted.sort_unstable();
    assert_eq!(persisted, (0..80).map(|i| i * 8).collect::<Vec<_>>());
}

/// Storage that fails its first open, standing in for a broken write path.
struct FailOnceStorage {
    inner: FileBatchStorage,
    failed: AtomicBool,
}

impl BatchStorage for FailOnceStorage {
    fn open_batch(&self, run_id: &str, first_tick: u64) -> Result<Box<dyn BatchWriter>, Error> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::BatchWriteFailed.other("injected write failure"));
        }
        self.inner.open_batch(run_id, first_tick)
    }
}

/// A failed write must roll the batch back; the journal redelivers it and
/// the retry persists every chunk exactly once.
#[test]
fn write_failure_rolls_back_and_redelivers() {
    let journal_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();

    let queue: Arc<JournalBroker<TickDataChunk>> = Arc::new(
        JournalBroker::open(JournalConfig {
            path: journal_dir.path().to_path_buf(),
            max_size_bytes: 1 << 20,
            coalescing_delay: Duration::ZERO,
        })
        .unwrap(),
    );
    let topic: Arc<MemoryBroker<BatchInfo>> = Arc::new(MemoryBroker::new(16));
    let storage = Arc::new(FailOnceStorage {
        inner: FileBatchStorage::new(storage_dir.path()),
        failed: AtomicBool::new(false),
    });
    let tracker = Arc::new(MemoryIdempotencyTracker::new());

    let service = PersistService::new(
        "run-1".to_string(),
        Arc::clone(&queue) as Arc<dyn Broker<TickDataChunk>>,
        Arc::clone(&topic) as Arc<dyn Broker<BatchInfo>>,
        Arc::clone(&storage) as Arc<dyn BatchStorage>,
        Some(Arc::clone(&tracker) as Arc<dyn IdempotencyTracker>),
        config(),
    )
    .unwrap();
    let error_log = service.error_log();
    let (mut handle, counters) = service.start("PersistService");

    for first in [10u64, 18, 26] {
        queue.put(chunk(first, 8)).unwrap();
    }
    wait_until("all chunks retried and persisted", || {
        counters.chunks_written() == 3 && counters.batches_written() >= 1
    });
    handle.stop();

    assert!(!error_log.is_empty());
    assert!(tracker.is_processed(10));
    assert!(tracker.is_processed(26));

    // regardless of how the redelivery split the batches, every chunk is on
    // disk exactly once
    let verify = FileBatchStorage::new(storage_dir.path());
    let mut batch = topic.receive_batch(8, Duration::from_millis(100)).unwrap();
    let mut written: Vec<u64> = Vec::new();
    while let Some(item) = batch.next_item() {
        let info = item.unwrap();
        for chunk in verify.read_chunks(&info.storage_path).unwrap() {
            written.push(chunk.unwrap().first_tick);
        }
    }
    batch.commit().unwrap();
    written.sort_unstable();
    assert_eq!(written, vec![10, 18, 26]);
}

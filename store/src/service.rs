//! The persistence service loop.
//!
//! receive → filter duplicates → stream-write → notify → commit → mark
//! processed. The write path is rollback-on-failure: anything going wrong
//! before the commit closes the batch uncommitted and the broker redelivers
//! it. The notification path is best effort.

use crate::batch_files::{BatchStorage, BatchWriter};
use crate::idempotency::IdempotencyTracker;
use primordia_broker::{Broker, StreamingBatch};
use primordia_channel::{bounded, Receiver, RecvTimeoutError};
use primordia_error::{Error, ErrorKind};
use primordia_logger::{debug, error, info, warn};
use primordia_runtime::{ErrorLog, Lifecycle, ServiceCommand, ServiceHandle, ServiceState, ShutdownPhase};
use primordia_stop_handler::new_crossbeam_exit_rx;
use primordia_systemtime::unix_time_as_millis;
use primordia_types::service::{Request, DEFAULT_CHANNEL_SIZE};
use primordia_types::{BatchInfo, TickDataChunk};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Persistence loop configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Upper bound of chunks per drained batch
    pub max_batch_size: usize,
    /// Timeout of one receive window
    pub batch_timeout: Duration,
}

impl PersistConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.max_batch_size == 0 {
            return Err(ErrorKind::ConfigInvalid.other("max_batch_size must be positive"));
        }
        if self.batch_timeout.is_zero() {
            return Err(ErrorKind::ConfigInvalid.other("batch_timeout must be positive"));
        }
        Ok(())
    }
}

/// Operation counters of one persistence service.
#[derive(Default)]
pub struct PersistCounters {
    duplicates: AtomicU64,
    batches_written: AtomicU64,
    chunks_written: AtomicU64,
    notify_failures: AtomicU64,
}

impl PersistCounters {
    /// Redelivered chunks skipped by the duplicate filter.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Batches sealed and committed.
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    /// Chunks streamed into batch files.
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    /// Batch notifications that could not be published.
    pub fn notify_failures(&self) -> u64 {
        self.notify_failures.load(Ordering::Relaxed)
    }
}

/// The persistence service; competing copies may drain the same queue.
pub struct PersistService {
    run_id: String,
    queue: Arc<dyn Broker<TickDataChunk>>,
    topic: Arc<dyn Broker<BatchInfo>>,
    storage: Arc<dyn BatchStorage>,
    tracker: Option<Arc<dyn IdempotencyTracker>>,
    config: PersistConfig,
    error_log: Arc<ErrorLog>,
}

impl PersistService {
    /// Builds a service; configuration problems fail here, before any
    /// thread is spawned.
    pub fn new(
        run_id: String,
        queue: Arc<dyn Broker<TickDataChunk>>,
        topic: Arc<dyn Broker<BatchInfo>>,
        storage: Arc<dyn BatchStorage>,
        tracker: Option<Arc<dyn IdempotencyTracker>>,
        config: PersistConfig,
    ) -> Result<PersistService, Error> {
        config.validate()?;
        Ok(PersistService {
            run_id,
            queue,
            topic,
            storage,
            tracker,
            config,
            error_log: Arc::new(ErrorLog::default()),
        })
    }

    /// The operational error log shared with the spawned thread.
    pub fn error_log(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.error_log)
    }

    /// Spawns the service thread.
    pub fn start(self, name: &str) -> (ServiceHandle, Arc<PersistCounters>) {
        let lifecycle = Lifecycle::new(name);
        let counters = Arc::new(PersistCounters::default());
        let (control_tx, control_rx) = bounded::<Request<ServiceCommand, ()>>(DEFAULT_CHANNEL_SIZE);
        let exit_rx = new_crossbeam_exit_rx();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let lifecycle = Arc::clone(&lifecycle);
                let counters = Arc::clone(&counters);
                move || {
                    self.run(&lifecycle, &counters, control_rx, exit_rx);
                }
            })
            .expect("start persist service thread should ok");

        (ServiceHandle::new(lifecycle, control_tx, thread), counters)
    }

    fn run(
        self,
        lifecycle: &Lifecycle,
        counters: &PersistCounters,
        control_rx: Receiver<Request<ServiceCommand, ()>>,
        exit_rx: Receiver<()>,
    ) {
        lifecycle.set_state(ServiceState::Running);
        info!("{} started for run {}", lifecycle.name(), self.run_id);

        loop {
            // control and exit are only consulted between batches, so an
            // in-flight batch always finishes its commit
            match control_rx.try_recv() {
                Ok(request) => {
                    if self.handle_command(lifecycle, request, &control_rx, &exit_rx) {
                        break;
                    }
                }
                Err(_) => {
                    if exit_rx.try_recv().is_ok() {
                        lifecycle.set_state(ServiceState::Stopping);
                        break;
                    }
                }
            }
            if lifecycle.state() == ServiceState::Stopping {
                break;
            }

            lifecycle.set_phase(ShutdownPhase::Waiting);
            let mut batch = match self
                .queue
                .receive_batch(self.config.max_batch_size, self.config.batch_timeout)
            {
                Ok(batch) => batch,
                Err(e) if e.kind() == ErrorKind::TokenAcquireFailed => continue,
                Err(e) => {
                    warn!("receive failed: {}", e);
                    self.error_log.push(&e);
                    continue;
                }
            };

            lifecycle.set_phase(ShutdownPhase::Processing);
            self.process_batch(batch.as_mut(), counters);
            lifecycle.set_phase(ShutdownPhase::Idle);
        }

        lifecycle.set_phase(ShutdownPhase::Idle);
        lifecycle.set_state(ServiceState::Stopped);
        info!("{} stopped", lifecycle.name());
    }

    /// Returns true when the service should exit.
    fn handle_command(
        &self,
        lifecycle: &Lifecycle,
        request: Request<ServiceCommand, ()>,
        control_rx: &Receiver<Request<ServiceCommand, ()>>,
        exit_rx: &Receiver<()>,
    ) -> bool {
        let Request {
            responder,
            arguments,
        } = request;
        match arguments {
            ServiceCommand::Stop => {
                lifecycle.set_state(ServiceState::Stopping);
                let _ = responder.send(());
                true
            }
            ServiceCommand::Resume => {
                let _ = responder.send(());
                false
            }
            ServiceCommand::Pause => {
                lifecycle.set_state(ServiceState::Paused);
                let _ = responder.send(());
                // parked until resume or stop
                loop {
                    if exit_rx.try_recv().is_ok() {
                        lifecycle.set_state(ServiceState::Stopping);
                        return true;
                    }
                    match control_rx.recv_timeout(PAUSE_POLL_INTERVAL) {
                        Ok(Request {
                            responder,
                            arguments,
                        }) => match arguments {
                            ServiceCommand::Resume => {
                                lifecycle.set_state(ServiceState::Running);
                                let _ = responder.send(());
                                return false;
                            }
                            ServiceCommand::Stop => {
                                lifecycle.set_state(ServiceState::Stopping);
                                let _ = responder.send(());
                                return true;
                            }
                            ServiceCommand::Pause => {
                                let _ = responder.send(());
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return true,
                    }
                }
            }
        }
    }

    fn process_batch(&self, batch: &mut dyn StreamingBatch<TickDataChunk>, counters: &PersistCounters) {
        if batch.is_empty() {
            let _ = batch.commit();
            let _ = batch.close();
            return;
        }

        let mut writer: Option<Box<dyn BatchWriter>> = None;
        let mut keys: Vec<u64> = Vec::new();
        let mut first_tick = 0u64;
        let mut last_tick = 0u64;

        while let Some(item) = batch.next_item() {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!("chunk rejected, batch rolls back: {}", e);
                    self.error_log.push(&e);
                    self.rollback(writer.take(), batch);
                    return;
                }
            };

            let key = chunk.first_tick;
            if let Some(tracker) = &self.tracker {
                if tracker.is_processed(key) {
                    counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    warn!("chunk {} delivered again, skipped", key);
                    self.error_log
                        .push(ErrorKind::DuplicateDetected.other(format!("chunk {}", key)));
                    continue;
                }
            }

            if writer.is_none() {
                first_tick = chunk.first_tick;
                match self.storage.open_batch(&self.run_id, first_tick) {
                    Ok(opened) => writer = Some(opened),
                    Err(e) => {
                        error!("batch open failed, batch rolls back: {}", e);
                        self.error_log.push(&e);
                        self.rollback(None, batch);
                        return;
                    }
                }
            }
            let open_writer = writer.as_mut().expect("writer opened above");
            if let Err(e) = open_writer.write_chunk(&chunk) {
                error!("batch write failed, batch rolls back: {}", e);
                self.error_log.push(&e);
                self.rollback(writer.take(), batch);
                return;
            }
            counters.chunks_written.fetch_add(1, Ordering::Relaxed);
            keys.push(key);
            last_tick = chunk.last_tick;
        }

        let writer = match writer {
            Some(writer) => writer,
            None => {
                // every chunk was a duplicate: acknowledge, nothing to write
                debug!("batch of duplicates acknowledged");
                if let Err(e) = batch.commit() {
                    error!("commit of duplicate batch failed: {}", e);
                    self.error_log.push(&e);
                }
                let _ = batch.close();
                return;
            }
        };

        let storage_path = match writer.finish(last_tick) {
            Ok(path) => path,
            Err(e) => {
                error!("batch seal failed, batch rolls back: {}", e);
                self.error_log.push(&e);
                self.rollback(None, batch);
                return;
            }
        };

        // best effort: a lost notification is caught up from storage
        let info = BatchInfo {
            simulation_run_id: self.run_id.clone(),
            storage_path: storage_path.clone(),
            tick_start: first_tick,
            tick_end: last_tick,
            written_at_ms: unix_time_as_millis(),
        };
        match self.topic.offer(info) {
            Ok(true) => {}
            Ok(false) => {
                counters.notify_failures.fetch_add(1, Ordering::Relaxed);
                warn!("notification topic full, {} not announced", storage_path);
                self.error_log
                    .push(ErrorKind::NotificationSendFailed.other(&storage_path));
            }
            Err(e) => {
                counters.notify_failures.fetch_add(1, Ordering::Relaxed);
                warn!("notification publish failed: {}", e);
                self.error_log.push(&e);
            }
        }

        if let Err(e) = batch.commit() {
            // fatal for the batch, the broker redelivers it
            error!("batch commit failed: {}", e);
            self.error_log.push(&e);
            let _ = batch.close();
            return;
        }
        if let Some(tracker) = &self.tracker {
            for key in &keys {
                tracker.mark_processed(*key);
            }
        }
        counters.batches_written.fetch_add(1, Ordering::Relaxed);
        debug!(
            "persisted {} at {} covering ticks {}..={}",
            keys.len(),
            storage_path,
            first_tick,
            last_tick
        );
        let _ = batch.close();
    }

    fn rollback(
        &self,
        writer: Option<Box<dyn BatchWriter>>,
        batch: &mut dyn StreamingBatch<TickDataChunk>,
    ) {
        if let Some(writer) = writer {
            writer.abort();
        }
        if let Err(e) = batch.close() {
            error!("batch close failed: {}", e);
            self.error_log.push(&e);
        }
    }
}

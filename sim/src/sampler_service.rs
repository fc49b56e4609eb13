//! The sampling engine, service half.
//!
//! Owns the engine thread: runs ticks, pushes finished chunks into the
//! tick-data queue with blocking backpressure, emits the run metadata once,
//! honours the configured pause list and yields to the scheduler
//! periodically.

use crate::sampler::{Sampler, SamplerConfig};
use primordia_broker::Broker;
use primordia_channel::{bounded, Receiver, RecvTimeoutError};
use primordia_error::ErrorKind;
use primordia_logger::{debug, error, info, warn};
use primordia_runtime::{Lifecycle, ServiceCommand, ServiceHandle, ServiceState, ShutdownPhase};
use primordia_stop_handler::new_crossbeam_exit_rx;
use primordia_types::service::{Request, DEFAULT_CHANNEL_SIZE};
use primordia_types::{SimulationMetadata, Tick, TickDataChunk};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const METADATA_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// The engine service: exclusive owner of its simulation and encoder.
pub struct SamplerService {
    sampler: Sampler,
    data_queue: Arc<dyn Broker<TickDataChunk>>,
    meta_queue: Arc<dyn Broker<SimulationMetadata>>,
    /// `None` on resume: the metadata message was already published by the
    /// original run
    metadata: Option<SimulationMetadata>,
    config: SamplerConfig,
}

impl SamplerService {
    /// Wires the sampler to its queues.
    pub fn new(
        sampler: Sampler,
        data_queue: Arc<dyn Broker<TickDataChunk>>,
        meta_queue: Arc<dyn Broker<SimulationMetadata>>,
        metadata: Option<SimulationMetadata>,
        config: SamplerConfig,
    ) -> SamplerService {
        SamplerService {
            sampler,
            data_queue,
            meta_queue,
            metadata,
            config,
        }
    }

    /// Spawns the engine thread.
    pub fn start(self, name: &str) -> ServiceHandle {
        let lifecycle = Lifecycle::new(name);
        let (control_tx, control_rx) = bounded::<Request<ServiceCommand, ()>>(DEFAULT_CHANNEL_SIZE);
        let exit_rx = new_crossbeam_exit_rx();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let lifecycle = Arc::clone(&lifecycle);
                move || self.run(&lifecycle, control_rx, exit_rx)
            })
            .expect("start sampler service thread should ok");

        ServiceHandle::new(lifecycle, control_tx, thread)
    }

    fn run(
        mut self,
        lifecycle: &Lifecycle,
        control_rx: Receiver<Request<ServiceCommand, ()>>,
        exit_rx: Receiver<()>,
    ) {
        lifecycle.set_state(ServiceState::Running);
        info!(
            "{} started for run {}",
            lifecycle.name(),
            self.sampler.simulation().run_id()
        );

        if let Some(metadata) = self.metadata.take() {
            match self.meta_queue.offer_timeout(metadata, METADATA_PUBLISH_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => {
                    let e = ErrorKind::BackpressureTimeout
                        .other("metadata queue full past the publish timeout");
                    error!("{}", e);
                    self.sampler.simulation().error_log().push(&e);
                }
                Err(e) => {
                    error!("metadata publish failed: {}", e);
                    self.sampler.simulation().error_log().push(&e);
                }
            }
        }

        let mut last_autopause: Option<Tick> = None;
        loop {
            match control_rx.try_recv() {
                Ok(request) => {
                    if handle_command(lifecycle, request, &control_rx, &exit_rx) {
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

            // auto-pause once per configured tick
            let tick = self.sampler.current_tick();
            if self.config.pause_ticks.contains(&tick) && last_autopause != Some(tick) {
                last_autopause = Some(tick);
                info!("auto-pausing at tick {}", tick);
                lifecycle.set_state(ServiceState::Paused);
                if park_until_resume(lifecycle, &control_rx, &exit_rx) {
                    break;
                }
                continue;
            }

            lifecycle.set_phase(ShutdownPhase::Processing);
            if let Some(chunk) = self.sampler.advance() {
                debug!(
                    "chunk {}..={} complete, handing to the data queue",
                    chunk.first_tick, chunk.last_tick
                );
                // backpressure propagates here; a stop signal unblocks it
                if let Err(e) = self.data_queue.put(chunk) {
                    if e.kind() == ErrorKind::ResourceUnavailable {
                        info!("data queue gone, engine stops: {}", e);
                        lifecycle.set_state(ServiceState::Stopping);
                        break;
                    }
                    warn!("chunk publish failed: {}", e);
                    self.sampler.simulation().error_log().push(&e);
                }
            }
            lifecycle.set_phase(ShutdownPhase::Idle);

            let executed = tick;
            if self.config.yield_interval > 0 && executed % self.config.yield_interval == 0 {
                thread::yield_now();
            }
        }

        lifecycle.set_phase(ShutdownPhase::Idle);
        lifecycle.set_state(ServiceState::Stopped);
        info!("{} stopped", lifecycle.name());
    }
}

/// Returns true when the service should exit.
fn handle_command(
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
            park_until_resume(lifecycle, control_rx, exit_rx)
        }
    }
}

/// Parks a paused service; returns true when it should exit instead of
/// resuming.
fn park_until_resume(
    lifecycle: &Lifecycle,
    control_rx: &Receiver<Request<ServiceCommand, ()>>,
    exit_rx: &Receiver<()>,
) -> bool {
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

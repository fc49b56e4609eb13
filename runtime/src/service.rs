//! Service lifecycle.
//!
//! A service runs in its own thread and mirrors its state into a shared
//! [`Lifecycle`] so controllers and the entry point can observe it. The
//! shutdown phase tells lifecycle managers whether interrupting is safe:
//! a service in `Processing` is mid-batch and must be allowed to finish its
//! commit.

use primordia_channel::Sender;
use primordia_logger::warn;
use primordia_types::service::Request;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lifecycle states of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Constructed, thread not yet running
    Created = 0,
    /// Main loop running
    Running = 1,
    /// Main loop parked until resume
    Paused = 2,
    /// Stop requested, finishing in-flight work
    Stopping = 3,
    /// Thread exited
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(raw: u8) -> ServiceState {
        match raw {
            0 => ServiceState::Created,
            1 => ServiceState::Running,
            2 => ServiceState::Paused,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

/// What the service is doing with respect to shutdown safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    /// Between batches, safe to interrupt
    Idle = 0,
    /// Mid-batch, interrupting would abort a commit
    Processing = 1,
    /// Blocked on a queue, safe to interrupt
    Waiting = 2,
}

impl ShutdownPhase {
    fn from_u8(raw: u8) -> ShutdownPhase {
        match raw {
            1 => ShutdownPhase::Processing,
            2 => ShutdownPhase::Waiting,
            _ => ShutdownPhase::Idle,
        }
    }
}

/// Shared observable state of one service.
pub struct Lifecycle {
    name: String,
    state: AtomicU8,
    phase: AtomicU8,
}

impl Lifecycle {
    /// Creates a lifecycle in `Created`.
    pub fn new<S: ToString>(name: S) -> Arc<Lifecycle> {
        Arc::new(Lifecycle {
            name: name.to_string(),
            state: AtomicU8::new(ServiceState::Created as u8),
            phase: AtomicU8::new(ShutdownPhase::Idle as u8),
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves the state machine.
    pub fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current shutdown phase.
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Marks the shutdown phase.
    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

/// Control commands accepted by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Park the main loop
    Pause,
    /// Unpark the main loop
    Resume,
    /// Finish in-flight work and exit
    Stop,
}

/// Controller over a spawned service thread.
pub struct ServiceHandle {
    lifecycle: Arc<Lifecycle>,
    control: Sender<Request<ServiceCommand, ()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Wraps a spawned service.
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        control: Sender<Request<ServiceCommand, ()>>,
        thread: JoinHandle<()>,
    ) -> ServiceHandle {
        ServiceHandle {
            lifecycle,
            control,
            thread: Some(thread),
        }
    }

    /// The observable lifecycle.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Current shutdown phase.
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.lifecycle.shutdown_phase()
    }

    /// Parks the service after its in-flight work.
    pub fn pause(&self) {
        if Request::call(&self.control, ServiceCommand::Pause).is_none() {
            warn!("service {} is gone, pause ignored", self.lifecycle.name());
        }
    }

    /// Unparks a paused service.
    pub fn resume(&self) {
        if Request::call(&self.control, ServiceCommand::Resume).is_none() {
            warn!("service {} is gone, resume ignored", self.lifecycle.name());
        }
    }

    /// Requests a graceful stop and joins the thread. The service finishes
    /// the batch it is processing before it exits.
    pub fn stop(&mut self) {
        if Request::call(&self.control, ServiceCommand::Stop).is_none() {
            warn!("service {} already stopped", self.lifecycle.name());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("service {} panicked during stop", self.lifecycle.name());
            }
        }
        self.lifecycle.set_state(ServiceState::Stopped);
    }
}

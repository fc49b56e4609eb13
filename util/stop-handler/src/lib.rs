//! Cooperative shutdown signalling.
//!
//! Two flavours are provided. The process-wide exit broadcast hands every
//! service thread its own crossbeam receiver; `broadcast_exit_signals` fires
//! them all at once, and registered threads can be joined by the entry point
//! during teardown. The owned [`StopHandler`] pairs a signal sender with a
//! join handle for services that are stopped individually.

use parking_lot::Mutex;
use primordia_channel::{Receiver, Sender};
use primordia_logger::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::JoinHandle;

static EXIT_SENDERS: OnceLock<Mutex<Vec<Sender<()>>>> = OnceLock::new();
static THREAD_GUARDS: OnceLock<Mutex<Vec<(String, JoinHandle<()>)>>> = OnceLock::new();
static RECEIVED_STOP: AtomicBool = AtomicBool::new(false);

fn exit_senders() -> &'static Mutex<Vec<Sender<()>>> {
    EXIT_SENDERS.get_or_init(|| Mutex::new(Vec::new()))
}

fn thread_guards() -> &'static Mutex<Vec<(String, JoinHandle<()>)>> {
    THREAD_GUARDS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Creates a fresh exit receiver wired to the process-wide broadcast.
///
/// Every call returns an independent bounded(1) channel, so a service may
/// consume the signal without starving its siblings.
pub fn new_crossbeam_exit_rx() -> Receiver<()> {
    let (tx, rx) = primordia_channel::bounded(1);
    exit_senders().lock().push(tx);
    rx
}

/// Fires the exit signal to every receiver created so far.
pub fn broadcast_exit_signals() {
    RECEIVED_STOP.store(true, Ordering::SeqCst);
    debug!("broadcasting exit signal to all services");
    for tx in exit_senders().lock().iter() {
        if tx.try_send(()).is_err() {
            // receiver is gone or already signalled, either way it will stop
        }
    }
}

/// Whether `broadcast_exit_signals` has been called.
pub fn has_received_stop_signal() -> bool {
    RECEIVED_STOP.load(Ordering::SeqCst)
}

/// Registers a service thread so `wait_all_threads_exit` can join it.
pub fn register_thread<S: ToString>(name: S, thread: JoinHandle<()>) {
    thread_guards().lock().push((name.to_string(), thread));
}

/// Joins every registered thread; called by the entry point after broadcast.
pub fn wait_all_threads_exit() {
    let mut guards = thread_guards().lock();
    for (name, handle) in guards.drain(..) {
        debug!("waiting thread {} to exit", name);
        if handle.join().is_err() {
            warn!("thread {} panicked before exit", name);
        }
    }
}

/// Signal sender backed by a crossbeam channel.
pub enum SignalSender<T> {
    /// Crossbeam sender
    Crossbeam(Sender<T>),
}

impl<T> SignalSender<T> {
    /// Sends the stop signal, ignoring a disconnected receiver.
    pub fn send(&self, cmd: T) {
        match self {
            SignalSender::Crossbeam(tx) => {
                if let Err(e) = tx.try_send(cmd) {
                    debug!("stop signal send failed {:?}", e.to_string());
                }
            }
        }
    }
}

/// Owns the stop signal and the join handle of a single service thread.
pub struct StopHandler<T> {
    signal: SignalSender<T>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl<T> StopHandler<T> {
    /// Creates a handler for a spawned service.
    pub fn new<S: ToString>(signal: SignalSender<T>, thread: JoinHandle<()>, name: S) -> Self {
        StopHandler {
            signal,
            thread: Some(thread),
            name: name.to_string(),
        }
    }

    /// Sends the stop signal and joins the service thread.
    pub fn try_send(&mut self, cmd: T) {
        self.signal.send(cmd);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("service {} panicked during stop", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn stop_handler_joins_thread() {
        let (tx, rx) = primordia_channel::bounded::<()>(1);
        let thread = thread::spawn(move || {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        });
        let mut handler = StopHandler::new(SignalSender::Crossbeam(tx), thread, "unit");
        handler.try_send(());
    }

    #[test]
    fn broadcast_reaches_all_receivers() {
        let rx1 = new_crossbeam_exit_rx();
        let rx2 = new_crossbeam_exit_rx();
        broadcast_exit_signals();
        assert!(rx1.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx2.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(has_received_stop_signal());
    }
}

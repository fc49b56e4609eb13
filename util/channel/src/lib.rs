//! Reexports `crossbeam_channel` to uniform the dependency version.

pub use crossbeam_channel::{
    after, bounded, never, select, tick, unbounded, Receiver, RecvError, RecvTimeoutError,
    SendError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};

/// oneshot channel wrapper
pub mod oneshot {
    /// oneshot channel sender
    pub type Sender<T> = crossbeam_channel::Sender<T>;
    /// oneshot channel receiver
    pub type Receiver<T> = crossbeam_channel::Receiver<T>;

    /// Create a oneshot channel, a channel bounded to 1
    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        crossbeam_channel::bounded(1)
    }
}

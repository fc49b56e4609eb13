//! Request/response plumbing for channel-driven services.

use primordia_channel::{bounded, Sender};

const ONESHOT_CHANNEL_SIZE: usize = 1;
/// Default capacity of service control channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 32;
/// Capacity of stop-signal channels.
pub const SIGNAL_CHANNEL_SIZE: usize = 1;

/// A request carrying its response channel.
pub struct Request<A, R> {
    /// Oneshot channel the service answers on
    pub responder: Sender<R>,
    /// Request arguments
    pub arguments: A,
}

impl<A, R> Request<A, R> {
    /// Sends a request over `sender` and blocks for the response. `None`
    /// when the service is gone.
    pub fn call(sender: &Sender<Request<A, R>>, arguments: A) -> Option<R> {
        let (responder, response) = bounded(ONESHOT_CHANNEL_SIZE);
        sender
            .send(Request {
                responder,
                arguments,
            })
            .ok()?;
        response.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_roundtrips_through_a_service_thread() {
        let (tx, rx) = bounded::<Request<u32, u32>>(DEFAULT_CHANNEL_SIZE);
        let service = std::thread::spawn(move || {
            while let Ok(Request {
                responder,
                arguments,
            }) = rx.recv()
            {
                let _ = responder.send(arguments * 2);
            }
        });
        assert_eq!(Request::call(&tx, 21), Some(42));
        drop(tx);
        service.join().unwrap();
    }

    #[test]
    fn call_on_a_dead_service_is_none() {
        let (tx, rx) = bounded::<Request<u32, u32>>(1);
        drop(rx);
        assert_eq!(Request::call(&tx, 1), None);
    }
}

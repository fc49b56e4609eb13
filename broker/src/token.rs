//! The drain token.
//!
//! A one-element ghost queue: the token rests in a bounded(1) channel,
//! `acquire` takes it out and `release` puts it back. Whoever holds the
//! token owns the receive window; batch ranges handed to competing
//! consumers are therefore non-overlapping and consecutive.

use primordia_channel::{bounded, Receiver, Sender};
use primordia_error::{Error, ErrorKind};
use primordia_logger::warn;
use std::time::Duration;

const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct DrainToken {
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
}

impl DrainToken {
    pub(crate) fn new() -> DrainToken {
        let (slot_tx, slot_rx) = bounded(1);
        slot_tx.send(()).expect("fresh token slot accepts the token");
        DrainToken { slot_tx, slot_rx }
    }

    /// Takes the token, waiting up to `timeout`.
    pub(crate) fn acquire(&self, timeout: Duration) -> Result<TokenGuard<'_>, Error> {
        self.slot_rx
            .recv_timeout(timeout)
            .map_err(|_| ErrorKind::TokenAcquireFailed.other("drain token busy past the timeout"))?;
        Ok(TokenGuard {
            token: self,
            released: false,
        })
    }

    /// Puts the token back, retrying with linear backoff. A token that
    /// cannot be returned leaves the broker undrainnable, which is fatal.
    fn release(&self) -> Result<(), Error> {
        for attempt in 1..=RELEASE_ATTEMPTS {
            if self.slot_tx.try_send(()).is_ok() {
                return Ok(());
            }
            warn!("drain token release attempt {} failed", attempt);
            std::thread::sleep(RELEASE_BACKOFF * attempt);
        }
        Err(ErrorKind::TokenReleaseFailed
            .other(format!("drain token stuck after {} attempts", RELEASE_ATTEMPTS)))
    }
}

/// Holds the drain token; the receive window ends when this is released or
/// dropped.
pub(crate) struct TokenGuard<'a> {
    token: &'a DrainToken,
    released: bool,
}

impl TokenGuard<'_> {
    /// Explicit release so the caller can observe a release failure.
    pub(crate) fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.token.release()
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.token.release() {
                warn!("drain token lost on guard drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_exclusive() {
        let token = DrainToken::new();
        let guard = token.acquire(Duration::from_millis(10)).unwrap();
        let second = token.acquire(Duration::from_millis(10));
        assert!(second.is_err());
        assert_eq!(
            second.err().unwrap().kind(),
            ErrorKind::TokenAcquireFailed
        );
        guard.release().unwrap();
        assert!(token.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn dropping_the_guard_releases() {
        let token = DrainToken::new();
        drop(token.acquire(Duration::from_millis(10)).unwrap());
        assert!(token.acquire(Duration::from_millis(10)).is_ok());
    }
}

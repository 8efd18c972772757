//! Single-shot result delivery
//!
//! Connect, exchange and arm run on worker threads; the caller gets a
//! [`Completion`] that yields their outcome exactly once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::error::{Error, Result};

/// Receiving half of a one-shot result
pub struct Completion<T> {
    rx: Receiver<Result<T>>,
}

/// Sending half; dropping it unresolved abandons the operation
pub struct Resolver<T> {
    tx: Sender<Result<T>>,
}

impl<T> Completion<T> {
    pub fn pair() -> (Completion<T>, Resolver<T>) {
        let (tx, rx) = bounded(1);
        (Completion { rx }, Resolver { tx })
    }

    /// Block until the operation finishes
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(abandoned()))
    }

    /// Block up to `timeout`. The result is handed out once; later calls
    /// after a delivery report the operation as abandoned.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Non-blocking poll
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

impl<T> Resolver<T> {
    pub fn resolve(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

fn abandoned() -> Error {
    Error::invalid_state("operation abandoned before completing")
}

use crate::errors::*;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::trace;
use std::time::Duration;

/// A blocking, optionally timed handoff between the reader thread (producer)
/// and one caller waiting for a protocol reply (consumer).
///
/// Each synchronous operation sends its method frame and then parks on
/// [`wait`](Self::wait); the reader thread routes the matching reply (or the
/// error that preempted it) here. A timed-out wait leaves protocol state
/// untouched; the late reply, if it ever arrives, is discarded by
/// [`drain`](Self::drain) before the next operation.
pub(crate) struct ContinuationQueue<T> {
    tx: Sender<Result<T>>,
    rx: Receiver<Result<T>>,
}

impl<T> ContinuationQueue<T> {
    pub(crate) fn new() -> ContinuationQueue<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        ContinuationQueue { tx, rx }
    }

    pub(crate) fn push(&self, value: T) {
        // send fails only if the owning channel is gone; nothing to do then
        let _ = self.tx.send(Ok(value));
    }

    pub(crate) fn push_error(&self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => ClientTimeoutSnafu { timeout }.fail(),
                Err(RecvTimeoutError::Disconnected) => ConnectionDroppedSnafu {
                    message: "reply queue disconnected",
                }
                .fail(),
            },
            None => match self.rx.recv() {
                Ok(reply) => reply,
                Err(_) => ConnectionDroppedSnafu {
                    message: "reply queue disconnected",
                }
                .fail(),
            },
        }
    }

    /// Discard replies left over from a timed-out wait.
    pub(crate) fn drain(&self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) => trace!("discarding stale continuation reply"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }
}

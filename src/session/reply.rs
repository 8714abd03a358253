//! One-shot results of asynchronous session requests
//!
//! Every request (`connect`, `join_group`, ...) hands back a [`Reply`] that
//! the network thread resolves exactly once. If the request is abandoned
//! without an answer, waiting yields [`SessionError::Disconnected`].

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::SessionError;

pub(crate) struct Resolver<T> {
    tx: Sender<Result<T, SessionError>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(self, result: Result<T, SessionError>) {
        // Nobody waiting is fine
        let _ = self.tx.try_send(result);
    }
}

/// Pending result of a session request
#[derive(Debug)]
pub struct Reply<T> {
    rx: Receiver<Result<T, SessionError>>,
}

pub(crate) fn reply<T>() -> (Resolver<T>, Reply<T>) {
    let (tx, rx) = bounded(1);
    (Resolver { tx }, Reply { rx })
}

impl<T> Reply<T> {
    /// A reply that is already resolved
    pub fn ready(result: Result<T, SessionError>) -> Self {
        let (resolver, reply) = reply();
        resolver.resolve(result);
        reply
    }

    /// Block until the request completes
    pub fn wait(self) -> Result<T, SessionError> {
        self.rx.recv().unwrap_or(Err(SessionError::Disconnected))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, SessionError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Disconnected),
        }
    }

    /// The result, if it arrived
    pub fn try_get(&self) -> Option<Result<T, SessionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SessionError::Disconnected)),
        }
    }
}

//! Stream events and the queue that carries them to the application

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::network::Endpoint;
use crate::protocol::Format;

/// Playback state of one remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StreamState {
    Active,
    /// Buffer ran dry; waiting for data
    Idle,
}

/// Everything a source or sink reports
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    // sink side
    SourceAdd { endpoint: Endpoint },
    SourceRemove { endpoint: Endpoint },
    FormatChange { endpoint: Endpoint, format: Format },
    StreamStateChange { endpoint: Endpoint, state: StreamState },
    BlockLost { endpoint: Endpoint, count: u32 },
    BlockReordered { endpoint: Endpoint, count: u32 },
    BlockResent { endpoint: Endpoint, count: u32 },
    BlockGap { endpoint: Endpoint, count: u32 },
    Underrun { endpoint: Endpoint, count: u32 },
    InviteTimeout { endpoint: Endpoint },
    FormatTimeout { endpoint: Endpoint },
    BufferResize { endpoint: Endpoint, old_ms: f64, new_ms: f64 },

    // source side
    Ping { endpoint: Endpoint, rtt_ms: f64, out_ms: f64, in_ms: f64, lost: u32 },
    Invite { endpoint: Endpoint },
    Uninvite { endpoint: Endpoint },
    CodecChange { endpoint: Endpoint, format: Format },
}

impl StreamEvent {
    /// Remote endpoint the event is about
    pub fn endpoint(&self) -> Endpoint {
        match self {
            StreamEvent::SourceAdd { endpoint }
            | StreamEvent::SourceRemove { endpoint }
            | StreamEvent::FormatChange { endpoint, .. }
            | StreamEvent::StreamStateChange { endpoint, .. }
            | StreamEvent::BlockLost { endpoint, .. }
            | StreamEvent::BlockReordered { endpoint, .. }
            | StreamEvent::BlockResent { endpoint, .. }
            | StreamEvent::BlockGap { endpoint, .. }
            | StreamEvent::Underrun { endpoint, .. }
            | StreamEvent::InviteTimeout { endpoint }
            | StreamEvent::FormatTimeout { endpoint }
            | StreamEvent::BufferResize { endpoint, .. }
            | StreamEvent::Ping { endpoint, .. }
            | StreamEvent::Invite { endpoint }
            | StreamEvent::Uninvite { endpoint }
            | StreamEvent::CodecChange { endpoint, .. } => *endpoint,
        }
    }
}

/// Bounded, lossy event queue.
///
/// Producers never block: when the application stops polling, new events
/// are counted and dropped.
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, dropped: AtomicU64::new(0) }
    }

    pub fn push(&self, event: T) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!("Event queue full, dropping events");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn extend(&self, events: impl IntoIterator<Item = T>) {
        for event in events {
            self.push(event);
        }
    }

    /// Drain everything queued so far
    pub fn poll(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// A receiver for blocking waits (`recv_timeout`, `select!`)
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drops_when_full() {
        let queue = EventQueue::new(2);
        queue.extend([1, 2, 3]);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.poll(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_endpoint() {
        let endpoint = Endpoint::new("127.0.0.1:1".parse().unwrap(), 3);
        let event = StreamEvent::BlockLost { endpoint, count: 2 };
        assert_eq!(event.endpoint(), endpoint);
    }
}

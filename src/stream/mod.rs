//! Audio streams: [`Source`] sends, [`Sink`] receives
//!
//! Both are [`NodeOwner`]s. Incoming datagrams arrive on the node's receive
//! thread through `handle_message`. Everything they send is pushed onto a
//! preallocated queue and written by the node's send thread in `flush`, so
//! `process()` on the audio thread never touches the socket.
//!
//! [`NodeOwner`]: crate::network::NodeOwner

pub mod events;
pub mod resend;
pub mod sink;
pub mod sizing;
pub mod source;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::network::{NodeHandle, PacketSink};

pub use events::{EventQueue, StreamEvent, StreamState};
pub use resend::ResendTracker;
pub use sink::{Sink, SourceInfo};
pub use sizing::{ArrivalStats, BufferSizer};
pub use source::{SinkInfo, Source};

/// Datagrams waiting for the send thread
pub(crate) struct OutgoingQueue {
    packets: ArrayQueue<(SocketAddr, Bytes)>,
    dropped: AtomicU64,
}

impl OutgoingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { packets: ArrayQueue::new(capacity.max(1)), dropped: AtomicU64::new(0) }
    }

    /// Never blocks; a full queue drops the packet
    pub(crate) fn push(&self, addr: SocketAddr, packet: Bytes) -> bool {
        if self.packets.push((addr, packet)).is_err() {
            if self.dropped.fetch_add(1, Ordering::Relaxed) % 1000 == 0 {
                tracing::warn!("Outgoing queue full, dropping packets");
            }
            return false;
        }
        true
    }

    pub(crate) fn flush(&self, sink: &dyn PacketSink) -> usize {
        let mut sent = 0;
        while let Some((addr, packet)) = self.packets.pop() {
            match sink.send_to(&packet, addr) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("{}", e),
            }
        }
        sent
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Wake the send thread of the attached node, if any
pub(crate) fn notify(handle: &Mutex<Option<NodeHandle>>) {
    if let Some(handle) = handle.lock().as_ref() {
        handle.notify();
    }
}

//! Per-port socket multiplexer
//!
//! A [`Node`] owns one UDP socket and two threads:
//!
//! - the receive thread blocks on the socket, reads the routing header of
//!   every datagram and hands it to the first matching owner
//! - the send thread sleeps on a condition variable until an owner calls
//!   [`NodeHandle::notify`] (or the housekeeping tick expires) and then lets
//!   every owner flush its queued packets
//!
//! Owners are held weakly in a generation-tagged arena. Dispatch upgrades
//! the owner under the shared lock and calls it after the lock is dropped,
//! so removing an owner never invalidates a dispatch in flight.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::endpoint::EndpointResolver;
use super::udp::{canonical_addr, create_socket, loopback_addr, outgoing_addr};
use crate::config::NodeConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::protocol::{peek_header, EndpointType};

/// Destination for outgoing datagrams
pub trait PacketSink {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError>;
}

/// Something that receives datagrams from a node
pub trait NodeOwner: Send + Sync {
    fn kind(&self) -> EndpointType;

    fn id(&self) -> i32;

    /// Called on the receive thread for every datagram routed to this owner
    fn handle_message(&self, data: &[u8], from: SocketAddr);

    /// Called on the send thread after `notify()` and on every tick
    fn flush(&self, _sink: &dyn PacketSink) {}
}

/// Node statistics
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Datagrams nobody could take
    pub dropped: u64,
    pub send_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotKey {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    entry: Option<OwnerEntry>,
}

struct OwnerEntry {
    kind: EndpointType,
    id: i32,
    owner: Weak<dyn NodeOwner>,
}

/// Owners registered on one node
#[derive(Default)]
struct OwnerArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl OwnerArena {
    fn insert(&mut self, entry: OwnerEntry) -> SlotKey {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(entry);
                SlotKey { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                SlotKey { index: self.slots.len() - 1, generation: 0 }
            }
        }
    }

    fn remove(&mut self, key: SlotKey) -> bool {
        match self.slots.get_mut(key.index) {
            Some(slot) if slot.generation == key.generation && slot.entry.is_some() => {
                slot.entry = None;
                self.free.push(key.index);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// First live owner matching type and id (any id for the wildcard)
    fn find(&self, kind: EndpointType, id: i32, wildcard: bool) -> Option<Arc<dyn NodeOwner>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|entry| entry.kind == kind && (wildcard || entry.id == id))
            .find_map(|entry| entry.owner.upgrade())
    }

    fn collect(&self, out: &mut Vec<Arc<dyn NodeOwner>>) {
        out.extend(
            self.slots
                .iter()
                .filter_map(|slot| slot.entry.as_ref())
                .filter_map(|entry| entry.owner.upgrade()),
        );
    }
}

/// One bound UDP port
pub struct Node {
    port: u16,
    local_addr: SocketAddr,
    socket: UdpSocket,
    owners: RwLock<OwnerArena>,
    resolver: Arc<EndpointResolver>,
    running: AtomicBool,
    pending: Mutex<bool>,
    wake: Condvar,
    tick: Duration,
    threads: Mutex<Vec<JoinHandle<()>>>,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    dropped: AtomicU64,
    send_errors: AtomicU64,
}

impl Node {
    fn open(port: u16, config: &NodeConfig) -> Result<Arc<Self>, NetworkError> {
        let socket = create_socket(port, config)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed { port, reason: e.to_string() })?;

        let node = Arc::new(Self {
            port: local_addr.port(),
            local_addr,
            socket,
            owners: RwLock::new(OwnerArena::default()),
            resolver: Arc::new(EndpointResolver::new()),
            running: AtomicBool::new(true),
            pending: Mutex::new(false),
            wake: Condvar::new(),
            tick: Duration::from_millis(config.tick_interval_ms.max(1) as u64),
            threads: Mutex::new(Vec::new()),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        });

        let spawn_err = |e: std::io::Error| NetworkError::BindFailed { port, reason: e.to_string() };

        let receiver = Arc::clone(&node);
        let recv_handle = thread::Builder::new()
            .name(format!("node-recv-{}", node.port))
            .spawn(move || receiver.receive_loop())
            .map_err(spawn_err)?;

        let sender = Arc::clone(&node);
        let send_handle = match thread::Builder::new()
            .name(format!("node-send-{}", node.port))
            .spawn(move || sender.send_loop())
        {
            Ok(handle) => handle,
            Err(e) => {
                node.stop_threads();
                let _ = recv_handle.join();
                return Err(spawn_err(e));
            }
        };

        node.threads.lock().extend([recv_handle, send_handle]);

        tracing::info!("Node listening on {}", node.local_addr);
        Ok(node)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    /// Wake the send thread
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.wake.notify_one();
    }

    pub fn owner_count(&self) -> usize {
        self.owners.read().len()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    fn receive_loop(self: Arc<Self>) {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        tracing::debug!("Receive thread started on port {}", self.port);

        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, from)) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                    self.dispatch(&buffer[..len], canonical_addr(from));
                }
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    // ICMP port unreachable from an earlier send shows up here on some platforms
                    tracing::warn!("Receive error on port {}: {}", self.port, e);
                }
            }
        }
        tracing::debug!("Receive thread on port {} stopped", self.port);
    }

    fn dispatch(&self, data: &[u8], from: SocketAddr) {
        let header = match peek_header(data) {
            Ok(header) => header,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        // Peer datagrams are handled by the session client
        let kind = match header.recipient {
            EndpointType::Peer => EndpointType::Client,
            other => other,
        };

        let owner = self.owners.read().find(kind, header.id, header.is_wildcard());
        match owner {
            Some(owner) => {
                if self.resolver.touch(from) {
                    tracing::debug!("New remote address {}", from);
                }
                owner.handle_message(data, from);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("No {:?} with id {} for datagram from {}", kind, header.id, from);
            }
        }
    }

    fn send_loop(self: Arc<Self>) {
        let mut owners: Vec<Arc<dyn NodeOwner>> = Vec::new();
        tracing::debug!("Send thread started on port {}", self.port);

        loop {
            {
                let mut pending = self.pending.lock();
                if !*pending {
                    let _ = self.wake.wait_for(&mut pending, self.tick);
                }
                *pending = false;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            self.owners.read().collect(&mut owners);
            for owner in owners.drain(..) {
                owner.flush(&*self);
            }
        }
        tracing::debug!("Send thread on port {} stopped", self.port);
    }

    fn add_owner(&self, owner: &Arc<dyn NodeOwner>, id: i32) -> SlotKey {
        self.owners.write().insert(OwnerEntry {
            kind: owner.kind(),
            id,
            owner: Arc::downgrade(owner),
        })
    }

    fn remove_owner(&self, key: SlotKey) {
        self.owners.write().remove(key);
    }

    fn stop_threads(&self) {
        self.running.store(false, Ordering::Release);
        self.notify();
        // Unblock recv_from with a datagram to ourselves, falling back to a read timeout
        if let Err(e) = self.socket.send_to(&[0u8], loopback_addr(&self.local_addr)) {
            tracing::warn!("Could not wake receive thread on port {}: {}", self.port, e);
            let _ = self.socket.set_read_timeout(Some(Duration::from_millis(1)));
        }
    }

    fn shutdown(&self) {
        self.stop_threads();
        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                // Last owner dropped from inside a callback; the loop exits on its own
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Node thread on port {} panicked", self.port);
            }
        }
        tracing::info!("Node on port {} closed", self.port);
    }
}

impl PacketSink for Node {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }
        match self.socket.send_to(data, outgoing_addr(&self.local_addr, addr)) {
            Ok(sent) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::SendFailed { addr, reason: e.to_string() })
            }
        }
    }
}

struct RegistryEntry {
    node: Arc<Node>,
    refs: usize,
}

struct RegistryInner {
    nodes: Mutex<HashMap<u16, RegistryEntry>>,
    config: NodeConfig,
}

impl RegistryInner {
    fn release(&self, node: &Arc<Node>, key: SlotKey) {
        node.remove_owner(key);

        let closing = {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(&node.port) {
                Some(entry) if Arc::ptr_eq(&entry.node, node) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        nodes.remove(&node.port)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        // Join outside the registry lock so other ports stay usable
        if let Some(entry) = closing {
            entry.node.shutdown();
        }
    }
}

/// Port to node map with reference counting
pub struct NodeRegistry {
    inner: Arc<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::with_config(NodeConfig::default())
    }

    pub fn with_config(config: NodeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner { nodes: Mutex::new(HashMap::new()), config }),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static NodeRegistry {
        static GLOBAL: OnceLock<NodeRegistry> = OnceLock::new();
        GLOBAL.get_or_init(NodeRegistry::new)
    }

    /// Register `owner` on `port`, binding the socket on first use.
    ///
    /// Port 0 always opens a new node on an ephemeral port.
    pub fn acquire(&self, port: u16, owner: &Arc<dyn NodeOwner>, id: i32) -> Result<NodeHandle, NetworkError> {
        let mut nodes = self.inner.nodes.lock();

        let node = match nodes.get_mut(&port).filter(|_| port != 0) {
            Some(entry) => {
                entry.refs += 1;
                Arc::clone(&entry.node)
            }
            None => {
                let node = Node::open(port, &self.inner.config)?;
                nodes.insert(node.port, RegistryEntry { node: Arc::clone(&node), refs: 1 });
                node
            }
        };
        drop(nodes);

        let key = node.add_owner(owner, id);
        tracing::debug!("{:?} {} attached to port {}", owner.kind(), id, node.port);

        Ok(NodeHandle {
            node,
            key,
            registry: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    /// Number of live handles on `port`
    pub fn ref_count(&self, port: u16) -> usize {
        self.inner.nodes.lock().get(&port).map(|entry| entry.refs).unwrap_or(0)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One owner's share of a node. Dropping the handle releases it.
pub struct NodeHandle {
    node: Arc<Node>,
    key: SlotKey,
    registry: Arc<RegistryInner>,
    released: AtomicBool,
}

impl NodeHandle {
    pub fn release(self) {
        drop(self);
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        if self.released.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        self.node.send_to(data, addr)
    }

    pub fn notify(&self) {
        self.node.notify();
    }

    pub fn port(&self) -> u16 {
        self.node.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        self.node.resolver()
    }

    pub fn stats(&self) -> NodeStats {
        self.node.stats()
    }
}

impl PacketSink for NodeHandle {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        NodeHandle::send_to(self, data, addr)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release(&self.node, self.key);
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("port", &self.node.port)
            .field("slot", &self.key.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Header, ID_WILDCARD};
    use bytes::BytesMut;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        kind: EndpointType,
        id: i32,
        tx: Sender<Vec<u8>>,
        flushes: AtomicUsize,
    }

    impl NodeOwner for Recorder {
        fn kind(&self) -> EndpointType {
            self.kind
        }
        fn id(&self) -> i32 {
            self.id
        }
        fn handle_message(&self, data: &[u8], _from: SocketAddr) {
            let _ = self.tx.send(data.to_vec());
        }
        fn flush(&self, _sink: &dyn PacketSink) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recorder(kind: EndpointType, id: i32) -> (Arc<Recorder>, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        (Arc::new(Recorder { kind, id, tx, flushes: AtomicUsize::new(0) }), rx)
    }

    fn datagram(kind: EndpointType, id: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Header::new(kind, id, 0).encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_shared_port_refcount() {
        let registry = NodeRegistry::new();
        let (a, _rx_a) = recorder(EndpointType::Sink, 1);
        let (b, _rx_b) = recorder(EndpointType::Source, 1);
        let a_dyn: Arc<dyn NodeOwner> = a;
        let b_dyn: Arc<dyn NodeOwner> = b;

        let h1 = registry.acquire(0, &a_dyn, 1).unwrap();
        let port = h1.port();
        let h2 = registry.acquire(port, &b_dyn, 1).unwrap();
        assert_eq!(h2.local_addr(), h1.local_addr());
        assert_eq!(registry.node_count(), 1);
        assert_eq!(registry.ref_count(port), 2);

        h1.release();
        assert_eq!(registry.ref_count(port), 1);
        drop(h2);
        assert_eq!(registry.ref_count(port), 0);
        assert_eq!(registry.node_count(), 0);

        // The port is free again
        let h3 = registry.acquire(port, &a_dyn, 1).unwrap();
        assert_eq!(h3.port(), port);
    }

    #[test]
    fn test_routing_by_type_and_id() {
        let registry = NodeRegistry::new();
        let (sink1, rx1) = recorder(EndpointType::Sink, 1);
        let (sink2, rx2) = recorder(EndpointType::Sink, 2);
        let s1: Arc<dyn NodeOwner> = sink1;
        let s2: Arc<dyn NodeOwner> = sink2;
        let h1 = registry.acquire(0, &s1, 1).unwrap();
        let _h2 = registry.acquire(h1.port(), &s2, 2).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = loopback_addr(&h1.local_addr());
        peer.send_to(&datagram(EndpointType::Sink, 2), target).unwrap();
        peer.send_to(b"garbage", target).unwrap();
        peer.send_to(&datagram(EndpointType::Source, 1), target).unwrap();
        peer.send_to(&datagram(EndpointType::Sink, ID_WILDCARD), target).unwrap();

        let got = rx2.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peek_header(&got).unwrap().id, 2);
        // Wildcard goes to the first registered sink only
        let got = rx1.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(peek_header(&got).unwrap().is_wildcard());
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_err());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(h1.stats().dropped, 2);
    }

    #[test]
    fn test_notify_flushes_owners() {
        let registry = NodeRegistry::with_config(NodeConfig { tick_interval_ms: 1000, ..NodeConfig::default() });
        let (owner, _rx) = recorder(EndpointType::Source, 0);
        let owner_dyn: Arc<dyn NodeOwner> = owner.clone();
        let handle = registry.acquire(0, &owner_dyn, 0).unwrap();

        handle.notify();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while owner.flushes.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(owner.flushes.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_dropped_owner_is_skipped() {
        let registry = NodeRegistry::new();
        let (owner, rx) = recorder(EndpointType::Sink, 5);
        let owner_dyn: Arc<dyn NodeOwner> = owner;
        let handle = registry.acquire(0, &owner_dyn, 5).unwrap();
        drop(owner_dyn);

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(&datagram(EndpointType::Sink, 5), loopback_addr(&handle.local_addr())).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_arena_generations() {
        let mut arena = OwnerArena::default();
        let (owner, _rx) = recorder(EndpointType::Sink, 1);
        let owner_dyn: Arc<dyn NodeOwner> = owner;
        let entry = || OwnerEntry { kind: EndpointType::Sink, id: 1, owner: Arc::downgrade(&owner_dyn) };

        let first = arena.insert(entry());
        assert!(arena.remove(first));
        let second = arena.insert(entry());
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        // A stale key cannot remove the new occupant
        assert!(!arena.remove(first));
        assert_eq!(arena.len(), 1);
    }
}

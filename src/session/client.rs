//! Session client
//!
//! The control channel to the relay server is a TCP connection served by two
//! threads: the reader applies server responses to the session state and
//! resolves the matching [`Reply`], the writer sends queued requests and a
//! keep-alive ping whenever it has been idle for `ping_interval`.
//!
//! Each connection attempt gets a new generation number. Responses from an
//! older connection (for example a late reply after `disconnect()`) are
//! ignored, so `disconnect()` can drop all session state synchronously.
//!
//! Messages from peers are never handed to user code on a network thread.
//! They are queued and delivered by [`Client::dispatch_replies`] and
//! [`Client::process`], on the caller's thread.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use super::events::{ClientState, IncomingMessage, SessionEvent};
use super::peer::{Peer, PeerTable};
use super::reply::{reply, Reply, Resolver};
use super::scheduler::Scheduler;
use crate::config::ClientConfig;
use crate::constants::{EVENT_QUEUE_SIZE, OUTGOING_QUEUE_SIZE};
use crate::error::{ErrorCode, NetworkError, SessionError};
use crate::network::{NodeHandle, NodeOwner, NodeRegistry, PacketSink};
use crate::protocol::session::{read_frame, write_frame, SESSION_VERSION};
use crate::protocol::{ClientRequest, EndpointType, PeerMessage, RelayTarget, Rejection, ServerResponse};
use crate::stream::{notify, EventQueue, OutgoingQueue};
use crate::time::TimeTag;

/// Node id of session clients; peer datagrams are addressed to the wildcard
const CLIENT_ID: i32 = 0;

type MessageHandler = Box<dyn FnMut(&IncomingMessage) + Send>;

fn rejected(rejection: Rejection) -> SessionError {
    SessionError::Rejected { code: rejection.code, message: rejection.message }
}

enum Pending {
    Login(Resolver<u32>),
    Join { group: String, resolver: Resolver<()> },
    Leave { group: String, resolver: Resolver<()> },
}

impl Pending {
    fn fail(self, error: SessionError) {
        match self {
            Pending::Login(resolver) => resolver.resolve(Err(error)),
            Pending::Join { resolver, .. } | Pending::Leave { resolver, .. } => resolver.resolve(Err(error)),
        }
    }
}

struct Session {
    state: ClientState,
    generation: u64,
    user: String,
    user_id: Option<u32>,
    peers: PeerTable,
    groups: Vec<String>,
    pending: HashMap<u32, Pending>,
    writer: Option<Sender<ClientRequest>>,
}

impl Session {
    /// `state` only tracks the login; group membership is layered on top
    fn visible_state(&self) -> ClientState {
        if self.state != ClientState::Connected {
            self.state
        } else if self.pending.values().any(|p| matches!(p, Pending::Join { .. })) {
            ClientState::GroupJoining
        } else if !self.groups.is_empty() {
            ClientState::GroupJoined
        } else {
            ClientState::Connected
        }
    }

    /// Back to `Disconnected`, returning what has to be cleaned up
    fn reset(&mut self) -> (Vec<Peer>, Vec<Pending>) {
        self.state = ClientState::Disconnected;
        self.generation += 1;
        self.user_id = None;
        self.writer = None;
        self.groups.clear();
        let pending = self.pending.drain().map(|(_, p)| p).collect();
        (self.peers.clear(), pending)
    }
}

struct ClientInner {
    config: RwLock<ClientConfig>,
    session: Mutex<Session>,
    /// Messages received on network threads, waiting for `dispatch_replies`
    inbox: Mutex<Vec<IncomingMessage>>,
    scheduler: Mutex<Scheduler<IncomingMessage>>,
    handler: Mutex<Option<MessageHandler>>,
    events: EventQueue<SessionEvent>,
    outgoing: OutgoingQueue,
    handle: Mutex<Option<NodeHandle>>,
    /// Raw time tag of the last `process` call
    time: AtomicU64,
    next_token: AtomicU32,
}

/// Session layer peer: joins groups on a relay server and exchanges
/// messages with the other members
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let scheduled = config.max_scheduled;
        Self {
            inner: Arc::new(ClientInner {
                config: RwLock::new(config),
                session: Mutex::new(Session {
                    state: ClientState::Disconnected,
                    generation: 0,
                    user: String::new(),
                    user_id: None,
                    peers: PeerTable::new(),
                    groups: Vec::new(),
                    pending: HashMap::new(),
                    writer: None,
                }),
                inbox: Mutex::new(Vec::new()),
                scheduler: Mutex::new(Scheduler::new(scheduled)),
                handler: Mutex::new(None),
                events: EventQueue::new(EVENT_QUEUE_SIZE),
                outgoing: OutgoingQueue::new(OUTGOING_QUEUE_SIZE),
                handle: Mutex::new(None),
                time: AtomicU64::new(0),
                next_token: AtomicU32::new(1),
            }),
        }
    }

    pub fn owner(&self) -> Arc<dyn NodeOwner> {
        self.inner.clone()
    }

    /// The node's port is announced to the server, and peer datagrams go
    /// through its socket
    pub fn attach(&self, handle: NodeHandle) {
        let old = self.inner.handle.lock().replace(handle);
        drop(old);
    }

    pub fn bind(&self, registry: &NodeRegistry, port: u16) -> Result<u16, NetworkError> {
        let handle = registry.acquire(port, &self.owner(), CLIENT_ID)?;
        let port = handle.port();
        self.attach(handle);
        Ok(port)
    }

    pub fn detach(&self) -> Option<NodeHandle> {
        self.inner.handle.lock().take()
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: ClientConfig) {
        self.inner.scheduler.lock().set_capacity(config.max_scheduled);
        *self.inner.config.write() = config;
    }

    pub fn state(&self) -> ClientState {
        self.inner.session.lock().visible_state()
    }

    pub fn user_id(&self) -> Option<u32> {
        self.inner.session.lock().user_id
    }

    pub fn groups(&self) -> Vec<String> {
        self.inner.session.lock().groups.clone()
    }

    /// Log in to the relay server at `host:port`
    pub fn connect(&self, host: &str, port: u16, user: &str, password: &str) -> Reply<u32> {
        let Some(udp_port) = self.inner.handle.lock().as_ref().map(|h| h.port()) else {
            return Reply::ready(Err(SessionError::NoNode));
        };
        let token = self.inner.token();
        let (resolver, reply) = reply();
        let generation = {
            let mut session = self.inner.session.lock();
            if session.state != ClientState::Disconnected {
                return Reply::ready(Err(SessionError::AlreadyConnected));
            }
            session.state = ClientState::Connecting;
            session.generation += 1;
            session.user = user.to_string();
            session.pending.insert(token, Pending::Login(resolver));
            session.generation
        };

        tracing::info!("Connecting to {}:{} as {}", host, port, user);
        let login = ClientRequest::Login {
            token,
            version: SESSION_VERSION,
            user: user.to_string(),
            password: password.to_string(),
            udp_port,
        };
        let inner = Arc::clone(&self.inner);
        let host = host.to_string();
        let spawned = thread::Builder::new()
            .name("aoo-client-reader".into())
            .spawn(move || inner.run_connection(generation, &host, port, login));
        if let Err(e) = spawned {
            self.inner.fail_connect(generation, SessionError::ServerUnreachable(e.to_string()));
        }
        reply
    }

    /// Leave the server. Peers and groups are gone when this returns.
    pub fn disconnect(&self) {
        let (peers, pending) = {
            let mut session = self.inner.session.lock();
            if session.state == ClientState::Disconnected {
                return;
            }
            if let Some(writer) = session.writer.as_ref() {
                let _ = writer.send(ClientRequest::Logout { token: self.inner.token() });
            }
            session.reset()
        };
        for request in pending {
            request.fail(SessionError::Disconnected);
        }
        self.inner.clear_labels(&peers);
        tracing::info!("Disconnected from server");
        self.inner.events.push(SessionEvent::Disconnected { error: None });
    }

    pub fn join_group(&self, group: &str, password: &str) -> Reply<()> {
        let request = ClientRequest::JoinGroup {
            token: 0,
            group: group.to_string(),
            password: password.to_string(),
        };
        self.inner.group_request(group, request, true)
    }

    pub fn leave_group(&self, group: &str) -> Reply<()> {
        let request = ClientRequest::LeaveGroup { token: 0, group: group.to_string() };
        self.inner.group_request(group, request, false)
    }

    /// Current peers, from the local cache
    pub fn list_peers(&self) -> Vec<Peer> {
        self.inner.session.lock().peers.to_vec()
    }

    pub fn find_peer(&self, group: &str, user: &str) -> Option<Peer> {
        self.inner.session.lock().peers.find_by_name(group, user).cloned()
    }

    /// Send `payload` to the peers selected by `target`.
    ///
    /// Reliable messages go through the server in order; unreliable ones are
    /// sent directly to each peer's node. A `time_tag` in the future makes
    /// the receiver hold the message until its clock reaches that time.
    pub fn send_message(
        &self,
        target: &RelayTarget,
        payload: &[u8],
        time_tag: TimeTag,
        reliable: bool,
    ) -> Result<(), SessionError> {
        if !reliable && self.inner.handle.lock().is_none() {
            return Err(SessionError::NoNode);
        }
        let session = self.inner.session.lock();
        if session.state != ClientState::Connected {
            return Err(SessionError::NotConnected);
        }
        if reliable {
            let writer = session.writer.as_ref().ok_or(SessionError::NotConnected)?;
            let request = ClientRequest::Relay { target: target.clone(), time_tag, payload: payload.to_vec() };
            return writer.send(request).map_err(|_| SessionError::Disconnected);
        }

        let user_id = session.user_id.ok_or(SessionError::NotConnected)?;
        let recipients: Vec<&Peer> = match target {
            RelayTarget::Broadcast => session.peers.iter().collect(),
            RelayTarget::Group(group) => {
                if !session.groups.contains(group) {
                    return Err(SessionError::UnknownTarget(group.clone()));
                }
                session.peers.in_group(group).collect()
            }
            RelayTarget::Peer { group, user_id: peer_id } => match session.peers.find(group, *peer_id) {
                Some(peer) => vec![peer],
                None => return Err(SessionError::UnknownTarget(format!("{}|{}", group, peer_id))),
            },
        };

        let payload = Bytes::copy_from_slice(payload);
        let mut queued = false;
        for peer in recipients {
            let message = PeerMessage {
                group: peer.group.clone(),
                from_user_id: user_id,
                time_tag,
                payload: payload.clone(),
            };
            match message.encode() {
                Ok(packet) => queued |= self.inner.outgoing.push(peer.address, packet),
                Err(e) => tracing::warn!("Cannot send to {}: {}", peer.label(), e),
            }
        }
        drop(session);
        if queued {
            notify(&self.inner.handle);
        }
        Ok(())
    }

    /// Install the callback for peer messages. It runs inside
    /// `dispatch_replies` / `process` and must not call back into this method.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: FnMut(&IncomingMessage) + Send + 'static,
    {
        *self.inner.handler.lock() = Some(Box::new(handler));
    }

    pub fn clear_message_handler(&self) {
        *self.inner.handler.lock() = None;
    }

    /// Deliver messages received since the last call. Messages scheduled
    /// for later are queued until `process` reaches their time.
    pub fn dispatch_replies(&self) -> usize {
        let messages = std::mem::take(&mut *self.inner.inbox.lock());
        let count = messages.len();
        let now = self.inner.now();
        let discard_late = self.inner.config.read().discard_late;
        for message in messages {
            self.inner.schedule(message, now, discard_late);
        }
        count
    }

    /// Once per audio block with the dejitter clock's time
    pub fn process(&self, now: TimeTag) {
        self.inner.time.store(now.raw(), Ordering::Release);
        self.dispatch_replies();
        loop {
            let due = self.inner.scheduler.lock().pop_due(now);
            let Some((time, mut message)) = due else {
                break;
            };
            message.delay = TimeTag::duration(time, now).max(0.0);
            self.inner.deliver(message);
        }
    }

    /// Time of the last `process` call, or the wall clock before the first one
    pub fn time(&self) -> TimeTag {
        self.inner.now()
    }

    pub fn scheduled(&self) -> usize {
        self.inner.scheduler.lock().len()
    }

    pub fn poll_events(&self) -> Vec<SessionEvent> {
        self.inner.events.poll()
    }

    pub fn events(&self) -> &EventQueue<SessionEvent> {
        &self.inner.events
    }
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host));
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn write_loop(mut stream: TcpStream, requests: Receiver<ClientRequest>, ping_interval: Duration) {
    loop {
        let request = match requests.recv_timeout(ping_interval) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => ClientRequest::Ping,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let last = matches!(request, ClientRequest::Logout { .. });
        if let Err(e) = write_frame(&mut stream, &request) {
            tracing::debug!("Control channel write failed: {}", e);
            break;
        }
        if last {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

impl ClientInner {
    fn token(&self) -> u32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn now(&self) -> TimeTag {
        match self.time.load(Ordering::Acquire) {
            0 => TimeTag::now(),
            raw => TimeTag::from_raw(raw),
        }
    }

    fn run_connection(self: Arc<Self>, generation: u64, host: &str, port: u16, login: ClientRequest) {
        let config = self.config.read().clone();
        let timeout = Duration::from_millis(config.connect_timeout_ms as u64);
        let stream = match open_stream(host, port, timeout).and_then(|s| s.try_clone().map(|w| (s, w))) {
            Ok(streams) => streams,
            Err(e) => {
                self.fail_connect(generation, SessionError::ServerUnreachable(format!("{}:{}: {}", host, port, e)));
                return;
            }
        };
        let (stream, writer) = stream;

        let (tx, rx) = unbounded();
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            let _ = tx.send(login);
            session.writer = Some(tx);
        }

        let ping_interval = Duration::from_millis(config.ping_interval_ms.max(1) as u64);
        let spawned = thread::Builder::new()
            .name("aoo-client-writer".into())
            .spawn(move || write_loop(writer, rx, ping_interval));
        if let Err(e) = spawned {
            let _ = stream.shutdown(Shutdown::Both);
            self.fail_connect(generation, SessionError::ServerUnreachable(e.to_string()));
            return;
        }

        let mut reader = BufReader::new(stream);
        loop {
            match read_frame::<ServerResponse>(&mut reader) {
                Ok(response) => self.handle_response(generation, response),
                Err(e) => {
                    self.connection_lost(generation, e.to_string());
                    break;
                }
            }
        }
    }

    fn fail_connect(&self, generation: u64, error: SessionError) {
        let (_, pending) = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.reset()
        };
        tracing::warn!("Cannot connect: {}", error);
        for request in pending {
            request.fail(error.clone());
        }
    }

    fn connection_lost(&self, generation: u64, reason: String) {
        let (peers, pending) = {
            let mut session = self.session.lock();
            if session.generation != generation || session.state == ClientState::Disconnected {
                return;
            }
            if session.state == ClientState::Connecting {
                drop(session);
                self.fail_connect(generation, SessionError::ServerUnreachable(reason));
                return;
            }
            session.reset()
        };
        tracing::warn!("Lost connection to server: {}", reason);
        for request in pending {
            request.fail(SessionError::Disconnected);
        }
        self.clear_labels(&peers);
        self.events.push(SessionEvent::Disconnected { error: Some(reason) });
    }

    fn group_request(&self, group: &str, mut request: ClientRequest, join: bool) -> Reply<()> {
        let token = self.token();
        match &mut request {
            ClientRequest::JoinGroup { token: t, .. } | ClientRequest::LeaveGroup { token: t, .. } => *t = token,
            _ => {}
        }

        let mut session = self.session.lock();
        if session.state != ClientState::Connected {
            return Reply::ready(Err(SessionError::NotConnected));
        }
        let member = session.groups.iter().any(|g| g == group);
        if join && member {
            let message = format!("already in group '{}'", group);
            return Reply::ready(Err(SessionError::Rejected { code: ErrorCode::AlreadyInGroup, message }));
        }
        if !join && !member {
            let message = format!("not in group '{}'", group);
            return Reply::ready(Err(SessionError::Rejected { code: ErrorCode::NotInGroup, message }));
        }
        let Some(writer) = session.writer.clone() else {
            return Reply::ready(Err(SessionError::NotConnected));
        };

        let (resolver, reply) = reply();
        let group = group.to_string();
        let pending = if join { Pending::Join { group, resolver } } else { Pending::Leave { group, resolver } };
        session.pending.insert(token, pending);
        if writer.send(request).is_err() {
            if let Some(pending) = session.pending.remove(&token) {
                pending.fail(SessionError::Disconnected);
            }
        }
        reply
    }

    fn handle_response(&self, generation: u64, response: ServerResponse) {
        let mut joined = Vec::new();
        let mut left = Vec::new();
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            match response {
                ServerResponse::LoginReply { token, result } => {
                    let Some(Pending::Login(resolver)) = session.pending.remove(&token) else {
                        tracing::debug!("Unexpected login reply");
                        return;
                    };
                    match result {
                        Ok(user_id) => {
                            session.state = ClientState::Connected;
                            session.user_id = Some(user_id);
                            session.peers.clear();
                            session.groups.clear();
                            tracing::info!("Connected as {} (user id {})", session.user, user_id);
                            self.events.push(SessionEvent::Connected { user_id });
                            resolver.resolve(Ok(user_id));
                        }
                        Err(rejection) => {
                            tracing::warn!("Login refused: {}", rejection.message);
                            let (_, pending) = session.reset();
                            drop(session);
                            resolver.resolve(Err(rejected(rejection)));
                            for request in pending {
                                request.fail(SessionError::Disconnected);
                            }
                            return;
                        }
                    }
                }
                ServerResponse::LogoutReply { .. } => {}
                ServerResponse::JoinReply { token, group, result } => match session.pending.remove(&token) {
                    Some(Pending::Join { resolver, .. }) => match result {
                        Ok(()) => {
                            if !session.groups.contains(&group) {
                                session.groups.push(group.clone());
                            }
                            tracing::info!("Joined group {}", group);
                            self.events.push(SessionEvent::GroupJoin { group });
                            resolver.resolve(Ok(()));
                        }
                        Err(rejection) => {
                            tracing::warn!("Cannot join group {}: {}", group, rejection.message);
                            resolver.resolve(Err(rejected(rejection)));
                        }
                    },
                    _ => tracing::debug!("Unexpected join reply for {}", group),
                },
                ServerResponse::LeaveReply { token, group, result } => match session.pending.remove(&token) {
                    Some(Pending::Leave { resolver, .. }) => match result {
                        Ok(()) => {
                            session.groups.retain(|g| g != &group);
                            left = session.peers.remove_group(&group);
                            for peer in &left {
                                self.events.push(SessionEvent::PeerLeave(peer.clone()));
                            }
                            tracing::info!("Left group {}", group);
                            self.events.push(SessionEvent::GroupLeave { group });
                            resolver.resolve(Ok(()));
                        }
                        Err(rejection) => resolver.resolve(Err(rejected(rejection))),
                    },
                    _ => tracing::debug!("Unexpected leave reply for {}", group),
                },
                ServerResponse::PeerJoin { group, user, user_id, address } => {
                    if session.state != ClientState::Connected {
                        return;
                    }
                    let peer = Peer { group, user, user_id, address };
                    if session.peers.add(peer.clone()) {
                        tracing::info!("Peer {} joined from {}", peer.label(), peer.address);
                        self.events.push(SessionEvent::PeerJoin(peer.clone()));
                        joined.push(peer);
                    } else {
                        tracing::debug!("Peer {} already known", peer.label());
                    }
                }
                ServerResponse::PeerLeave { group, user_id, .. } => {
                    if let Some(peer) = session.peers.remove(&group, user_id) {
                        tracing::info!("Peer {} left", peer.label());
                        self.events.push(SessionEvent::PeerLeave(peer.clone()));
                        left.push(peer);
                    }
                }
                ServerResponse::Message { group, user, user_id, time_tag, payload } => {
                    drop(session);
                    self.inbox.lock().push(IncomingMessage {
                        group,
                        user,
                        user_id,
                        time_tag,
                        payload,
                        reliable: true,
                        delay: 0.0,
                    });
                    return;
                }
                ServerResponse::Pong => tracing::trace!("Server pong"),
            }
        }

        if let Some(handle) = self.handle.lock().as_ref() {
            for peer in joined {
                handle.resolver().set_label(peer.address, peer.label());
            }
        }
        self.clear_labels(&left);
    }

    fn clear_labels(&self, peers: &[Peer]) {
        if peers.is_empty() {
            return;
        }
        if let Some(handle) = self.handle.lock().as_ref() {
            for peer in peers {
                handle.resolver().clear_label(&peer.address);
            }
        }
    }

    fn schedule(&self, mut message: IncomingMessage, now: TimeTag, discard_late: bool) {
        let time = message.time_tag;
        if time.is_immediate() {
            self.deliver(message);
            return;
        }
        let ahead = TimeTag::duration(now, time);
        if ahead > 0.0 {
            if !self.scheduler.lock().push(time, message) {
                tracing::warn!("Scheduled message queue full, dropping message");
            }
        } else if discard_late {
            tracing::debug!("Discarding message from {} ({:.1} ms late)", message.user, -ahead * 1000.0);
        } else {
            message.delay = -ahead;
            self.deliver(message);
        }
    }

    fn deliver(&self, message: IncomingMessage) {
        let mut handler = self.handler.lock();
        match handler.as_mut() {
            Some(handler) => handler(&message),
            None => self.events.push(SessionEvent::Message(message)),
        }
    }
}

impl NodeOwner for ClientInner {
    fn kind(&self) -> EndpointType {
        EndpointType::Client
    }

    fn id(&self) -> i32 {
        CLIENT_ID
    }

    fn handle_message(&self, data: &[u8], from: SocketAddr) {
        let message = match PeerMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping peer datagram from {}: {}", from, e);
                return;
            }
        };
        let user = {
            let session = self.session.lock();
            if session.state != ClientState::Connected {
                return;
            }
            match session.peers.find(&message.group, message.from_user_id) {
                Some(peer) => peer.user.clone(),
                None => {
                    tracing::debug!("Message from unknown peer {} at {}", message.from_user_id, from);
                    return;
                }
            }
        };
        self.inbox.lock().push(IncomingMessage {
            group: message.group,
            user,
            user_id: message.from_user_id,
            time_tag: message.time_tag,
            payload: message.payload.to_vec(),
            reliable: false,
            delay: 0.0,
        });
    }

    fn flush(&self, sink: &dyn PacketSink) {
        self.outgoing.flush(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::session::{encode_frame, read_frame};
    use std::io::Write;
    use std::net::TcpListener;

    fn message(time_tag: TimeTag, text: &str) -> IncomingMessage {
        IncomingMessage {
            group: "demo".into(),
            user: "bob".into(),
            user_id: 2,
            time_tag,
            payload: text.as_bytes().to_vec(),
            reliable: true,
            delay: 0.0,
        }
    }

    fn collecting(client: &Client) -> Arc<Mutex<Vec<IncomingMessage>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.set_message_handler(move |m| sink.lock().push(m.clone()));
        received
    }

    #[test]
    fn test_requires_node_and_connection() {
        let client = Client::new(ClientConfig::default());
        assert_eq!(client.connect("127.0.0.1", 1, "alice", "").wait(), Err(SessionError::NoNode));
        assert_eq!(client.join_group("demo", "").wait(), Err(SessionError::NotConnected));
        assert_eq!(
            client.send_message(&RelayTarget::Broadcast, b"hi", TimeTag::IMMEDIATE, true),
            Err(SessionError::NotConnected)
        );
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_immediate_messages_dispatch_on_caller() {
        let client = Client::new(ClientConfig::default());
        let received = collecting(&client);
        client.inner.inbox.lock().push(message(TimeTag::IMMEDIATE, "now"));
        assert!(received.lock().is_empty());
        assert_eq!(client.dispatch_replies(), 1);
        assert_eq!(received.lock()[0].payload, b"now");
    }

    #[test]
    fn test_scheduled_message_waits_for_its_time() {
        let client = Client::new(ClientConfig::default());
        let received = collecting(&client);
        let start = TimeTag::from_seconds(5000.0);
        client.process(start);
        client.inner.inbox.lock().push(message(start.add_seconds(0.2), "later"));

        client.process(start.add_seconds(0.1));
        assert!(received.lock().is_empty());
        assert_eq!(client.scheduled(), 1);

        client.process(start.add_seconds(0.25));
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert!((received[0].delay - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_late_messages() {
        let client = Client::new(ClientConfig::default());
        let start = TimeTag::from_seconds(5000.0);
        client.process(start);
        client.inner.inbox.lock().push(message(start.add_seconds(-0.5), "late"));
        client.dispatch_replies();
        // Without a handler messages become events
        match client.poll_events().as_slice() {
            [SessionEvent::Message(m)] => assert!((m.delay - 0.5).abs() < 1e-6),
            other => panic!("unexpected events {:?}", other),
        }

        client.set_config(ClientConfig { discard_late: true, ..ClientConfig::default() });
        client.inner.inbox.lock().push(message(start.add_seconds(-0.5), "late"));
        client.dispatch_replies();
        assert!(client.poll_events().is_empty());
    }

    #[test]
    fn test_unreachable_server() {
        let registry = NodeRegistry::new();
        let client = Client::new(ClientConfig { connect_timeout_ms: 500, ..ClientConfig::default() });
        client.bind(&registry, 0).unwrap();

        // Bound but never accepting
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = client.connect("127.0.0.1", port, "alice", "").wait_timeout(Duration::from_secs(5));
        assert!(matches!(result, Err(SessionError::ServerUnreachable(_))));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_login_peers_and_disconnect() {
        let registry = NodeRegistry::new();
        let client = Client::new(ClientConfig::default());
        client.bind(&registry, 0).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = stream.try_clone().unwrap();
            let token = match read_frame::<ClientRequest>(&mut reader).unwrap() {
                ClientRequest::Login { token, user, .. } => {
                    assert_eq!(user, "alice");
                    token
                }
                other => panic!("expected login, got {:?}", other),
            };
            let replies = [
                ServerResponse::LoginReply { token, result: Ok(5) },
                ServerResponse::PeerJoin {
                    group: "demo".into(),
                    user: "bob".into(),
                    user_id: 6,
                    address: "127.0.0.1:9999".parse().unwrap(),
                },
            ];
            for reply in &replies {
                stream.write_all(&encode_frame(reply).unwrap()).unwrap();
            }
            // Wait for the logout (or the socket closing)
            let _ = read_frame::<ClientRequest>(&mut reader);
        });

        let user_id = client.connect("127.0.0.1", port, "alice", "").wait_timeout(Duration::from_secs(5));
        assert_eq!(user_id, Ok(5));
        assert_eq!(client.state(), ClientState::Connected);

        for _ in 0..200 {
            if !client.list_peers().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.find_peer("demo", "bob").map(|p| p.user_id), Some(6));

        client.disconnect();
        assert!(client.list_peers().is_empty());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.poll_events().contains(&SessionEvent::Disconnected { error: None }));
        server.join().unwrap();
    }

    #[test]
    fn test_state_follows_group_join() {
        let registry = NodeRegistry::new();
        let client = Client::new(ClientConfig::default());
        client.bind(&registry, 0).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = stream.try_clone().unwrap();
            let token = match read_frame::<ClientRequest>(&mut reader).unwrap() {
                ClientRequest::Login { token, .. } => token,
                other => panic!("expected login, got {:?}", other),
            };
            let reply = ServerResponse::LoginReply { token, result: Ok(5) };
            stream.write_all(&encode_frame(&reply).unwrap()).unwrap();

            let (token, group) = match read_frame::<ClientRequest>(&mut reader).unwrap() {
                ClientRequest::JoinGroup { token, group, .. } => (token, group),
                other => panic!("expected join, got {:?}", other),
            };
            received_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            let reply = ServerResponse::JoinReply { token, group, result: Ok(()) };
            stream.write_all(&encode_frame(&reply).unwrap()).unwrap();
            let _ = read_frame::<ClientRequest>(&mut reader);
        });

        let user_id = client.connect("127.0.0.1", port, "alice", "").wait_timeout(Duration::from_secs(5));
        assert_eq!(user_id, Ok(5));
        assert_eq!(client.state(), ClientState::Connected);

        let joined = client.join_group("demo", "");
        received_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(client.state(), ClientState::GroupJoining);
        assert!(client.state().is_connected());

        release_tx.send(()).unwrap();
        assert_eq!(joined.wait_timeout(Duration::from_secs(5)), Ok(()));
        assert_eq!(client.state(), ClientState::GroupJoined);
        assert_eq!(client.groups(), vec!["demo".to_string()]);

        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.state().is_connected());
        server.join().unwrap();
    }
}

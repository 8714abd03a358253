//! Rendezvous and relay server
//!
//! Clients log in over TCP, join password protected groups and learn the
//! UDP addresses of the other members. The server never touches audio; it
//! only introduces peers and forwards reliable messages between them.
//!
//! Each connection gets a reader task and a writer task. Everything sent to
//! a client goes through its unbounded channel, so replies and notifications
//! for one client always arrive in the order they were produced under the
//! registry lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::constants::EVENT_QUEUE_SIZE;
use crate::error::{ErrorCode, NetworkError, ProtocolError};
use crate::protocol::session::{decode_frame, encode_frame, MAX_FRAME_SIZE, SESSION_VERSION};
use crate::protocol::{ClientRequest, RelayTarget, Rejection, ServerResponse};
use crate::stream::EventQueue;
use crate::time::TimeTag;

/// Something that happened on the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ServerEvent {
    UserJoin { user: String, user_id: u32, address: SocketAddr },
    UserLeave { user: String, user_id: u32 },
    GroupAdd { group: String },
    GroupRemove { group: String },
    GroupJoin { group: String, user: String, user_id: u32 },
    GroupLeave { group: String, user: String, user_id: u32 },
}

type Outbox = mpsc::UnboundedSender<ServerResponse>;

struct User {
    name: String,
    /// TCP peer address with the announced UDP port
    address: SocketAddr,
    tx: Outbox,
    groups: HashSet<String>,
}

struct Group {
    password: String,
    members: HashSet<u32>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<u32, User>,
    groups: HashMap<String, Group>,
}

impl Registry {
    fn send(&self, user_id: u32, response: ServerResponse) {
        if let Some(user) = self.users.get(&user_id) {
            // A closed channel means the connection is already going away
            let _ = user.tx.send(response);
        }
    }

    fn members(&self, group: &str) -> Vec<u32> {
        self.groups.get(group).map(|g| g.members.iter().copied().collect()).unwrap_or_default()
    }

    fn find_user(&self, name: &str) -> Option<u32> {
        self.users.iter().find(|(_, u)| u.name == name).map(|(id, _)| *id)
    }
}

struct ServerState {
    config: ServerConfig,
    registry: Mutex<Registry>,
    events: EventQueue<ServerEvent>,
    next_user_id: AtomicU32,
}

struct ServerInner {
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    stop: watch::Sender<bool>,
}

/// Relay server handle. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind the listening socket. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(config: ServerConfig) -> Result<Self, NetworkError> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => NetworkError::PortInUse(config.port),
            _ => NetworkError::BindFailed { port: config.port, reason: e.to_string() },
        })?;
        let local_addr = listener.local_addr().map_err(|e| NetworkError::BindFailed {
            port: config.port,
            reason: e.to_string(),
        })?;
        tracing::info!("Session server listening on {}", local_addr);

        let (stop, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener: tokio::sync::Mutex::new(Some(listener)),
                local_addr,
                state: Arc::new(ServerState {
                    config,
                    registry: Mutex::new(Registry::default()),
                    events: EventQueue::new(EVENT_QUEUE_SIZE),
                    next_user_id: AtomicU32::new(1),
                }),
                stop,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Accept clients until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<(), NetworkError> {
        let listener = self.inner.listener.lock().await.take().ok_or(NetworkError::Closed)?;
        let mut stop = self.inner.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&self.inner.state);
                        let stop = self.inner.stop.subscribe();
                        tokio::spawn(async move {
                            handle_connection(state, stream, addr, stop).await;
                        });
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                _ = stop.changed() => break,
            }
        }
        tracing::info!("Session server stopped");
        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
    }

    pub fn events(&self) -> &EventQueue<ServerEvent> {
        &self.inner.state.events
    }

    pub fn poll_events(&self) -> Vec<ServerEvent> {
        self.inner.state.events.poll()
    }

    pub fn user_count(&self) -> usize {
        self.inner.state.registry.lock().users.len()
    }

    pub fn group_count(&self) -> usize {
        self.inner.state.registry.lock().groups.len()
    }

    /// Names of the members of `group`
    pub fn group_members(&self, group: &str) -> Vec<String> {
        let registry = self.inner.state.registry.lock();
        let mut names: Vec<String> = registry
            .members(group)
            .into_iter()
            .filter_map(|id| registry.users.get(&id).map(|u| u.name.clone()))
            .collect();
        names.sort();
        names
    }
}

async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<ClientRequest> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            ProtocolError::FieldTooLong(len).to_string(),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) {
    tracing::debug!("Connection from {}", addr);
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {}: {}", addr, e);
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerResponse>();

    let send_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let frame = match encode_frame(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Cannot encode response: {}", e);
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let timeout = Duration::from_millis(state.config.client_timeout_ms.max(1));
    let mut user_id = None;
    loop {
        let request = tokio::select! {
            read = tokio::time::timeout(timeout, read_request(&mut reader)) => match read {
                Ok(Ok(request)) => request,
                Ok(Err(e)) => {
                    tracing::debug!("Connection {} closed: {}", addr, e);
                    break;
                }
                Err(_) => {
                    tracing::info!("Client {} timed out", addr);
                    break;
                }
            },
            _ = stop.changed() => break,
        };
        let logout = matches!(request, ClientRequest::Logout { .. });
        state.handle_request(&mut user_id, addr, &tx, request);
        if logout {
            break;
        }
    }

    if let Some(id) = user_id {
        state.remove_user(id);
    }
    // Queued replies (the logout reply among them) still go out
    drop(tx);
    let _ = send_task.await;
}

impl ServerState {
    fn handle_request(&self, user_id: &mut Option<u32>, addr: SocketAddr, tx: &Outbox, request: ClientRequest) {
        let reply = |response: ServerResponse| {
            let _ = tx.send(response);
        };
        let not_logged_in = || Rejection::new(ErrorCode::NotLoggedIn, "not logged in");

        match request {
            ClientRequest::Login { token, version, user, password, udp_port } => {
                let result = self.login(user_id, addr, tx, token, version, user, password, udp_port);
                if let Some(response) = result {
                    reply(response);
                }
            }
            ClientRequest::Logout { token } => {
                if let Some(id) = user_id.take() {
                    self.remove_user(id);
                }
                reply(ServerResponse::LogoutReply { token });
            }
            ClientRequest::JoinGroup { token, group, password } => match *user_id {
                Some(id) => self.join_group(id, token, group, password),
                None => reply(ServerResponse::JoinReply { token, group, result: Err(not_logged_in()) }),
            },
            ClientRequest::LeaveGroup { token, group } => match *user_id {
                Some(id) => self.leave_group(id, token, group),
                None => reply(ServerResponse::LeaveReply { token, group, result: Err(not_logged_in()) }),
            },
            ClientRequest::Relay { target, time_tag, payload } => match *user_id {
                Some(id) => self.relay(id, target, time_tag, payload),
                None => tracing::debug!("Relay from {} before login", addr),
            },
            ClientRequest::Ping => reply(ServerResponse::Pong),
        }
    }

    /// The login reply, or None if it was sent already
    #[allow(clippy::too_many_arguments)]
    fn login(
        &self,
        user_id: &mut Option<u32>,
        addr: SocketAddr,
        tx: &Outbox,
        token: u32,
        version: u32,
        user: String,
        password: String,
        udp_port: u16,
    ) -> Option<ServerResponse> {
        let refuse = |code, message: &str| {
            Some(ServerResponse::LoginReply { token, result: Err(Rejection::new(code, message)) })
        };
        if user_id.is_some() {
            return refuse(ErrorCode::AlreadyLoggedIn, "already logged in");
        }
        if version != SESSION_VERSION {
            return refuse(ErrorCode::VersionMismatch, &format!("server speaks version {}", SESSION_VERSION));
        }
        if password != self.config.password {
            tracing::info!("Refused login of {} from {}: wrong password", user, addr);
            return refuse(ErrorCode::WrongPassword, "wrong server password");
        }

        let mut registry = self.registry.lock();
        if registry.find_user(&user).is_some() {
            return refuse(ErrorCode::AlreadyLoggedIn, &format!("user '{}' is already logged in", user));
        }
        let id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
        let address = SocketAddr::new(addr.ip(), udp_port);
        registry.users.insert(
            id,
            User { name: user.clone(), address, tx: tx.clone(), groups: HashSet::new() },
        );
        *user_id = Some(id);
        tracing::info!("User {} logged in from {} (id {})", user, address, id);
        self.events.push(ServerEvent::UserJoin { user, user_id: id, address });
        Some(ServerResponse::LoginReply { token, result: Ok(id) })
    }

    fn join_group(&self, user_id: u32, token: u32, group: String, password: String) {
        let mut registry = self.registry.lock();
        let refuse = |registry: &Registry, code, message: &str| {
            let result = Err(Rejection::new(code, message));
            registry.send(user_id, ServerResponse::JoinReply { token, group: group.clone(), result });
        };

        let existing = registry.groups.get(&group).map(|g| (g.members.contains(&user_id), g.password == password));
        match existing {
            Some((true, _)) => return refuse(&registry, ErrorCode::AlreadyInGroup, "already in group"),
            Some((false, false)) => return refuse(&registry, ErrorCode::WrongPassword, "wrong group password"),
            Some((false, true)) => {}
            None => {
                registry.groups.insert(group.clone(), Group { password, members: HashSet::new() });
                tracing::info!("Group {} created", group);
                self.events.push(ServerEvent::GroupAdd { group: group.clone() });
            }
        }

        let others = registry.members(&group);
        let Some(joiner) = registry.users.get_mut(&user_id) else {
            return;
        };
        joiner.groups.insert(group.clone());
        let (name, address) = (joiner.name.clone(), joiner.address);
        if let Some(entry) = registry.groups.get_mut(&group) {
            entry.members.insert(user_id);
        }

        registry.send(user_id, ServerResponse::JoinReply { token, group: group.clone(), result: Ok(()) });
        for other in others {
            let Some(peer) = registry.users.get(&other) else {
                continue;
            };
            let introduce_peer = ServerResponse::PeerJoin {
                group: group.clone(),
                user: peer.name.clone(),
                user_id: other,
                address: peer.address,
            };
            let introduce_joiner = ServerResponse::PeerJoin {
                group: group.clone(),
                user: name.clone(),
                user_id,
                address,
            };
            registry.send(user_id, introduce_peer);
            registry.send(other, introduce_joiner);
        }
        tracing::info!("User {} joined group {}", name, group);
        self.events.push(ServerEvent::GroupJoin { group, user: name, user_id });
    }

    fn leave_group(&self, user_id: u32, token: u32, group: String) {
        let mut registry = self.registry.lock();
        let member = registry.groups.get(&group).is_some_and(|g| g.members.contains(&user_id));
        if !member {
            let result = Err(Rejection::new(ErrorCode::NotInGroup, "not in group"));
            registry.send(user_id, ServerResponse::LeaveReply { token, group, result });
            return;
        }
        self.remove_member(&mut registry, user_id, &group);
        registry.send(user_id, ServerResponse::LeaveReply { token, group, result: Ok(()) });
    }

    /// Take `user_id` out of `group`, tell the remaining members and drop
    /// the group once it is empty
    fn remove_member(&self, registry: &mut Registry, user_id: u32, group: &str) {
        let name = match registry.users.get_mut(&user_id) {
            Some(user) => {
                user.groups.remove(group);
                user.name.clone()
            }
            None => return,
        };
        let empty = match registry.groups.get_mut(group) {
            Some(entry) => {
                entry.members.remove(&user_id);
                entry.members.is_empty()
            }
            None => return,
        };
        for other in registry.members(group) {
            registry.send(other, ServerResponse::PeerLeave { group: group.to_string(), user: name.clone(), user_id });
        }
        tracing::info!("User {} left group {}", name, group);
        self.events.push(ServerEvent::GroupLeave { group: group.to_string(), user: name, user_id });
        if empty {
            registry.groups.remove(group);
            tracing::info!("Group {} removed", group);
            self.events.push(ServerEvent::GroupRemove { group: group.to_string() });
        }
    }

    fn remove_user(&self, user_id: u32) {
        let mut registry = self.registry.lock();
        let groups: Vec<String> = match registry.users.get(&user_id) {
            Some(user) => user.groups.iter().cloned().collect(),
            None => return,
        };
        for group in groups {
            self.remove_member(&mut registry, user_id, &group);
        }
        if let Some(user) = registry.users.remove(&user_id) {
            tracing::info!("User {} logged out", user.name);
            self.events.push(ServerEvent::UserLeave { user: user.name, user_id });
        }
    }

    fn relay(&self, user_id: u32, target: RelayTarget, time_tag: TimeTag, payload: Vec<u8>) {
        let registry = self.registry.lock();
        let Some(sender) = registry.users.get(&user_id) else {
            return;
        };
        let message = |group: &str| ServerResponse::Message {
            group: group.to_string(),
            user: sender.name.clone(),
            user_id,
            time_tag,
            payload: payload.clone(),
        };

        match target {
            RelayTarget::Broadcast => {
                for group in &sender.groups {
                    for other in registry.members(group).into_iter().filter(|&id| id != user_id) {
                        registry.send(other, message(group));
                    }
                }
            }
            RelayTarget::Group(group) => {
                if !sender.groups.contains(&group) {
                    tracing::debug!("{} relays to group {} without being a member", sender.name, group);
                    return;
                }
                for other in registry.members(&group).into_iter().filter(|&id| id != user_id) {
                    registry.send(other, message(&group));
                }
            }
            RelayTarget::Peer { group, user_id: target } => {
                let shared = sender.groups.contains(&group) && registry.members(&group).contains(&target);
                if shared && target != user_id {
                    registry.send(target, message(&group));
                } else {
                    tracing::debug!("{} relays to unknown peer {} in {}", sender.name, target, group);
                }
            }
        }
    }
}

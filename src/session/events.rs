//! Session client state and events

use serde::Serialize;

use super::peer::Peer;
use crate::time::TimeTag;

/// Connection state of a [`Client`](super::Client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Logged in, not a member of any group
    Connected,
    /// Logged in with a group join still waiting for its reply
    GroupJoining,
    /// Logged in and member of at least one group
    GroupJoined,
}

impl ClientState {
    /// True once the login has succeeded, whatever the group membership
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::GroupJoining | Self::GroupJoined)
    }
}

/// Message from a peer, relayed by the server or sent directly over UDP
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingMessage {
    pub group: String,
    pub user: String,
    pub user_id: u32,
    pub time_tag: TimeTag,
    pub payload: Vec<u8>,
    /// Came through the server rather than as a datagram
    pub reliable: bool,
    /// Seconds past its delivery time
    pub delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    Connected { user_id: u32 },
    /// `error` is set when the connection was lost rather than closed
    Disconnected { error: Option<String> },
    GroupJoin { group: String },
    GroupLeave { group: String },
    PeerJoin(Peer),
    PeerLeave(Peer),
    /// Only queued while no message handler is installed
    Message(IncomingMessage),
}

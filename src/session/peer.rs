//! Peers known to a session client

use std::net::SocketAddr;

use serde::Serialize;

/// Another client sharing a group with us
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Peer {
    pub group: String,
    pub user: String,
    pub user_id: u32,
    /// UDP address of the peer's node
    pub address: SocketAddr,
}

impl Peer {
    /// `user@group`, used as the endpoint label in logs
    pub fn label(&self) -> String {
        format!("{}@{}", self.user, self.group)
    }
}

/// Client-side cache of the peers in every joined group.
///
/// One user appears once per shared group.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already known
    pub fn add(&mut self, peer: Peer) -> bool {
        if self.find(&peer.group, peer.user_id).is_some() {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove(&mut self, group: &str, user_id: u32) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.group == group && p.user_id == user_id)?;
        Some(self.peers.remove(index))
    }

    /// Drop every peer of `group`
    pub fn remove_group(&mut self, group: &str) -> Vec<Peer> {
        let (removed, kept) = std::mem::take(&mut self.peers).into_iter().partition(|p| p.group == group);
        self.peers = kept;
        removed
    }

    pub fn find(&self, group: &str, user_id: u32) -> Option<&Peer> {
        self.peers.iter().find(|p| p.group == group && p.user_id == user_id)
    }

    pub fn find_by_name(&self, group: &str, user: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.group == group && p.user == user)
    }

    pub fn find_by_address(&self, address: &SocketAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.address == address)
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Peer> + 'a {
        self.peers.iter().filter(move |p| p.group == group)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn to_vec(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers)
    }
}

//! Remote endpoint identities and the address cache

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// A remote stream object: its transport address plus its local id.
///
/// Several sources or sinks can live behind one socket, so the address
/// alone does not identify one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub id: i32,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, id: i32) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.addr, self.id)
    }
}

/// What the node knows about one remote address
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub packets: u64,
    /// `user@group` once the session layer learned who is behind the address
    pub label: Option<String>,
}

/// Address cache shared by everything attached to one node
#[derive(Debug, Default)]
pub struct EndpointResolver {
    addresses: DashMap<SocketAddr, AddressInfo>,
    hosts: DashMap<(String, u16), SocketAddr>,
}

impl EndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a datagram from `addr`, creating the entry on first contact.
    /// Returns true for a previously unknown address.
    pub fn touch(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let mut created = false;
        self.addresses
            .entry(addr)
            .and_modify(|info| {
                info.last_seen = now;
                info.packets += 1;
            })
            .or_insert_with(|| {
                created = true;
                AddressInfo { first_seen: now, last_seen: now, packets: 1, label: None }
            });
        created
    }

    pub fn info(&self, addr: &SocketAddr) -> Option<AddressInfo> {
        self.addresses.get(addr).map(|info| info.clone())
    }

    /// Attach a human readable name to an address
    pub fn set_label(&self, addr: SocketAddr, label: impl Into<String>) {
        let label = label.into();
        let now = Instant::now();
        self.addresses
            .entry(addr)
            .and_modify(|info| info.label = Some(label.clone()))
            .or_insert_with(|| AddressInfo { first_seen: now, last_seen: now, packets: 0, label: Some(label.clone()) });
    }

    pub fn clear_label(&self, addr: &SocketAddr) {
        if let Some(mut info) = self.addresses.get_mut(addr) {
            info.label = None;
        }
    }

    pub fn label(&self, addr: &SocketAddr) -> Option<String> {
        self.addresses.get(addr).and_then(|info| info.label.clone())
    }

    /// Label if known, otherwise the address itself
    pub fn describe(&self, addr: &SocketAddr) -> String {
        match self.label(addr) {
            Some(label) => format!("{} ({})", label, addr),
            None => addr.to_string(),
        }
    }

    /// Resolve a host name, caching the first address found
    pub fn lookup(&self, host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
        let key = (host.to_string(), port);
        if let Some(addr) = self.hosts.get(&key) {
            return Ok(*addr);
        }
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| NetworkError::Resolve(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| NetworkError::Resolve(host.to_string()))?;
        self.hosts.insert(key, addr);
        Ok(addr)
    }

    /// Forget addresses silent for longer than `max_age`
    pub fn prune(&self, max_age: std::time::Duration) -> usize {
        let before = self.addresses.len();
        self.addresses
            .retain(|_, info| info.label.is_some() || info.last_seen.elapsed() <= max_age);
        before - self.addresses.len()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_identity_includes_id() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_ne!(Endpoint::new(addr, 1), Endpoint::new(addr, 2));
        assert_eq!(Endpoint::new(addr, 1).to_string(), "127.0.0.1:9000|1");
    }

    #[test]
    fn test_touch_and_label() {
        let resolver = EndpointResolver::new();
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert!(resolver.touch(addr));
        assert!(!resolver.touch(addr));
        assert_eq!(resolver.info(&addr).unwrap().packets, 2);

        assert_eq!(resolver.describe(&addr), "10.0.0.2:5000");
        resolver.set_label(addr, "alice@demo");
        assert_eq!(resolver.describe(&addr), "alice@demo (10.0.0.2:5000)");
        resolver.clear_label(&addr);
        assert!(resolver.label(&addr).is_none());
    }

    #[test]
    fn test_lookup_is_cached() {
        let resolver = EndpointResolver::new();
        let addr = resolver.lookup("127.0.0.1", 4000).unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(resolver.hosts.len(), 1);
    }
}

//! Session layer: rendezvous [`Server`] and [`Client`]
//!
//! Clients log in to a server over TCP, join groups and receive the UDP
//! address of every other member. Audio streams then run directly between
//! the peers' nodes. The server also relays reliable messages; unreliable
//! ones go peer to peer over the client's node.

pub mod client;
pub mod events;
pub mod peer;
pub mod reply;
pub mod scheduler;
pub mod server;

pub use client::Client;
pub use events::{ClientState, IncomingMessage, SessionEvent};
pub use peer::{Peer, PeerTable};
pub use reply::Reply;
pub use scheduler::Scheduler;
pub use server::{Server, ServerEvent};

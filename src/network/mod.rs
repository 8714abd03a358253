//! Network subsystem: one shared UDP socket per port

pub mod endpoint;
pub mod node;
pub mod udp;

pub use endpoint::{Endpoint, EndpointResolver};
pub use node::{Node, NodeHandle, NodeOwner, NodeRegistry, NodeStats, PacketSink};
pub use udp::create_socket;

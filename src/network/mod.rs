// Network module
//
// This module contains the peer-to-peer side of the node:
// - Wire codec for the UDP message format
// - Peer table with last-seen tracking
// - UDP transport feeding the ledger writer

pub mod message;
pub mod peer;
pub mod transport;

// Re-export main components for easier access
pub use message::{CodecError, Header, KeepAlive, Message, MessageType, Vote};
pub use peer::{PeerInfo, PeerTable};
pub use transport::{Dispatch, TransportError, UdpTransport};

// Sync module
//
// Peer-to-peer reconciliation of chain state:
// - Wire messages and their versioned envelope
// - Peer links and the connected peer set
// - The node that applies peer messages to the local chain
// - A TCP transport carrying one JSON message per line

pub mod message;
pub mod node;
pub mod peer;
pub mod transport;

use thiserror::Error;

pub use message::SyncMessage;
pub use node::{SyncAction, SyncNode};
pub use peer::{ChannelPeer, PeerId, PeerLink, PeerSet};

/// Errors that can occur while talking to peers
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

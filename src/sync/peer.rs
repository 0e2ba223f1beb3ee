use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{info, warn};
use tokio::sync::mpsc;

use super::message::SyncMessage;
use super::SyncError;

/// Identifies a connected peer (its remote address for TCP peers)
pub type PeerId = String;

/// A connection messages can be pushed down
#[async_trait]
pub trait PeerLink: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    async fn send(&self, message: SyncMessage) -> Result<(), SyncError>;
}

/// In-process peer backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    id: PeerId,
    sender: mpsc::UnboundedSender<SyncMessage>,
}

impl ChannelPeer {
    /// Creates a peer and the receiver its messages arrive on
    pub fn new(id: impl Into<PeerId>) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            ChannelPeer {
                id: id.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl PeerLink for ChannelPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .map_err(|_| SyncError::PeerDisconnected(self.id.clone()))
    }
}

/// The set of currently connected peers
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Arc<DashMap<PeerId, Arc<dyn PeerLink>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Arc<dyn PeerLink>) {
        info!("Peer {} connected", peer.id());
        self.peers.insert(peer.id().to_string(), peer);
    }

    pub fn remove(&self, id: &str) {
        if self.peers.remove(id).is_some() {
            info!("Peer {} disconnected", id);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn send_to(&self, id: &str, message: SyncMessage) -> Result<(), SyncError> {
        let peer = self
            .peers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))?;

        let result = peer.send(message).await;
        if result.is_err() {
            self.remove(id);
        }
        result
    }

    /// Sends a message to every peer except `except`
    ///
    /// Peers whose link has failed are dropped from the set.
    pub async fn broadcast(&self, message: SyncMessage, except: Option<&str>) {
        // Collect first so no map shard is held across an await.
        let targets: Vec<Arc<dyn PeerLink>> = self
            .peers
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != except)
            .map(|entry| entry.value().clone())
            .collect();

        let sends = targets.iter().map(|peer| {
            let message = message.clone();
            async move { (peer.id().to_string(), peer.send(message).await) }
        });

        for (id, result) in join_all(sends).await {
            if let Err(err) = result {
                warn!("Dropping peer {}: {}", id, err);
                self.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let peers = PeerSet::new();
        let (a, mut a_rx) = ChannelPeer::new("a");
        let (b, mut b_rx) = ChannelPeer::new("b");
        peers.add(Arc::new(a));
        peers.add(Arc::new(b));

        peers.broadcast(SyncMessage::QueryAll, Some("a")).await;

        assert_eq!(b_rx.recv().await, Some(SyncMessage::QueryAll));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_peer_is_dropped() {
        let peers = PeerSet::new();
        let (gone, gone_rx) = ChannelPeer::new("gone");
        peers.add(Arc::new(gone));
        drop(gone_rx);

        peers.broadcast(SyncMessage::QueryLatest, None).await;

        assert!(peers.is_empty());
        assert!(matches!(
            peers.send_to("gone", SyncMessage::QueryLatest).await,
            Err(SyncError::UnknownPeer(_))
        ));
    }
}

//! Peer reconciliation on top of the local chain.
//!
//! Incoming messages are turned into chain calls under one exclusive section,
//! and any reply or query the node owes is returned as a [`SyncAction`].
//! Gossip of accepted blocks and transactions is not produced here: it flows
//! from the event outbox through [`SyncNode::spawn_relay`], which forwards
//! every accepted event to all peers except the one it came from.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::message::SyncMessage;
use super::peer::{PeerLink, PeerSet};
use crate::blockchain::{
    Block, Blockchain, BlockchainError, ChainEvent, EventDispatcher, Origin, Transaction,
};

/// Something the node must send after handling a message
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Answer the peer the message came from
    Reply(SyncMessage),
    /// Send to every connected peer
    Broadcast(SyncMessage),
}

/// A ledger node that exchanges chain state with its peers
#[derive(Debug, Clone)]
pub struct SyncNode {
    dispatcher: EventDispatcher,
    peers: PeerSet,
    exclusive: Arc<Mutex<()>>,
}

impl SyncNode {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        SyncNode {
            dispatcher,
            peers: PeerSet::new(),
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    pub fn chain(&self) -> &Blockchain {
        self.dispatcher.chain()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Registers a peer and asks for its tip
    pub async fn connect_peer(&self, peer: Arc<dyn PeerLink>) {
        let id = peer.id().to_string();
        self.peers.add(peer);
        if let Err(err) = self.peers.send_to(&id, SyncMessage::QueryLatest).await {
            warn!("Failed to query new peer {}: {}", id, err);
        }
    }

    pub fn disconnect_peer(&self, id: &str) {
        self.peers.remove(id);
    }

    /// Admits a locally produced transaction; gossip follows via the relay
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), BlockchainError> {
        let _guard = self.exclusive.lock().await;
        let event = self.chain().submit_transaction(tx)?;
        self.publish(Origin::Local, event);
        Ok(())
    }

    /// Handles a message and sends whatever it calls for
    pub async fn process(&self, from: &str, message: SyncMessage) {
        for action in self.handle_message(from, message).await {
            match action {
                SyncAction::Reply(reply) => {
                    if let Err(err) = self.peers.send_to(from, reply).await {
                        warn!("Failed to reply to {}: {}", from, err);
                    }
                }
                SyncAction::Broadcast(message) => self.peers.broadcast(message, None).await,
            }
        }
    }

    /// Applies a message from `from` to the local chain
    pub async fn handle_message(&self, from: &str, message: SyncMessage) -> Vec<SyncAction> {
        debug!("Received {} from {}", message.kind(), from);
        let _guard = self.exclusive.lock().await;

        match message {
            SyncMessage::QueryLatest => vec![SyncAction::Reply(SyncMessage::ChainResponse {
                blocks: vec![self.chain().latest_block()],
            })],
            SyncMessage::QueryAll => vec![SyncAction::Reply(SyncMessage::ChainResponse {
                blocks: self.chain().get_chain(),
            })],
            SyncMessage::ChainResponse { blocks } => self.handle_chain_response(from, blocks),
            SyncMessage::NewBlock { block } => self.handle_new_block(from, block),
            SyncMessage::NewTransaction { tx } => {
                self.handle_new_transaction(from, tx);
                Vec::new()
            }
        }
    }

    fn handle_new_block(&self, from: &str, block: Block) -> Vec<SyncAction> {
        let tip = self.chain().latest_block();

        if block.index <= tip.index {
            debug!("Ignoring block {} from {}: not ahead of tip", block.index, from);
            return Vec::new();
        }

        if block.index == tip.index + 1 && block.previous_hash == tip.hash {
            match self.chain().append(block) {
                Ok(event) => self.publish(Origin::Peer(from.to_string()), event),
                Err(err) => warn!("Rejected block from {}: {}", from, err),
            }
            return Vec::new();
        }

        info!(
            "Block {} from {} does not extend tip {}, querying full chains",
            block.index, from, tip.index
        );
        vec![SyncAction::Broadcast(SyncMessage::QueryAll)]
    }

    fn handle_chain_response(&self, from: &str, mut blocks: Vec<Block>) -> Vec<SyncAction> {
        blocks.sort_by_key(|block| block.index);

        let (first, received_tip) = match (blocks.first(), blocks.last()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => return Vec::new(),
        };
        let tip = self.chain().latest_block();

        if received_tip.index <= tip.index {
            debug!(
                "Ignoring chain from {}: tip {} is not ahead of {}",
                from, received_tip.index, tip.index
            );
            return Vec::new();
        }

        if first.previous_hash == tip.hash {
            for block in blocks {
                let index = block.index;
                match self.chain().append(block) {
                    Ok(event) => self.publish(Origin::Peer(from.to_string()), event),
                    Err(err) => {
                        warn!("Rejected block {} from {}: {}", index, from, err);
                        break;
                    }
                }
            }
            return Vec::new();
        }

        if blocks.len() == 1 {
            info!(
                "Peer {} is at block {}, local tip is {}; querying full chains",
                from, received_tip.index, tip.index
            );
            return vec![SyncAction::Broadcast(SyncMessage::QueryAll)];
        }

        match self.chain().replace_chain(blocks) {
            Ok(event) => self.publish(Origin::Peer(from.to_string()), event),
            Err(err) => info!("Kept local chain over chain from {}: {}", from, err),
        }
        Vec::new()
    }

    fn handle_new_transaction(&self, from: &str, tx: Transaction) {
        // Already known transactions end the gossip here.
        if self.chain().has_transaction(&tx.id) {
            debug!("Ignoring known transaction {} from {}", tx.id, from);
            return;
        }

        match self.chain().submit_transaction(tx) {
            Ok(event) => self.publish(Origin::Peer(from.to_string()), event),
            Err(err) => debug!("Rejected transaction from {}: {}", from, err),
        }
    }

    fn publish(&self, origin: Origin, event: ChainEvent) {
        if self.dispatcher.dispatch(origin, event).is_err() {
            if let Err(err) = self.dispatcher.persist() {
                warn!("Retried persistence failed again: {}", err);
            }
        }
    }

    /// Forwards accepted events to peers until the dispatcher goes away
    pub fn spawn_relay(&self) -> JoinHandle<()> {
        let mut events = self.dispatcher.subscribe();
        let peers = self.peers.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(notification) => {
                        let except = match &notification.origin {
                            Origin::Peer(id) => Some(id.as_str()),
                            Origin::Local => None,
                        };
                        if let Some(message) = gossip_for(&notification.event) {
                            peers.broadcast(message, except).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Relay fell behind, {} events not gossiped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// The message announcing an accepted event to peers
fn gossip_for(event: &ChainEvent) -> Option<SyncMessage> {
    match event {
        ChainEvent::TransactionAdmitted(tx) => Some(SyncMessage::NewTransaction { tx: tx.clone() }),
        ChainEvent::BlockAppended(block) => Some(SyncMessage::NewBlock {
            block: block.clone(),
        }),
        ChainEvent::ChainReplaced(blocks) => blocks
            .last()
            .map(|block| SyncMessage::NewBlock { block: block.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{
        validate_chain, CancelToken, ChainConfig, KeyPair, LedgerStorage, Miner, MiningPolicy,
    };
    use crate::sync::peer::ChannelPeer;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn node() -> SyncNode {
        let chain = Blockchain::with_config(ChainConfig {
            difficulty: 1,
            mining_reward: 50.0,
        });
        SyncNode::new(EventDispatcher::new(chain, Some(LedgerStorage::in_memory())))
    }

    fn solve(mut block: Block) -> Block {
        while !block.meets_difficulty() {
            block.nonce += 1;
            block.hash = block.calculate_hash();
        }
        block
    }

    fn mine_on(chain: &Blockchain, to: &KeyPair) -> Block {
        let tip = chain.latest_block();
        let block = solve(Block::new(
            tip.index + 1,
            tip.hash,
            vec![Transaction::new_reward(to.address().clone(), 50.0)],
            1,
        ));
        chain.append(block.clone()).unwrap();
        block
    }

    async fn next_message(rx: &mut UnboundedReceiver<SyncMessage>) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_queries_are_answered() {
        let node = node();
        let miner = KeyPair::generate();
        mine_on(node.chain(), &miner);

        let latest = node.handle_message("p", SyncMessage::QueryLatest).await;
        assert_eq!(
            latest,
            vec![SyncAction::Reply(SyncMessage::ChainResponse {
                blocks: vec![node.chain().latest_block()]
            })]
        );

        let all = node.handle_message("p", SyncMessage::QueryAll).await;
        assert_eq!(
            all,
            vec![SyncAction::Reply(SyncMessage::ChainResponse {
                blocks: node.chain().get_chain()
            })]
        );
    }

    #[tokio::test]
    async fn test_new_block_fast_path() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        let mut events = local.dispatcher.subscribe();

        let block = mine_on(remote.chain(), &miner);
        let actions = local
            .handle_message("remote", SyncMessage::NewBlock { block: block.clone() })
            .await;

        assert!(actions.is_empty());
        assert_eq!(local.chain().latest_block(), block);
        let notification = events.recv().await.unwrap();
        assert_eq!(notification.origin, Origin::Peer("remote".to_string()));
    }

    #[tokio::test]
    async fn test_new_block_far_ahead_queries_all() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        mine_on(remote.chain(), &miner);
        let block = mine_on(remote.chain(), &miner);

        let actions = local
            .handle_message("remote", SyncMessage::NewBlock { block })
            .await;

        assert_eq!(actions, vec![SyncAction::Broadcast(SyncMessage::QueryAll)]);
        assert_eq!(local.chain().len(), 1);
    }

    #[tokio::test]
    async fn test_old_or_invalid_blocks_are_ignored() {
        let local = node();
        let miner = KeyPair::generate();
        let block = mine_on(local.chain(), &miner);

        let actions = local
            .handle_message("remote", SyncMessage::NewBlock { block: block.clone() })
            .await;
        assert!(actions.is_empty());

        let mut forged = solve(Block::new(2, block.hash.clone(), Vec::new(), 1));
        forged.merkle_root = "00".repeat(32);
        let actions = local
            .handle_message("remote", SyncMessage::NewBlock { block: forged })
            .await;
        assert!(actions.is_empty());
        assert_eq!(local.chain().len(), 2);
    }

    #[tokio::test]
    async fn test_chain_response_single_block_append() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        let block = mine_on(remote.chain(), &miner);

        local
            .handle_message("remote", SyncMessage::ChainResponse { blocks: vec![block] })
            .await;

        assert_eq!(local.chain().get_chain(), remote.chain().get_chain());
    }

    #[tokio::test]
    async fn test_chain_response_lone_far_block_queries_all() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        mine_on(remote.chain(), &miner);
        let tip = mine_on(remote.chain(), &miner);

        let actions = local
            .handle_message("remote", SyncMessage::ChainResponse { blocks: vec![tip] })
            .await;

        assert_eq!(actions, vec![SyncAction::Broadcast(SyncMessage::QueryAll)]);
    }

    #[tokio::test]
    async fn test_chain_response_replaces_with_longer_fork() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        mine_on(local.chain(), &miner);
        for _ in 0..3 {
            mine_on(remote.chain(), &miner);
        }

        // Out of order on purpose: responses are sorted before use.
        let mut blocks = remote.chain().get_chain();
        blocks.reverse();
        local
            .handle_message("remote", SyncMessage::ChainResponse { blocks })
            .await;

        assert_eq!(local.chain().get_chain(), remote.chain().get_chain());
    }

    #[tokio::test]
    async fn test_chain_response_not_longer_is_ignored() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        mine_on(local.chain(), &miner);
        mine_on(local.chain(), &miner);
        mine_on(remote.chain(), &miner);
        let before = local.chain().get_chain();

        let actions = local
            .handle_message(
                "remote",
                SyncMessage::ChainResponse {
                    blocks: remote.chain().get_chain(),
                },
            )
            .await;

        assert!(actions.is_empty());
        assert_eq!(local.chain().get_chain(), before);
    }

    #[tokio::test]
    async fn test_new_transaction_is_deduplicated() {
        let local = node();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        mine_on(local.chain(), &alice);
        let mut events = local.dispatcher.subscribe();

        let mut tx = Transaction::new_transfer(alice.address().clone(), bob.address().clone(), 5.0);
        tx.sign(alice.private_key()).unwrap();

        local
            .handle_message("a", SyncMessage::NewTransaction { tx: tx.clone() })
            .await;
        local
            .handle_message("b", SyncMessage::NewTransaction { tx: tx.clone() })
            .await;

        assert_eq!(local.chain().get_pending_transactions(), vec![tx]);
        assert_eq!(events.recv().await.unwrap().origin, Origin::Peer("a".to_string()));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_gossips_to_everyone_but_origin() {
        let local = node();
        let remote = node();
        let miner = KeyPair::generate();
        let _relay = local.spawn_relay();

        let (a, mut a_rx) = ChannelPeer::new("a");
        let (b, mut b_rx) = ChannelPeer::new("b");
        local.connect_peer(Arc::new(a)).await;
        local.connect_peer(Arc::new(b)).await;
        assert_eq!(next_message(&mut a_rx).await, SyncMessage::QueryLatest);
        assert_eq!(next_message(&mut b_rx).await, SyncMessage::QueryLatest);

        let block = mine_on(remote.chain(), &miner);
        local
            .process("a", SyncMessage::NewBlock { block: block.clone() })
            .await;

        assert_eq!(next_message(&mut b_rx).await, SyncMessage::NewBlock { block });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_submission_is_gossiped() {
        let local = node();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        mine_on(local.chain(), &alice);
        let _relay = local.spawn_relay();

        let (peer, mut rx) = ChannelPeer::new("peer");
        local.connect_peer(Arc::new(peer)).await;
        assert_eq!(next_message(&mut rx).await, SyncMessage::QueryLatest);

        let mut tx = Transaction::new_transfer(alice.address().clone(), bob.address().clone(), 1.0);
        tx.sign(alice.private_key()).unwrap();
        local.submit_transaction(tx.clone()).await.unwrap();

        assert_eq!(next_message(&mut rx).await, SyncMessage::NewTransaction { tx });
    }

    #[tokio::test]
    async fn test_lagging_node_catches_up_in_two_round_trips() {
        let a = node();
        let b = node();
        let miner = KeyPair::generate();
        for _ in 0..2 {
            mine_on(a.chain(), &miner);
        }

        // Drive the exchange by hand: b asks, a answers, b asks for all.
        let reply = a.handle_message("b", SyncMessage::QueryLatest).await;
        let SyncAction::Reply(response) = reply[0].clone() else {
            panic!("expected reply");
        };
        let follow_up = b.handle_message("a", response).await;
        assert_eq!(follow_up, vec![SyncAction::Broadcast(SyncMessage::QueryAll)]);

        let reply = a.handle_message("b", SyncMessage::QueryAll).await;
        let SyncAction::Reply(full) = reply[0].clone() else {
            panic!("expected reply");
        };
        b.handle_message("a", full).await;

        assert_eq!(b.chain().get_chain(), a.chain().get_chain());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_miner_and_sync_interleave_safely() {
        let storage = LedgerStorage::in_memory();
        let chain = Blockchain::with_config(ChainConfig {
            difficulty: 2,
            mining_reward: 50.0,
        });
        let dispatcher = EventDispatcher::new(chain.clone(), Some(storage.clone()));
        let local = SyncNode::new(dispatcher.clone());
        let miner = Miner::new(
            KeyPair::generate().address().clone(),
            dispatcher,
            MiningPolicy::default(),
            10_000,
        )
        .spawn();

        let stop = CancelToken::new();
        let reader = {
            let chain = chain.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut checks = 0u32;
                while !stop.is_cancelled() {
                    let snapshot = chain.snapshot();
                    assert!(validate_chain(&snapshot.blocks));
                    checks += 1;
                    tokio::task::yield_now().await;
                }
                checks
            })
        };

        let remote = node();
        let remote_miner = KeyPair::generate();
        let mut replies = Vec::new();
        for _ in 0..10 {
            while remote.chain().len() <= chain.len() + 1 {
                mine_on(remote.chain(), &remote_miner);
            }
            let tip = remote.chain().latest_block();
            let blocks = remote.chain().get_chain();
            let (a, b) = (local.clone(), local.clone());
            replies.push(tokio::spawn(async move {
                a.handle_message("remote", SyncMessage::NewBlock { block: tip }).await
            }));
            replies.push(tokio::spawn(async move {
                b.handle_message("remote", SyncMessage::ChainResponse { blocks }).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for reply in replies {
            reply.await.unwrap();
        }

        miner.stop().await;
        stop.cancel();
        assert!(reader.await.unwrap() > 0);

        assert!(chain.is_valid());
        assert!(chain.len() > 10);
        let restored = storage.load_chain(ChainConfig::default()).unwrap();
        assert!(restored.is_valid());
        assert_eq!(restored.get_chain(), chain.get_chain());
    }
}

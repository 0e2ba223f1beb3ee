use serde::{Deserialize, Serialize};

use super::SyncError;
use crate::blockchain::{Block, Transaction};

/// Version carried by every wire envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncMessage {
    /// Ask for the peer's tip
    QueryLatest,
    /// Ask for the peer's whole chain
    QueryAll,
    /// Answer to either query
    ChainResponse { blocks: Vec<Block> },
    /// Gossip of a freshly accepted block
    NewBlock { block: Block },
    /// Gossip of a freshly admitted transaction
    NewTransaction { tx: Transaction },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::QueryLatest => "QueryLatest",
            SyncMessage::QueryAll => "QueryAll",
            SyncMessage::ChainResponse { .. } => "ChainResponse",
            SyncMessage::NewBlock { .. } => "NewBlock",
            SyncMessage::NewTransaction { .. } => "NewTransaction",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    message: SyncMessage,
}

/// Encodes a message as a single line of JSON (without the newline)
pub fn encode(message: &SyncMessage) -> Result<String, SyncError> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        message: message.clone(),
    };
    serde_json::to_string(&envelope).map_err(|e| SyncError::Encode(e.to_string()))
}

/// Decodes one line of JSON produced by [`encode`]
pub fn decode(line: &str) -> Result<SyncMessage, SyncError> {
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| SyncError::Decode(e.to_string()))?;

    if envelope.version != PROTOCOL_VERSION {
        return Err(SyncError::UnsupportedVersion(envelope.version));
    }

    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Address, KeyPair};

    #[test]
    fn test_encode_shape() {
        let line = encode(&SyncMessage::QueryLatest).unwrap();
        assert_eq!(line, r#"{"version":1,"message":{"type":"QueryLatest"}}"#);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_block_message_round_trip() {
        let miner = KeyPair::generate();
        let block = Block::new(
            1,
            Block::genesis().hash,
            vec![Transaction::new_reward(miner.address().clone(), 50.0)],
            1,
        );
        let message = SyncMessage::NewBlock { block };

        assert_eq!(decode(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn test_transaction_message_keeps_signature() {
        let alice = KeyPair::generate();
        let mut tx = Transaction::new_transfer(
            alice.address().clone(),
            Address("recipient".to_string()),
            3.0,
        );
        tx.sign(alice.private_key()).unwrap();
        let message = SyncMessage::NewTransaction { tx: tx.clone() };

        match decode(&encode(&message).unwrap()).unwrap() {
            SyncMessage::NewTransaction { tx: decoded } => {
                assert_eq!(decoded.signature, tx.signature);
                assert!(decoded.verify_signature().unwrap());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(decode("not json"), Err(SyncError::Decode(_))));
        assert!(matches!(
            decode(r#"{"version":7,"message":{"type":"QueryAll"}}"#),
            Err(SyncError::UnsupportedVersion(7))
        ));
    }
}

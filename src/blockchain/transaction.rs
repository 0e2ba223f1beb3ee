use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::crypto::{self, Address, CryptoError, Digest, DigitalSignature};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Missing recipient address")]
    MissingRecipient,

    #[error("Missing sender address")]
    MissingSender,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Malformed reward transaction: {0}")]
    MalformedReward(String),

    #[error("Duplicate transaction: {0}")]
    Duplicate(String),

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Kind of value movement a transaction represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Signed transfer between two addresses
    Transfer,
    /// Unsigned mining reward minted by the block producer
    Reward,
}

/// Represents a transaction in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Version of the transaction structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Unique identifier for the transaction
    pub id: String,

    /// Sender's address, absent for rewards
    pub from: Option<Address>,

    /// Recipient's address
    pub to: Address,

    /// Amount being transferred
    pub amount: f64,

    /// Timestamp when the transaction was created
    pub timestamp: DateTime<Utc>,

    pub kind: TransactionKind,

    /// Signature over [`Transaction::hash`], present only on transfers
    pub signature: Option<DigitalSignature>,
}

/// Current transaction schema version
pub const TRANSACTION_VERSION: u32 = 1;

fn default_version() -> u32 {
    TRANSACTION_VERSION
}

impl Transaction {
    /// Creates a new unsigned transfer
    ///
    /// # Arguments
    ///
    /// * `from` - The address of the sender
    /// * `to` - The address of the recipient
    /// * `amount` - The amount to transfer
    pub fn new_transfer(from: Address, to: Address, amount: f64) -> Self {
        Transaction {
            version: default_version(),
            id: Uuid::new_v4().to_string(),
            from: Some(from),
            to,
            amount,
            timestamp: Utc::now(),
            kind: TransactionKind::Transfer,
            signature: None,
        }
    }

    /// Creates a new mining reward
    ///
    /// # Arguments
    ///
    /// * `to` - The address of the miner
    /// * `amount` - The reward amount
    pub fn new_reward(to: Address, amount: f64) -> Self {
        Transaction {
            version: default_version(),
            id: Uuid::new_v4().to_string(),
            from: None,
            to,
            amount,
            timestamp: Utc::now(),
            kind: TransactionKind::Reward,
            signature: None,
        }
    }

    pub fn is_reward(&self) -> bool {
        self.kind == TransactionKind::Reward
    }

    /// Hash over every field except the signature.
    ///
    /// This is the message a transfer's signature commits to.
    pub fn hash(&self) -> Digest {
        let data = serde_json::json!({
            "version": self.version,
            "id": self.id,
            "from": self.from.as_ref().map(|a| a.0.as_str()),
            "to": self.to.0,
            "amount": self.amount,
            "timestamp": self.timestamp,
            "kind": self.kind,
        });

        crypto::hash(data.to_string().as_bytes())
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Signs the transaction with the sender's private key
    ///
    /// Rewards carry no signature, so signing one is a no-op.
    pub fn sign(&mut self, private_key: &SigningKey) -> Result<(), TransactionError> {
        if self.is_reward() {
            return Ok(());
        }

        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        let from = self.from.as_ref().ok_or(TransactionError::MissingSender)?;
        let signer = crypto::derive_address(&private_key.verifying_key());
        if &signer != from {
            return Err(TransactionError::InvalidSenderAddress(
                "Signing key does not match sender address".to_string(),
            ));
        }

        self.signature = Some(crypto::sign(&self.hash(), private_key));
        Ok(())
    }

    /// Verifies the signature against an explicit public key
    pub fn verify(&self, public_key: &VerifyingKey) -> Result<bool, TransactionError> {
        if self.is_reward() {
            return Ok(true);
        }

        if self.from.is_none() {
            return Err(TransactionError::MissingSender);
        }
        let signature = self
            .signature
            .as_ref()
            .ok_or(TransactionError::MissingSignature)?;

        Ok(crypto::verify(&self.hash(), signature, public_key)?)
    }

    /// Verifies the signature against the key encoded in the sender address
    pub fn verify_signature(&self) -> Result<bool, TransactionError> {
        match (&self.kind, &self.from) {
            (TransactionKind::Reward, _) => Ok(true),
            (TransactionKind::Transfer, None) => Err(TransactionError::MissingSender),
            (TransactionKind::Transfer, Some(from)) => {
                let public_key = from
                    .to_public_key()
                    .map_err(|e| TransactionError::InvalidSenderAddress(e.to_string()))?;
                self.verify(&public_key)
            }
        }
    }

    /// Checks field-level invariants without touching any ledger state
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.to.is_empty() {
            return Err(TransactionError::MissingRecipient);
        }

        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(TransactionError::InvalidAmount(format!(
                "Amount must be positive: {}",
                self.amount
            )));
        }

        match self.kind {
            TransactionKind::Transfer => {
                match &self.from {
                    Some(from) if !from.is_empty() => {}
                    _ => return Err(TransactionError::MissingSender),
                }
                if self.signature.is_none() {
                    return Err(TransactionError::MissingSignature);
                }
            }
            TransactionKind::Reward => {
                if self.from.is_some() {
                    return Err(TransactionError::MalformedReward(
                        "reward must not have a sender".to_string(),
                    ));
                }
                if self.signature.is_some() {
                    return Err(TransactionError::MalformedReward(
                        "reward must not be signed".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Full admission check: field invariants plus a valid signature
    pub fn check(&self) -> Result<(), TransactionError> {
        self.validate()?;
        if !self.verify_signature()? {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }
}

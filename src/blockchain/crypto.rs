use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// A SHA-256 digest
pub type Digest = [u8; 32];

/// Hex encoding of an all-zero digest
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hashes arbitrary bytes with SHA-256
pub fn hash(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

/// Hashes arbitrary bytes and returns the lowercase hex encoding
pub fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(hash(bytes))
}

/// Signs a digest with the given private key
pub fn sign(digest: &Digest, private_key: &SigningKey) -> DigitalSignature {
    DigitalSignature::from_signature(&private_key.sign(digest))
}

/// Verifies a signature over a digest
///
/// A malformed signature is an error; a well-formed signature that does
/// not match is `Ok(false)`.
pub fn verify(
    digest: &Digest,
    signature: &DigitalSignature,
    public_key: &VerifyingKey,
) -> Result<bool, CryptoError> {
    let signature = signature.to_signature()?;
    Ok(public_key.verify(digest, &signature).is_ok())
}

/// Derives the ledger address owned by a public key
pub fn derive_address(public_key: &VerifyingKey) -> Address {
    Address(bs58::encode(public_key.as_bytes()).into_string())
}

/// Represents a ledger address (public key in base58 format)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Converts the address back to the public key it encodes
    pub fn to_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey("Invalid public key length".to_string())
        })?;

        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        bs58::decode(s)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        Ok(Address(s.to_string()))
    }
}

/// Represents a detached signature (base58 encoded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }

    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature("Invalid signature length".to_string())
        })?;

        Ok(Signature::from_bytes(&signature_bytes))
    }
}

/// A signing key together with its public half and address.
///
/// The ledger never persists key material; this type exists for callers
/// that produce signed transactions.
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl KeyPair {
    /// Generates a fresh random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Rebuilds a key pair from a 32-byte secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = derive_address(&verifying_key);

        KeyPair {
            signing_key,
            verifying_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn private_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash(b"ledger"), hash(b"ledger"));
        assert_ne!(hash(b"ledger"), hash(b"ledgers"));
        assert_eq!(hash_hex(b"").len(), 64);
    }

    #[test]
    fn test_signing_and_verification() {
        let keys = KeyPair::generate();
        let digest = hash(b"Hello, world!");

        let signature = sign(&digest, keys.private_key());
        assert!(verify(&digest, &signature, keys.public_key()).unwrap());

        let other = hash(b"Wrong message");
        assert!(!verify(&other, &signature, keys.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_an_error() {
        let keys = KeyPair::generate();
        let digest = hash(b"payload");
        let garbage = DigitalSignature("abc".to_string());

        assert!(verify(&digest, &garbage, keys.public_key()).is_err());
    }

    #[test]
    fn test_address_round_trips_to_public_key() {
        let keys = KeyPair::generate();
        let public_key = keys.address().to_public_key().unwrap();

        assert_eq!(public_key.as_bytes(), keys.public_key().as_bytes());
        assert_eq!(derive_address(&public_key), *keys.address());
    }

    #[test]
    fn test_key_pair_from_secret_key() {
        let keys = KeyPair::generate();
        let restored = KeyPair::from_secret_key(&keys.private_key().to_bytes()).unwrap();

        assert_eq!(restored.address(), keys.address());
        assert!(KeyPair::from_secret_key(&[1, 2, 3]).is_err());
    }
}

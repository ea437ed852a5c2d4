//! Peer Identity Management
//!
//! Every peer is known by its long-term Ed25519 verifying key:
//! - `PeerIdentity` is the public half, used on the wire and as map key
//! - `Identity` holds the signing key and signs ephemeral key announcements

use std::cmp::Ordering;

use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::constants::{PEER_IDENTITY_SIZE, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A peer's public identity (Ed25519 verifying key bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    bytes: [u8; PEER_IDENTITY_SIZE],
}

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// The local peer's long-term identity
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerIdentity,
}

impl PeerIdentity {
    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; PEER_IDENTITY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; PEER_IDENTITY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PEER_IDENTITY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; PEER_IDENTITY_SIZE] {
        &self.bytes
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::SerializationError(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }

    /// Verify a signature made by this peer
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = Ed25519Sig::from_bytes(&signature.bytes);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl PartialOrd for PeerIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.bytes[..4]))
    }
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore an identity from its secret key bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerIdentity::from_bytes(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }

    /// Public identity of this peer
    pub fn peer_id(&self) -> PeerIdentity {
        self.peer_id
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }

    /// Export the secret key for secure storage
    pub fn export_secret(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.export_secret())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({:?})", self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate();
        let peer = identity.peer_id();

        let message = b"ephemeral key announcement";
        let signature = identity.sign(message);

        assert!(peer.verify(message, &signature).is_ok());
        assert!(peer.verify(b"something else", &signature).is_err());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let alice = Identity::generate();
        let mallory = Identity::generate();

        let signature = mallory.sign(b"hello");
        assert!(alice.peer_id().verify(b"hello", &signature).is_err());
    }

    #[test]
    fn test_export_import() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_bytes(identity.export_secret());

        assert_eq!(identity.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_peer_identity_hex() {
        let peer = Identity::generate().peer_id();
        let parsed = PeerIdentity::from_hex(&peer.to_hex()).unwrap();
        assert_eq!(peer, parsed);

        assert!(PeerIdentity::from_hex("abcd").is_err());
        assert!(PeerIdentity::from_hex("zz").is_err());
    }

    #[test]
    fn test_peer_identity_ordering() {
        let low = PeerIdentity::from_bytes([0x00; PEER_IDENTITY_SIZE]);
        let mut high_bytes = [0x00; PEER_IDENTITY_SIZE];
        high_bytes[0] = 0x01;
        let high = PeerIdentity::from_bytes(high_bytes);

        assert!(low < high);
        assert_eq!(format!("{:?}", low), "00000000");
    }
}

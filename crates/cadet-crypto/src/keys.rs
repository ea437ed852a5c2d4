//! X25519 Ephemeral Key Agreement
//!
//! One ephemeral key pair is shared by all tunnels of a peer during a rekey
//! period, so the secret is a `StaticSecret` that can be used many times.
//! Session keys are derived with HKDF-SHA256, salted with the kx salt and
//! bound to the (sender, receiver) pair so both directions get distinct keys.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KX_SALT, SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::PeerIdentity;
use crate::symmetric::SessionKey;

/// A X25519 ephemeral public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EphemeralPublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// Ephemeral keypair, reused across tunnels until the next rekey
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: EphemeralPublicKey,
}

/// Shared secret derived from X25519 key exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl EphemeralPublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; X25519_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }

    /// True for the all-zero placeholder key
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for EphemeralPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralPublicKey({})", hex::encode(&self.bytes[..4]))
    }
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = EphemeralPublicKey {
            bytes: X25519Public::from(&secret).to_bytes(),
        };
        Self { secret, public }
    }

    /// Public half
    pub fn public(&self) -> EphemeralPublicKey {
        self.public
    }

    /// Diffie-Hellman with a peer's ephemeral key
    pub fn diffie_hellman(&self, their_public: &EphemeralPublicKey) -> SharedSecret {
        let their_public = X25519Public::from(their_public.bytes);
        let shared = self.secret.diffie_hellman(&their_public);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }
}

impl Clone for EphemeralKeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: StaticSecret::from(self.secret.to_bytes()),
            public: self.public,
        }
    }
}

impl SharedSecret {
    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }

    /// Derive the session key for traffic from `sender` to `receiver`.
    ///
    /// Both ends compute the same key for a given direction; swapping the
    /// identities yields the key for the opposite direction.
    pub fn derive_session_key(
        &self,
        sender: &PeerIdentity,
        receiver: &PeerIdentity,
    ) -> CryptoResult<SessionKey> {
        let hkdf = Hkdf::<Sha256>::new(Some(KX_SALT), &self.bytes);

        let mut info = Vec::with_capacity(64);
        info.extend_from_slice(sender.as_bytes());
        info.extend_from_slice(receiver.as_bytes());

        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        hkdf.expand(&info, &mut key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        let session = SessionKey::from_bytes(key);
        key.zeroize();
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_key_exchange() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();

        let alice_shared = alice.diffie_hellman(&bob.public());
        let bob_shared = bob.diffie_hellman(&alice.public());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_directional_keys() {
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();

        let shared_a = alice.diffie_hellman(&bob.public());
        let shared_b = bob.diffie_hellman(&alice.public());

        let a_send = shared_a.derive_session_key(&a, &b).unwrap();
        let a_recv = shared_a.derive_session_key(&b, &a).unwrap();
        let b_send = shared_b.derive_session_key(&b, &a).unwrap();
        let b_recv = shared_b.derive_session_key(&a, &b).unwrap();

        assert_eq!(a_send.as_bytes(), b_recv.as_bytes());
        assert_eq!(b_send.as_bytes(), a_recv.as_bytes());
        assert_ne!(a_send.as_bytes(), a_recv.as_bytes());
    }

    #[test]
    fn test_cloned_pair_agrees() {
        let pair = EphemeralKeyPair::generate();
        let other = EphemeralKeyPair::generate();
        let copy = pair.clone();

        assert_eq!(pair.public(), copy.public());
        assert_eq!(
            pair.diffie_hellman(&other.public()).as_bytes(),
            copy.diffie_hellman(&other.public()).as_bytes()
        );
    }

    #[test]
    fn test_zero_key() {
        assert!(EphemeralPublicKey::default().is_zero());
        assert!(!EphemeralKeyPair::generate().public().is_zero());
    }
}

//! CADET Cryptographic Primitives
//!
//! This crate provides the cryptographic operations of the CADET overlay:
//! - Peer identity and signatures (Ed25519)
//! - Ephemeral key agreement (X25519)
//! - Session key derivation (HKDF-SHA256)
//! - Symmetric encryption (ChaCha20-Poly1305)
//! - Authentication codes (HMAC-SHA256)

pub mod error;
pub mod identity;
pub mod keys;
pub mod symmetric;

pub use error::{CryptoError, CryptoResult};
pub use identity::{Identity, PeerIdentity, Signature};
pub use keys::{EphemeralKeyPair, EphemeralPublicKey, SharedSecret};
pub use symmetric::{authenticate, decrypt, encrypt, verify_authentication, AuthCode, Nonce, SessionKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::identity::*;
    pub use crate::keys::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Session key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// HMAC-SHA256 output size
    pub const HMAC_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Peer identity size (Ed25519 public key)
    pub const PEER_IDENTITY_SIZE: usize = 32;

    /// Salt of the session key derivation
    pub const KX_SALT: &[u8] = b"CADET kx salt";

    /// Context of the authentication key derivation
    pub const AUTH_KEY_CONTEXT: &[u8] = b"cadet authentication key";

    /// Context of the nonce derivation
    pub const IV_CONTEXT: &[u8] = b"cadet iv";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_crypto_flow() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        // Both sides announce a signed ephemeral key
        let alice_eph = EphemeralKeyPair::generate();
        let bob_eph = EphemeralKeyPair::generate();
        let alice_sig = alice.sign(alice_eph.public().as_bytes());
        alice
            .peer_id()
            .verify(alice_eph.public().as_bytes(), &alice_sig)
            .expect("announcement should verify");

        // Alice -> Bob key, computed on both ends
        let a_to_b = alice_eph
            .diffie_hellman(&bob_eph.public())
            .derive_session_key(&alice.peer_id(), &bob.peer_id())
            .expect("derivation should succeed");
        let b_from_a = bob_eph
            .diffie_hellman(&alice_eph.public())
            .derive_session_key(&alice.peer_id(), &bob.peer_id())
            .expect("derivation should succeed");

        let ciphertext = encrypt(&a_to_b, 9, b"payload").expect("encryption should succeed");
        let code = authenticate(&a_to_b, 9, &ciphertext).expect("mac should succeed");

        verify_authentication(&b_from_a, 9, &ciphertext, &code).expect("mac should verify");
        let plaintext = decrypt(&b_from_a, 9, &ciphertext).expect("decryption should succeed");
        assert_eq!(plaintext, b"payload");
    }
}

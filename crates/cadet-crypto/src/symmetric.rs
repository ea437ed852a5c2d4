//! Symmetric Encryption (ChaCha20-Poly1305) and authentication codes
//!
//! Tunnel payloads are encrypted with ChaCha20-Poly1305 under a session key.
//! The 96-bit nonce is derived from the key and a 32-bit per-message iv that
//! travels in clear. An HMAC-SHA256 over the ciphertext, keyed from
//! (iv, session key), lets a receiver pick the right key generation without
//! trial decryption.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_KEY_CONTEXT, AUTH_TAG_SIZE, HMAC_SIZE, IV_CONTEXT, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

type HmacSha256 = Hmac<Sha256>;

/// A 256-bit session key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// A 96-bit nonce for ChaCha20-Poly1305
#[derive(Clone, Copy)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

/// Authentication code carried next to every ciphertext
pub type AuthCode = [u8; HMAC_SIZE];

impl SessionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

impl Nonce {
    /// Derive the nonce for `iv` under `key`
    pub fn derive(key: &SessionKey, iv: u32) -> CryptoResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(&iv.to_be_bytes()), &key.bytes);
        let mut bytes = [0u8; NONCE_SIZE];
        hkdf.expand(IV_CONTEXT, &mut bytes)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

/// Encrypt plaintext using ChaCha20-Poly1305
///
/// Returns ciphertext with the Poly1305 tag appended (16 bytes longer than input)
pub fn encrypt(key: &SessionKey, iv: u32, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce = Nonce::derive(key, iv)?;

    cipher
        .encrypt(ChaNonce::from_slice(&nonce.bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("ChaCha20-Poly1305 encryption failed".into()))
}

/// Decrypt ciphertext using ChaCha20-Poly1305
pub fn decrypt(key: &SessionKey, iv: u32, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < AUTH_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.bytes).map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = Nonce::derive(key, iv)?;

    cipher
        .decrypt(ChaNonce::from_slice(&nonce.bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn authentication_key(key: &SessionKey, iv: u32) -> CryptoResult<[u8; SYMMETRIC_KEY_SIZE]> {
    let mut ikm = Vec::with_capacity(4 + SYMMETRIC_KEY_SIZE);
    ikm.extend_from_slice(&iv.to_be_bytes());
    ikm.extend_from_slice(&key.bytes);

    let hkdf = Hkdf::<Sha256>::new(Some(AUTH_KEY_CONTEXT), &ikm);
    ikm.zeroize();

    let mut auth_key = [0u8; SYMMETRIC_KEY_SIZE];
    hkdf.expand(&[], &mut auth_key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(auth_key)
}

fn hmac_for(key: &SessionKey, iv: u32) -> CryptoResult<HmacSha256> {
    let mut auth_key = authentication_key(key, iv)?;
    let mac = <HmacSha256 as Mac>::new_from_slice(&auth_key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()));
    auth_key.zeroize();
    mac
}

/// Compute the authentication code of `data` under (`key`, `iv`)
pub fn authenticate(key: &SessionKey, iv: u32, data: &[u8]) -> CryptoResult<AuthCode> {
    let mut mac = hmac_for(key, iv)?;
    mac.update(data);
    let mut code = [0u8; HMAC_SIZE];
    code.copy_from_slice(&mac.finalize().into_bytes());
    Ok(code)
}

/// Check an authentication code in constant time
pub fn verify_authentication(
    key: &SessionKey,
    iv: u32,
    data: &[u8],
    code: &AuthCode,
) -> CryptoResult<()> {
    let mut mac = hmac_for(key, iv)?;
    mac.update(data);
    mac.verify_slice(code)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

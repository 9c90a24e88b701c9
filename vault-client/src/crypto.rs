//! Cryptographic capabilities for keyrelay.
//!
//! This module provides:
//! - [`Keys`] - an Ed25519 identity that signs events and derives X25519 for ECDH
//! - [`Signer`] and [`Cipher`] - the two capabilities the envelope codec needs
//! - [`verify`] - detached signature verification
//!
//! # Payload format
//!
//! `base64(version || nonce || ciphertext)` where:
//! - `version` is one byte ([`PAYLOAD_VERSION`])
//! - `nonce` is 24 random bytes (XChaCha20-Poly1305, safe for random generation)
//! - `ciphertext` seals `u32_be(len) || plaintext || zero padding`
//!
//! The AEAD key is a conversation key: HKDF-SHA256 over the X25519 shared
//! secret between the two parties, so it is identical in both directions.
//! Padding rounds lengths up to coarse buckets so ciphertext length leaks
//! little about content length.
//!
//! # Security Notes
//!
//! - The X25519 secret is the clamped Ed25519 scalar, the public half is the
//!   Montgomery form of the Ed25519 point
//! - Non-contributory shared secrets (low-order points) are rejected
//! - Key material is zeroized on drop

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use keyrelay_types::{PublicKey, Signature};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Version byte prefixed to every payload.
pub const PAYLOAD_VERSION: u8 = 1;

/// Largest plaintext the cipher accepts.
pub const MAX_PLAINTEXT_SIZE: usize = 1024 * 1024;

const TAG_SIZE: usize = 16;
const LENGTH_PREFIX: usize = 4;
const MIN_PADDED_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"keyrelay-conversation-v1";
const HKDF_INFO: &[u8] = b"keyrelay xchacha20poly1305 key";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Payload structure is wrong (encoding, version, length).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Public key bytes are not a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// ECDH produced a non-contributory shared secret.
    #[error("key agreement produced a low-order shared secret")]
    WeakSharedSecret,

    /// Signature did not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

/// Produces signatures under a public identity.
pub trait Signer: Send + Sync {
    /// Public half of the identity.
    fn public_key(&self) -> PublicKey;

    /// Sign a message (event ids, in practice).
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Encrypts to and decrypts from other identities.
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` so that `recipient` can decrypt it.
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<String, CryptoError>;

    /// Decrypt a payload produced by `sender`.
    fn decrypt(&self, sender: &PublicKey, payload: &str) -> Result<Vec<u8>, CryptoError>;
}

/// An identity usable by the envelope codec.
pub trait Identity: Signer + Cipher {}

impl<T: Signer + Cipher> Identity for T {}

/// Verify a detached signature.
pub fn verify(pubkey: &PublicKey, message: &[u8], sig: &Signature) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_bytes(sig.as_bytes());
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// An Ed25519 keypair.
///
/// Serves both as the long-term identity of a user and as the single-use
/// ephemeral key that signs each outer envelope.
#[derive(Clone)]
pub struct Keys {
    signing: SigningKey,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// Restore from a hex-encoded secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        hex::decode_to_slice(hex_str, &mut bytes[..]).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: hex_str.len() / 2,
            }
        })?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Hex-encoded secret, for handing to a credential store.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    fn x25519_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }

    /// Derive the shared AEAD key with `peer`.
    fn conversation_key(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let peer_x = to_x25519(peer)?;
        let shared = self.x25519_secret().diffie_hellman(&peer_x);
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(HKDF_INFO, &mut key[..])
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(key)
    }
}

impl Signer for Keys {
    fn public_key(&self) -> PublicKey {
        PublicKey::new(self.signing.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature::new(self.signing.sign(message).to_bytes())
    }
}

impl Cipher for Keys {
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<String, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(CryptoError::EncryptionFailed(format!(
                "plaintext of {} bytes exceeds {}",
                plaintext.len(),
                MAX_PLAINTEXT_SIZE
            )));
        }
        let key = self.conversation_key(recipient)?;
        let padded = pad(plaintext);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(nonce, padded.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        payload.push(PAYLOAD_VERSION);
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    fn decrypt(&self, sender: &PublicKey, payload: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64
            .decode(payload)
            .map_err(|e| CryptoError::MalformedPayload(format!("base64: {}", e)))?;
        if raw.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedPayload(format!(
                "payload too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != PAYLOAD_VERSION {
            return Err(CryptoError::MalformedPayload(format!(
                "unknown version {}",
                raw[0]
            )));
        }

        let key = self.conversation_key(sender)?;
        let nonce = XNonce::from_slice(&raw[1..1 + NONCE_SIZE]);
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let padded = Zeroizing::new(
            cipher
                .decrypt(nonce, &raw[1 + NONCE_SIZE..])
                .map_err(|_| CryptoError::DecryptionFailed)?,
        );
        unpad(&padded)
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keys {{ public: {:?}, secret: [REDACTED] }}", self.public_key())
    }
}

/// Montgomery form of an Ed25519 public key.
fn to_x25519(pubkey: &PublicKey) -> Result<X25519PublicKey, CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(X25519PublicKey::from(verifying_key.to_montgomery().to_bytes()))
}

/// Padded size for a plaintext of `len` bytes.
///
/// 32-byte chunks up to 256 bytes, then chunks of 1/8 of the next power of two.
fn padded_len(len: usize) -> usize {
    if len <= MIN_PADDED_LEN {
        return MIN_PADDED_LEN;
    }
    let next_power = len.next_power_of_two();
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Zeroizing<Vec<u8>> {
    let target = padded_len(plaintext.len());
    let mut out = Zeroizing::new(Vec::with_capacity(LENGTH_PREFIX + target));
    out.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(LENGTH_PREFIX + target, 0);
    out
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < LENGTH_PREFIX {
        return Err(CryptoError::MalformedPayload("missing length prefix".into()));
    }
    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&padded[..LENGTH_PREFIX]);
    let len = u32::from_be_bytes(prefix) as usize;
    let body = &padded[LENGTH_PREFIX..];
    if len > MAX_PLAINTEXT_SIZE || body.len() != padded_len(len) {
        return Err(CryptoError::MalformedPayload("invalid padding".into()));
    }
    Ok(body[..len].to_vec())
}

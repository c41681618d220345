//! Cryptographic primitives for wire confidentiality and integrity
//!
//! AES-256-CBC with PKCS#7 padding for payload encryption, SHA-256 for the
//! content hash and the keyed integrity tag, and a CSPRNG for IVs and message
//! IDs. The symmetric key is derived deterministically from a build-time seed
//! so independently built nodes sharing the seed interoperate; the
//! [`KeyProvider`] trait is the seam for swapping in real key management
//! without touching callers.
//!
//! The exact byte layout of the tag (`SHA256(key || iv || plaintext)`,
//! base64) and the content hash (`SHA256(content || sender || recipient ||
//! timestamp)`, lowercase hex) are wire-compatibility requirements.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CryptoError;
use crate::types::{Timestamp, UserId};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// AES-256 key length in bytes.
pub const KEY_LENGTH: usize = 32;

/// CBC initialization vector length in bytes.
pub const IV_LENGTH: usize = 16;

/// Random message ID length in bytes (before base64 encoding).
pub const MESSAGE_ID_BYTES: usize = 16;

/// Build-time seed the demo key is derived from. Nodes built with different
/// seeds cannot read each other's ciphertext.
pub const DEMO_KEY_SEED: &str = "DT_MESSAGING_DEMO_SEED_2024";

// ----------------------------------------------------------------------------
// Key Provider
// ----------------------------------------------------------------------------

/// Source of the symmetric encryption key.
///
/// Returning `None` signals that no key is available; the engine then sends
/// plaintext frames and refuses inbound ciphertext.
pub trait KeyProvider: Send + Sync {
    fn key(&self) -> Option<[u8; KEY_LENGTH]>;
}

/// Derives a stable key as `SHA256(seed)`.
#[derive(Debug, Clone)]
pub struct SeedKeyProvider {
    key: [u8; KEY_LENGTH],
}

impl SeedKeyProvider {
    pub fn new(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// The demo provider every stock build ships with.
    pub fn demo() -> Self {
        Self::new(DEMO_KEY_SEED)
    }
}

impl KeyProvider for SeedKeyProvider {
    fn key(&self) -> Option<[u8; KEY_LENGTH]> {
        Some(self.key)
    }
}

/// Provider with no key material; forces the plaintext fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyProvider;

impl KeyProvider for NoKeyProvider {
    fn key(&self) -> Option<[u8; KEY_LENGTH]> {
        None
    }
}

// ----------------------------------------------------------------------------
// Encrypted Payload
// ----------------------------------------------------------------------------

/// Encrypted message body as embedded in `NetworkMessage.content` when
/// `encrypted = true`. The one-letter field names are fixed by the wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext.
    #[serde(rename = "c")]
    pub ciphertext: String,
    /// Base64 initialization vector (16 bytes).
    #[serde(rename = "i")]
    pub iv: String,
    /// Base64 integrity tag over the recovered plaintext.
    #[serde(rename = "h")]
    pub tag: String,
}

impl EncryptedPayload {
    pub fn to_json(&self) -> String {
        // Serialization of three string fields cannot fail.
        serde_json::to_string(self).expect("encrypted payload serializes")
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::BadFormat(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// CryptoBox
// ----------------------------------------------------------------------------

/// Symmetric encryption, integrity hashing, and secure ID generation.
pub struct CryptoBox {
    key: Option<[u8; KEY_LENGTH]>,
}

impl CryptoBox {
    pub fn new(provider: &dyn KeyProvider) -> Self {
        let key = provider.key();
        if key.is_none() {
            tracing::warn!("no encryption key available, operating in plaintext mode");
        }
        Self { key }
    }

    /// Box keyed with the demo seed.
    pub fn with_demo_key() -> Self {
        Self::new(&SeedKeyProvider::demo())
    }

    /// Whether encryption is available.
    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt a plaintext body with a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedPayload, CryptoError> {
        let key = self.key.ok_or(CryptoError::Unavailable)?;

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| CryptoError::BadFormat(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(&ciphertext),
            iv: STANDARD.encode(iv),
            tag: Self::integrity_tag(&key, &iv, plaintext),
        })
    }

    /// Decrypt a payload and verify its integrity tag against the recovered
    /// plaintext.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<String, CryptoError> {
        let key = self.key.ok_or(CryptoError::Unavailable)?;

        let ciphertext = STANDARD
            .decode(&payload.ciphertext)
            .map_err(|e| CryptoError::BadFormat(format!("ciphertext: {e}")))?;
        let iv = STANDARD
            .decode(&payload.iv)
            .map_err(|e| CryptoError::BadFormat(format!("iv: {e}")))?;
        if iv.len() != IV_LENGTH {
            return Err(CryptoError::BadFormat(format!(
                "iv is {} bytes, expected {IV_LENGTH}",
                iv.len()
            )));
        }

        let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| CryptoError::BadFormat(e.to_string()))?;
        let plaintext_bytes = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::Tampered)?;
        let plaintext = String::from_utf8(plaintext_bytes)
            .map_err(|_| CryptoError::BadFormat("plaintext is not UTF-8".into()))?;

        if Self::integrity_tag(&key, &iv, &plaintext) != payload.tag {
            tracing::warn!("integrity tag mismatch on decrypt");
            return Err(CryptoError::Tampered);
        }

        Ok(plaintext)
    }

    /// Keyed integrity tag: `base64(SHA256(key || iv || plaintext))`.
    fn integrity_tag(key: &[u8], iv: &[u8], plaintext: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(iv);
        hasher.update(plaintext.as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    /// Content hash carried on every wire message, always computed over the
    /// plaintext: `hex(SHA256(content || sender || recipient || timestamp))`.
    pub fn content_hash(
        content: &str,
        sender: &UserId,
        recipient: &UserId,
        timestamp: u64,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(sender.as_str().as_bytes());
        hasher.update(recipient.as_str().as_bytes());
        hasher.update(timestamp.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Message signature: `base64(SHA256(content || sender || timestamp ||
    /// now || key))`. The wall clock salt makes signatures unique per
    /// emission; see [`CryptoBox::verify_signature`] for what receivers
    /// actually check.
    pub fn sign(&self, content: &str, sender: &UserId, timestamp: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(sender.as_str().as_bytes());
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(Timestamp::now().as_millis().to_string().as_bytes());
        if let Some(key) = &self.key {
            hasher.update(key);
        }
        STANDARD.encode(hasher.finalize())
    }

    /// Wire-compatible signature check: the signature must be base64
    /// decoding to exactly 32 bytes. This is a format check, not an
    /// authenticity proof; real public-key verification is out of scope for
    /// the demo key scheme and deployed nodes check no more than this.
    pub fn verify_signature(signature: &str) -> bool {
        if signature.is_empty() {
            return false;
        }
        match STANDARD.decode(signature) {
            // SHA-256 output length.
            Ok(bytes) => bytes.len() == 32,
            Err(_) => false,
        }
    }

    /// Fresh random message ID: URL-safe base64 of 16 CSPRNG bytes.
    pub fn random_id() -> String {
        let mut bytes = [0u8; MESSAGE_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE.encode(bytes)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

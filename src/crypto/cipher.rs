//! Authenticated symmetric encryption of single chat messages.
//!
//! XSalsa20-Poly1305 with the NaCl `crypto_secretbox` layout (Poly1305 tag
//! prepended to the ciphertext), so envelopes interoperate with browser
//! clients built on libsodium.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD as BASE64};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use crypto_secretbox::aead::{Aead, KeyInit, OsRng};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{ChatError, Result};

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;
/// Poly1305 tag length; every valid ciphertext is at least this long.
pub const TAG_BYTES: usize = 16;

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

/// Envelope field encoding: libsodium's `to_base64` default, URL-safe without padding.
const WIRE_B64: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
/// Accepted on decode for envelopes written with the standard alphabet.
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

fn decode_field(encoded: &str) -> Result<Vec<u8>> {
    WIRE_B64
        .decode(encoded)
        .or_else(|_| STANDARD_LENIENT.decode(encoded))
        .map_err(|_| ChatError::DecryptionFailed)
}

/// The shared symmetric chat key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatKey(Zeroizing<[u8; KEY_BYTES]>);

impl ChatKey {
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns `None` unless `bytes` is exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_BYTES {
            return None;
        }
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(bytes);
        Some(Self::from_bytes(key))
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = Zeroizing::new(BASE64.decode(encoded.trim()).ok()?);
        Self::from_slice(&bytes)
    }

    /// A fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChatKey([REDACTED])")
    }
}

/// Nonce and ciphertext produced by one encryption call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    nonce: [u8; NONCE_BYTES],
    ciphertext: Vec<u8>,
}

/// On-the-wire shape: `{"n": base64url, "c": base64url}`. Unknown fields are ignored.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    n: String,
    c: String,
}

impl Envelope {
    pub fn nonce(&self) -> &[u8; NONCE_BYTES] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn to_wire(&self) -> String {
        let wire = WireEnvelope {
            n: WIRE_B64.encode(self.nonce),
            c: WIRE_B64.encode(&self.ciphertext),
        };
        // Two string fields cannot fail to serialize.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Parse the wire form. Any structural problem is a decryption failure.
    pub fn from_wire(payload: &str) -> Result<Self> {
        let wire: WireEnvelope =
            serde_json::from_str(payload).map_err(|_| ChatError::DecryptionFailed)?;
        let nonce: [u8; NONCE_BYTES] = decode_field(&wire.n)?
            .try_into()
            .map_err(|_| ChatError::DecryptionFailed)?;
        let ciphertext = decode_field(&wire.c)?;
        if ciphertext.len() < TAG_BYTES {
            return Err(ChatError::DecryptionFailed);
        }
        Ok(Self { nonce, ciphertext })
    }
}

/// Encrypt one message under `key` with a freshly drawn random nonce.
#[allow(deprecated)]
pub fn encrypt(plaintext: &[u8], key: &ChatKey) -> Result<Envelope> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| ChatError::Crypto(format!("cipher init: {}", e)))?;
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| ChatError::Crypto(format!("encrypt: {}", e)))?;
    Ok(Envelope { nonce, ciphertext })
}

/// Authenticate and decrypt. Never returns data that failed the tag check.
#[allow(deprecated)]
pub fn decrypt(envelope: &Envelope, key: &ChatKey) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| ChatError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| ChatError::DecryptionFailed)
}

/// Encrypt a text message straight to its wire form.
pub fn encrypt_text(text: &str, key: &ChatKey) -> Result<String> {
    Ok(encrypt(text.as_bytes(), key)?.to_wire())
}

/// Decrypt a wire-form envelope carrying UTF-8 text.
pub fn decrypt_text(payload: &str, key: &ChatKey) -> Result<String> {
    let envelope = Envelope::from_wire(payload)?;
    let plaintext = decrypt(&envelope, key)?;
    String::from_utf8(plaintext).map_err(|_| ChatError::DecryptionFailed)
}

//! Sealing of sensitive settings with XChaCha20-Poly1305.
//!
//! Sealed values are stored as base64 of
//! `nonce (24 bytes) || ciphertext || tag (16 bytes)`.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Passphrase used when the caller does not configure one. It only keeps
/// secrets from being readable as plain text in the store files.
const DEFAULT_PASSPHRASE: &str = "flowpilot-encryption-key";

const KEY_SALT: &[u8] = b"flowpilot-settings-v1";

#[derive(Clone)]
pub struct SettingsCipher {
    key: [u8; KEY_SIZE],
}

impl SettingsCipher {
    /// Derives the key with HKDF-SHA256; the extracted PRK is already 32 bytes.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(KEY_SALT), passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&prk);
        Self { key }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = STANDARD.decode(sealed).map_err(|_| CryptoError::Encoding)?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

impl Default for SettingsCipher {
    fn default() -> Self {
        Self::from_passphrase(DEFAULT_PASSPHRASE)
    }
}

impl fmt::Debug for SettingsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

//! Symmetric encryption of short secrets (proxy passwords and the like).
//!
//! Ciphertext is `base64(nonce || sealed)` under ChaCha20-Poly1305 with a
//! key read from a key file.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("failed to access key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {0} does not hold a {KEY_LEN}-byte base64 key")]
    InvalidKey(String),

    #[error("ciphertext is not valid base64")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext is truncated")]
    Truncated,

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed")]
    Open,

    #[error("plaintext is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct Cipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Random in-memory key. Ciphertext does not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_key(&key)
    }

    /// Load the key stored (base64) at `path`, creating the file with a fresh
    /// random key if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, CipherError> {
        let key_file_err = |source| CipherError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        match std::fs::read_to_string(path) {
            Ok(text) => {
                let bytes = STANDARD
                    .decode(text.trim())
                    .map_err(|_| CipherError::InvalidKey(path.display().to_string()))?;
                let key: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| CipherError::InvalidKey(path.display().to_string()))?;
                Ok(Self::from_key(&key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(key_file_err)?;
                }
                std::fs::write(path, STANDARD.encode(key)).map_err(key_file_err)?;
                tracing::info!(path = %path.display(), "generated new cipher key");
                Ok(Self::from_key(&key))
            }
            Err(e) => Err(key_file_err(e)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        if bytes.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Open)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_reverses_encrypt() {
        let cipher = Cipher::ephemeral();
        let sealed = cipher.encrypt("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn nonces_differ_per_call() {
        let cipher = Cipher::ephemeral();
        assert_ne!(cipher.encrypt("x").unwrap(), cipher.encrypt("x").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = Cipher::ephemeral().encrypt("secret").unwrap();
        assert!(matches!(
            Cipher::ephemeral().decrypt(&sealed),
            Err(CipherError::Open)
        ));
    }

    #[test]
    fn garbage_input_fails() {
        let cipher = Cipher::ephemeral();
        assert!(matches!(cipher.decrypt("%%%"), Err(CipherError::Encoding(_))));
        assert!(matches!(cipher.decrypt("AAAA"), Err(CipherError::Truncated)));
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("veplane.key");
        let first = Cipher::load_or_create(&path).unwrap();
        assert!(path.exists());
        let sealed = first.encrypt("pw").unwrap();
        let second = Cipher::load_or_create(&path).unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), "pw");
    }

    #[test]
    fn malformed_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "c2hvcnQ=").unwrap();
        assert!(matches!(
            Cipher::load_or_create(&path),
            Err(CipherError::InvalidKey(_))
        ));
    }
}

//! Optional symmetric encryption of marshalled bodies.

use crate::error::MomError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::fmt;

/// Nonce length of AES-GCM
const NONCE_LEN: usize = 12;

/// Encrypts marshalled message bodies for a destination.
pub trait Encrypter: Send + Sync + fmt::Debug {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, MomError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MomError>;
}

/// AES-256-GCM with a random nonce per message, prepended to the ciphertext.
pub struct AesGcmEncrypter {
    cipher: Aes256Gcm,
}

impl AesGcmEncrypter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Create from raw key material, which must be 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, MomError> {
        let key: &[u8; 32] = key
            .try_into()
            .map_err(|_| MomError::config(format!("AES-256 key must be 32 bytes, got {}", key.len())))?;
        Ok(Self::new(key))
    }

    /// Encrypter with a freshly generated random key.
    pub fn generate() -> Self {
        Self {
            cipher: Aes256Gcm::new(&Aes256Gcm::generate_key(&mut OsRng)),
        }
    }
}

impl Encrypter for AesGcmEncrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, MomError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| MomError::Encryption(format!("encryption failed: {e}")))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MomError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(MomError::Encryption("ciphertext too short".to_string()));
        }
        let (nonce, data) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), data)
            .map_err(|e| MomError::Encryption(format!("decryption failed: {e}")))
    }
}

impl fmt::Debug for AesGcmEncrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesGcmEncrypter")
    }
}

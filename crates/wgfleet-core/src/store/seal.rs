use std::fmt;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};

use super::StoreError;
use crate::keys::PrivateKey;

/// Ciphertext and nonce of one sealed private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Seals private keys at rest with AES-256-GCM, one random nonce per record.
#[derive(Clone)]
pub struct KeySealer {
    secret: [u8; 32],
}

impl fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySealer").finish_non_exhaustive()
    }
}

impl KeySealer {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    fn cipher(&self) -> Result<Aes256Gcm, StoreError> {
        Aes256Gcm::new_from_slice(&self.secret).map_err(|_| StoreError::Seal)
    }

    pub fn seal(&self, key: &PrivateKey) -> Result<SealedKey, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, key.as_bytes().as_slice())
            .map_err(|_| StoreError::Seal)?;
        Ok(SealedKey { ciphertext, nonce: nonce.to_vec() })
    }

    pub fn open(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<PrivateKey, StoreError> {
        let nonce = Nonce::from_exact_iter(nonce.iter().copied()).ok_or(StoreError::Seal)?;
        let plaintext = self
            .cipher()?
            .decrypt(&nonce, ciphertext)
            .map_err(|_| StoreError::Seal)?;
        let len = plaintext.len();
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| StoreError::Corrupt(format!("sealed key is {len} bytes, expected 32")))?;
        Ok(PrivateKey::from_bytes(bytes))
    }
}

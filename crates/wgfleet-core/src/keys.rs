// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use aes_gcm::aead::OsRng;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, error};
use x25519_dalek::{PublicKey, StaticSecret};

const MAX_ATTEMPTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to decode base64 key: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("no unique public key after {0} attempts")]
    Collision(usize),
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(b64.trim())?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::InvalidLength(len))
}

/// A WireGuard private key. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(b64: &str) -> Result<Self, KeyError> {
        decode_key(b64).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn public_key(&self) -> String {
        let secret = StaticSecret::from(self.0);
        BASE64.encode(PublicKey::from(&secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: String,
}

/// Mints key pairs and tracks which public keys belong to live peers.
#[derive(Debug, Default)]
pub struct KeyProvider {
    issued: Mutex<HashSet<String>>,
}

impl KeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generate(&self) -> Result<KeyPair, KeyError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let secret = StaticSecret::random_from_rng(&mut OsRng);
            let public_key = BASE64.encode(PublicKey::from(&secret).as_bytes());

            if self.lock().insert(public_key.clone()) {
                debug!(public_key = %public_key, "generated key pair");
                return Ok(KeyPair {
                    private_key: PrivateKey(secret.to_bytes()),
                    public_key,
                });
            }
            error!(attempt, "generated public key already in use, retrying");
        }
        Err(KeyError::Collision(MAX_ATTEMPTS))
    }

    /// Register an existing public key. Returns false if it was already taken.
    pub fn reserve(&self, public_key: &str) -> bool {
        self.lock().insert(public_key.to_string())
    }

    pub fn release(&self, public_key: &str) {
        self.lock().remove(public_key);
    }

    pub fn is_issued(&self, public_key: &str) -> bool {
        self.lock().contains(public_key)
    }

    pub fn issued_count(&self) -> usize {
        self.lock().len()
    }
}

//! Secret encryption service using AES-256-GCM
//!
//! Provides encryption and decryption for secret material stored by the
//! built-in SQL keeper. Values are encrypted at rest with AES-256-GCM using a
//! unique nonce per value.
//!
//! ## Configuration
//!
//! The encryption key is loaded from the environment variable
//! `KEEPSAKE_SECRET_ENCRYPTION_KEY` - a base64-encoded 32-byte key.
//!
//! ## Key Rotation
//!
//! Rotation is supported via the `key_version` column on stored rows. When
//! rotating keys, old values remain decryptable with the old key until they
//! are re-encrypted with the new key.

use crate::errors::{KeepsakeError, Result};
use base64::Engine;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Size of AES-256-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of AES-256-GCM tag in bytes
const TAG_SIZE: usize = 16;

/// Configuration for the secret encryption service
#[derive(Debug, Clone)]
pub struct SecretEncryptionConfig {
    /// Base64-encoded 32-byte master encryption key
    pub master_key_base64: String,
    /// Key version for rotation tracking
    pub key_version: String,
}

impl SecretEncryptionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let master_key_base64 = std::env::var("KEEPSAKE_SECRET_ENCRYPTION_KEY").map_err(|_| {
            KeepsakeError::config(
                "KEEPSAKE_SECRET_ENCRYPTION_KEY environment variable not set. \
                 Generate a key with: openssl rand -base64 32",
            )
        })?;

        let key_version =
            std::env::var("KEEPSAKE_SECRET_KEY_VERSION").unwrap_or_else(|_| "default".to_string());

        Ok(Self { master_key_base64, key_version })
    }

    /// Create a testing configuration with a fixed key.
    /// WARNING: never use this outside tests.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        let test_key = [0x42u8; 32];
        Self {
            master_key_base64: base64::engine::general_purpose::STANDARD.encode(test_key),
            key_version: "test".to_string(),
        }
    }
}

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// Secret encryption service
#[derive(Clone)]
pub struct SecretEncryption {
    key_bytes: Arc<[u8; 32]>,
    key_version: String,
    rng: Arc<SystemRandom>,
}

impl SecretEncryption {
    /// Create a new encryption service from configuration
    pub fn new(config: &SecretEncryptionConfig) -> Result<Self> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(&config.master_key_base64)
            .map_err(|e| {
                KeepsakeError::config(format!(
                    "Invalid base64 in KEEPSAKE_SECRET_ENCRYPTION_KEY: {}",
                    e
                ))
            })?;

        if key_bytes.len() != 32 {
            return Err(KeepsakeError::config(format!(
                "KEEPSAKE_SECRET_ENCRYPTION_KEY must be 32 bytes (256 bits), got {} bytes",
                key_bytes.len()
            )));
        }

        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(&key_bytes);

        debug!(key_version = %config.key_version, "Secret encryption service initialized");

        Ok(Self {
            key_bytes: Arc::new(key_array),
            key_version: config.key_version.clone(),
            rng: Arc::new(SystemRandom::new()),
        })
    }

    /// Get the current key version
    pub fn key_version(&self) -> &str {
        &self.key_version
    }

    /// Encrypt plaintext data.
    ///
    /// Returns (ciphertext, nonce) where the ciphertext has the
    /// authentication tag appended and the nonce is 12 bytes.
    #[instrument(skip(self, plaintext), fields(plaintext_len = plaintext.len()))]
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            error!("Failed to generate random nonce");
            KeepsakeError::internal("Failed to generate random nonce for encryption")
        })?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, &*self.key_bytes).map_err(|_| {
            error!("Failed to create encryption key");
            KeepsakeError::internal("Failed to create encryption key")
        })?;

        let nonce_sequence = SingleNonce::new(nonce_bytes);
        let mut sealing_key = aead::SealingKey::new(unbound_key, nonce_sequence);

        let mut ciphertext = plaintext.to_vec();
        ciphertext.reserve(TAG_SIZE);

        sealing_key.seal_in_place_append_tag(Aad::empty(), &mut ciphertext).map_err(|_| {
            error!("Encryption failed");
            KeepsakeError::internal("Failed to encrypt secret data")
        })?;

        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    /// Decrypt ciphertext data.
    ///
    /// The ciphertext must include the authentication tag; the nonce must be
    /// the 12-byte value used during encryption.
    #[instrument(skip(self, ciphertext, nonce), fields(ciphertext_len = ciphertext.len()))]
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(KeepsakeError::internal(format!(
                "Invalid nonce length: expected {} bytes, got {} bytes",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        if ciphertext.len() < TAG_SIZE {
            return Err(KeepsakeError::internal(
                "Ciphertext too short (missing authentication tag)",
            ));
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        let unbound_key = UnboundKey::new(&AES_256_GCM, &*self.key_bytes).map_err(|_| {
            error!("Failed to create decryption key");
            KeepsakeError::internal("Failed to create decryption key")
        })?;

        let nonce_sequence = SingleNonce::new(nonce_bytes);
        let mut opening_key = aead::OpeningKey::new(unbound_key, nonce_sequence);

        let mut plaintext = ciphertext.to_vec();

        let decrypted = opening_key.open_in_place(Aad::empty(), &mut plaintext).map_err(|_| {
            error!("Decryption failed - possible tampering or wrong key");
            KeepsakeError::internal("Failed to decrypt secret data - authentication failed")
        })?;

        Ok(decrypted.to_vec())
    }
}

impl std::fmt::Debug for SecretEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretEncryption")
            .field("key_version", &self.key_version)
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}

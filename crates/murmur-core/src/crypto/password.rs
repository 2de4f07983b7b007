//! Argon2id password verifier derivation.
//!
//! The client sends a proof derived from the password; the node re-derives
//! the stored verifier with these parameters and compares in constant time.
//! Hashing is CPU- and memory-bound, so callers run it off the request hot
//! path (`tokio::task::spawn_blocking`).

use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

/// Argon2id hasher with fixed parameters.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    time: u32,
    memory_mb: u32,
    threads: u32,
    key_len: usize,
}

impl PasswordHasher {
    /// Create a hasher with explicit parameters (memory in MiB).
    pub fn new(time: u32, memory_mb: u32, threads: u32, key_len: u32) -> Self {
        Self {
            time,
            memory_mb,
            threads,
            key_len: key_len as usize,
        }
    }

    /// Derive the verifier for a password-proof and salt.
    pub fn hash(&self, password: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let params = Params::new(
            self.memory_mb.saturating_mul(1024),
            self.time,
            self.threads,
            Some(self.key_len),
        )
        .map_err(|e| Error::InvalidKey(format!("argon2 params: {}", e)))?;

        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut output = Zeroizing::new(vec![0u8; self.key_len]);
        argon
            .hash_password_into(password, salt, &mut output)
            .map_err(|e| Error::InvalidKey(format!("argon2: {}", e)))?;
        Ok(output)
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(1, 64, 1, 32)
    }
}

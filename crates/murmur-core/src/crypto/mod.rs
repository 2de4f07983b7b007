//! Cryptographic primitives.
//!
//! All cryptography uses audited building blocks:
//!
//! - **XChaCha20-Poly1305**: authenticated encryption (AEAD)
//! - **X25519**: Diffie-Hellman key exchange
//! - **Ed25519**: envelope and identity signatures
//! - **HKDF-SHA256**: key derivation
//! - **Argon2id**: password verifier derivation
//! - **SRP-6a**: password-authenticated key exchange
//! - **Signal Double Ratchet**: per-pair message encryption
//!
//! Key material is zeroized on drop wherever the container allows it.

pub mod aead;
pub mod keys;
pub mod password;
pub mod ratchet;
pub mod sealed;
pub mod sign;
pub mod srp;

pub use keys::{EphemeralKeypair, SharedSecret, StaticKeypair, X25519PublicKey, X25519_KEY_SIZE};
pub use ratchet::{DoubleRatchet, RatchetHeader};
pub use sign::{IdentityKeypair, SIGNATURE_SIZE};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::InvalidKey("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
///
/// Prevents timing attacks when comparing MACs, proofs, and verifiers.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

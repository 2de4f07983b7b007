//! Ed25519 identity signatures.
//!
//! Each registered user holds a long-term Ed25519 keypair; the public half
//! is registered with the node and never rotates (a rotation creates a new
//! identity). Envelopes are signed over their canonical payload.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// A long-term Ed25519 signing identity.
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    /// Public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Export secret key bytes for storage.
    ///
    /// # Security
    /// These bytes must be encrypted before storage.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The X25519 secret corresponding to this identity.
    ///
    /// Birational Ed25519→Curve25519 conversion, so one registered key
    /// serves both signing and key agreement (sealed group keys). The
    /// accessor is behind ed25519-dalek's `hazmat` feature; safe here
    /// because the scalar only ever feeds X25519 key agreement, never a
    /// second signing context.
    pub fn agreement_secret(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }
}

/// Convert an Ed25519 public key to its X25519 (Montgomery) form.
///
/// Used to seal symmetric keys to a user's registered identity key.
pub fn agreement_public_key(ed25519_public: &[u8]) -> Result<[u8; 32]> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] = ed25519_public
        .try_into()
        .map_err(|_| Error::InvalidKey("identity key must be 32 bytes".into()))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::InvalidKey("malformed identity key".into()))?;
    Ok(verifying.to_montgomery().to_bytes())
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &hex::encode(&self.public_key_bytes()[..8]))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Verify an Ed25519 signature.
///
/// Fails with [`Error::BadSignature`] on any mismatch; the error does not
/// distinguish a malformed key from a bad signature.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] =
        public_key.try_into().map_err(|_| Error::BadSignature)?;
    let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| Error::BadSignature)?;

    let sig_bytes: [u8; SIGNATURE_SIZE] =
        signature.try_into().map_err(|_| Error::BadSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying
        .verify(message, &signature)
        .map_err(|_| Error::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = IdentityKeypair::generate();
        let message = b"envelope canonical payload";

        let signature = identity.sign(message);
        assert!(verify(&identity.public_key_bytes(), message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let identity = IdentityKeypair::generate();
        let signature = identity.sign(b"original");
        assert!(verify(&identity.public_key_bytes(), b"tampered", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let identity = IdentityKeypair::generate();
        let other = IdentityKeypair::generate();
        let signature = identity.sign(b"message");
        assert!(verify(&other.public_key_bytes(), b"message", &signature).is_err());
    }

    #[test]
    fn test_malformed_inputs_fail() {
        let identity = IdentityKeypair::generate();
        let signature = identity.sign(b"message");

        assert!(verify(&[0u8; 5], b"message", &signature).is_err());
        assert!(verify(&identity.public_key_bytes(), b"message", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_identity_persistence() {
        let identity = IdentityKeypair::generate();
        let restored = IdentityKeypair::from_secret_bytes(identity.secret_bytes());
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_agreement_conversion_matches() {
        use crate::crypto::keys::{StaticKeypair, X25519PublicKey};

        let identity = IdentityKeypair::generate();
        let converted_public =
            agreement_public_key(&identity.public_key_bytes()).expect("convert");

        // DH between the converted secret and a fresh X25519 key agrees
        // from both sides.
        let ours = StaticKeypair::from_secret_bytes(identity.agreement_secret());
        let theirs = StaticKeypair::generate();

        let s1 = ours.diffie_hellman(theirs.public_key());
        let s2 = theirs.diffie_hellman(&X25519PublicKey::from_bytes(converted_public));
        assert_eq!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn test_agreement_conversion_rejects_garbage() {
        assert!(agreement_public_key(&[0u8; 5]).is_err());
    }
}

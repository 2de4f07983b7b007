//! Sealed-box wrapping of symmetric keys.
//!
//! Used to seal the group key to each member's X25519 public key:
//!
//! 1. Generate an ephemeral X25519 keypair
//! 2. ECDH with the recipient's public key
//! 3. HKDF the shared secret into a wrapping key
//! 4. AEAD-seal the symmetric key
//!
//! Layout: `ephemeral_pubkey (32) || nonce (24) || ciphertext || tag (16)`.
//! Only the holder of the recipient secret can unwrap.

use super::aead;
use super::keys::{EphemeralKeypair, StaticKeypair, X25519PublicKey};
use crate::error::{Error, Result};
use zeroize::Zeroizing;

const WRAP_KDF_SALT: &[u8] = b"murmur group key wrap v1";
const WRAP_KDF_INFO: &[u8] = b"group_key";

/// Seal a 32-byte symmetric key to a recipient public key.
pub fn wrap_key(key: &[u8; 32], recipient: &X25519PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralKeypair::generate();
    let shared = ephemeral.diffie_hellman(recipient);

    let okm = super::hkdf_derive(Some(WRAP_KDF_SALT), shared.as_bytes(), WRAP_KDF_INFO, 32)?;
    let wrap_key: [u8; 32] = okm[..]
        .try_into()
        .map_err(|_| Error::Internal("hkdf output length".into()))?;

    let sealed = aead::seal(&wrap_key, key, ephemeral.public_key().as_bytes())?;

    let mut output = Vec::with_capacity(32 + sealed.len());
    output.extend_from_slice(ephemeral.public_key().as_bytes());
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Unwrap a key sealed with [`wrap_key`] using the recipient keypair.
pub fn unwrap_key(wrapped: &[u8], recipient: &StaticKeypair) -> Result<Zeroizing<[u8; 32]>> {
    if wrapped.len() < 32 + aead::NONCE_SIZE + aead::TAG_SIZE {
        return Err(Error::BadCiphertext);
    }

    let ephemeral_pub: [u8; 32] = wrapped[..32]
        .try_into()
        .map_err(|_| Error::BadCiphertext)?;
    let ephemeral_pub = X25519PublicKey::from_bytes(ephemeral_pub);

    let shared = recipient.diffie_hellman(&ephemeral_pub);
    let okm = super::hkdf_derive(Some(WRAP_KDF_SALT), shared.as_bytes(), WRAP_KDF_INFO, 32)?;
    let wrap_key: [u8; 32] = okm[..]
        .try_into()
        .map_err(|_| Error::Internal("hkdf output length".into()))?;

    let plaintext = aead::open(&wrap_key, &wrapped[32..], ephemeral_pub.as_bytes())?;
    if plaintext.len() != 32 {
        return Err(Error::BadCiphertext);
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let recipient = StaticKeypair::generate();
        let group_key = [0x42u8; 32];

        let wrapped = wrap_key(&group_key, recipient.public_key()).expect("wrap");
        // ephemeral pubkey + nonce + key + tag
        assert_eq!(wrapped.len(), 32 + aead::NONCE_SIZE + 32 + aead::TAG_SIZE);

        let unwrapped = unwrap_key(&wrapped, &recipient).expect("unwrap");
        assert_eq!(*unwrapped, group_key);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let recipient = StaticKeypair::generate();
        let other = StaticKeypair::generate();

        let wrapped = wrap_key(&[1u8; 32], recipient.public_key()).expect("wrap");
        assert!(unwrap_key(&wrapped, &other).is_err());
    }

    #[test]
    fn test_tampered_fails() {
        let recipient = StaticKeypair::generate();
        let mut wrapped = wrap_key(&[1u8; 32], recipient.public_key()).expect("wrap");
        let mid = wrapped.len() / 2;
        wrapped[mid] ^= 0xFF;
        assert!(unwrap_key(&wrapped, &recipient).is_err());
    }

    #[test]
    fn test_truncated_fails() {
        let recipient = StaticKeypair::generate();
        let wrapped = wrap_key(&[1u8; 32], recipient.public_key()).expect("wrap");
        assert!(unwrap_key(&wrapped[..40], &recipient).is_err());
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let recipient = StaticKeypair::generate();
        let a = wrap_key(&[7u8; 32], recipient.public_key()).expect("wrap");
        let b = wrap_key(&[7u8; 32], recipient.public_key()).expect("wrap");
        assert_ne!(a, b);
    }
}

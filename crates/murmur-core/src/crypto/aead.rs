//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! The 24-byte extended nonce is drawn from the CSPRNG and prefixed to the
//! ciphertext, so random nonces are safe without any per-key counter state.
//! Associated data binds headers and routing metadata to the ciphertext.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the extended nonce in bytes (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt plaintext with an explicit nonce.
///
/// Returns ciphertext with the 16-byte tag appended. The nonce is NOT
/// included in the output; most callers want [`seal`] instead.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Internal("encryption failed".into()))
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// Fails with [`Error::BadCiphertext`] on any tag, nonce, or associated
/// data mismatch. The error carries no detail about which check failed.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::BadCiphertext)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a fresh random nonce, prefixing it to the output.
///
/// Output format: `nonce (24 bytes) || ciphertext || tag (16 bytes)`
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = encrypt(key, &nonce, plaintext, associated_data)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data produced by [`seal`].
pub fn open(
    key: &[u8; KEY_SIZE],
    data: &[u8],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::BadCiphertext);
    }

    let nonce: [u8; NONCE_SIZE] = data[..NONCE_SIZE]
        .try_into()
        .map_err(|_| Error::BadCiphertext)?;
    decrypt(key, &nonce, &data[NONCE_SIZE..], associated_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"the quick brown fox";
        let aad = b"header";

        let sealed = seal(&key, plaintext, aad).expect("seal");
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let opened = open(&key, &sealed, aad).expect("open");
        assert_eq!(&*opened, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_SIZE], b"secret", b"").expect("seal");
        assert!(matches!(
            open(&[2u8; KEY_SIZE], &sealed, b""),
            Err(Error::BadCiphertext)
        ));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [42u8; KEY_SIZE];
        let sealed = seal(&key, b"secret", b"correct").expect("seal");
        assert!(open(&key, &sealed, b"wrong").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let mut sealed = seal(&key, b"secret", b"").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &sealed, b"").is_err());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = [42u8; KEY_SIZE];
        let mut sealed = seal(&key, b"secret", b"").expect("seal");
        sealed[0] ^= 0xFF;
        assert!(open(&key, &sealed, b"").is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = [42u8; KEY_SIZE];
        assert!(open(&key, &[0u8; NONCE_SIZE], b"").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_SIZE];
        let sealed = seal(&key, b"", b"ad").expect("seal");
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        let opened = open(&key, &sealed, b"ad").expect("open");
        assert!(opened.is_empty());
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = [42u8; KEY_SIZE];
        let a = seal(&key, b"same", b"").expect("seal");
        let b = seal(&key, b"same", b"").expect("seal");
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }
}

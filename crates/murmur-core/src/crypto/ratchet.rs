//! Signal Double Ratchet protocol implementation.
//!
//! Two interleaved ratchets protect every pairwise conversation:
//!
//! 1. **DH ratchet**: each party keeps an X25519 keypair; a message header
//!    carrying a new remote public key advances both root keys.
//! 2. **Symmetric ratchet**: each message advances a chain key, deriving a
//!    unique message key that is deleted after use.
//!
//! Out-of-order delivery is tolerated by caching skipped message keys,
//! bounded per chain jump to resist denial-of-service. A failed decrypt
//! never mutates session state: chain advancement is staged on a scratch
//! copy and committed only after the AEAD opens.

use super::{
    aead,
    keys::{EphemeralKeypair, SharedSecret, X25519PublicKey},
};
use crate::error::{Error, Result};
use crate::MAX_SKIP;
use std::collections::HashMap;
use zeroize::Zeroize;

const ROOT_KDF_INFO: &[u8] = b"ratchet";

/// Header sent with each ratcheted message.
///
/// Authenticated as associated data but not encrypted; the receiver uses it
/// to synchronize its ratchet state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    pub dh_public: X25519PublicKey,
    /// Number of messages in the previous sending chain.
    pub previous_chain_length: u32,
    /// Message number in the current sending chain.
    pub message_number: u32,
}

impl RatchetHeader {
    /// Size of serialized header: 32 (pubkey) + 4 + 4 = 40 bytes
    pub const SIZE: usize = 40;

    /// Serialize header to bytes (also used as associated data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(self.dh_public.as_bytes());
        bytes.extend_from_slice(&self.previous_chain_length.to_le_bytes());
        bytes.extend_from_slice(&self.message_number.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol("header too short".into()));
        }

        let dh_public = X25519PublicKey::from_bytes(
            bytes[..32]
                .try_into()
                .map_err(|_| Error::Protocol("invalid DH key".into()))?,
        );
        let previous_chain_length = u32::from_le_bytes(
            bytes[32..36]
                .try_into()
                .map_err(|_| Error::Protocol("invalid chain length".into()))?,
        );
        let message_number = u32::from_le_bytes(
            bytes[36..40]
                .try_into()
                .map_err(|_| Error::Protocol("invalid message number".into()))?,
        );

        Ok(Self {
            dh_public,
            previous_chain_length,
            message_number,
        })
    }
}

#[derive(Clone)]
struct RatchetState {
    dh_self: EphemeralKeypair,
    dh_remote: Option<X25519PublicKey>,
    root_key: [u8; 32],
    chain_key_send: Option<[u8; 32]>,
    chain_key_recv: Option<[u8; 32]>,
    send_count: u32,
    recv_count: u32,
    previous_send_count: u32,
    /// (remote DH public, message number) -> message key
    skipped_keys: HashMap<([u8; 32], u32), [u8; 32]>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut k) = self.chain_key_send {
            k.zeroize();
        }
        if let Some(ref mut k) = self.chain_key_recv {
            k.zeroize();
        }
        for (_, k) in self.skipped_keys.iter_mut() {
            k.zeroize();
        }
    }
}

/// The Double Ratchet session.
///
/// Single-owner per conversation pair; wrap in a mutex if shared across
/// tasks, holding it only across one encrypt/decrypt call.
pub struct DoubleRatchet {
    state: RatchetState,
}

impl DoubleRatchet {
    /// Initialize as the session initiator (Alice).
    ///
    /// Alice holds Bob's pre-key public from the initial exchange and sends
    /// the first message.
    pub fn init_initiator(
        shared_secret: &SharedSecret,
        their_public: &X25519PublicKey,
    ) -> Result<Self> {
        let dh_self = EphemeralKeypair::generate();
        let dh_output = dh_self.diffie_hellman(their_public);
        let (root_key, chain_key_send) = kdf_root(shared_secret.as_bytes(), dh_output.as_bytes())?;

        Ok(Self {
            state: RatchetState {
                dh_self,
                dh_remote: Some(their_public.clone()),
                root_key,
                chain_key_send: Some(chain_key_send),
                chain_key_recv: None,
                send_count: 0,
                recv_count: 0,
                previous_send_count: 0,
                skipped_keys: HashMap::new(),
            },
        })
    }

    /// Initialize as the session responder (Bob).
    ///
    /// Bob seeds the root key from the shared secret and his pre-key pair,
    /// then waits for Alice's first DH header.
    pub fn init_responder(shared_secret: &SharedSecret, our_keypair: EphemeralKeypair) -> Self {
        Self {
            state: RatchetState {
                dh_self: our_keypair,
                dh_remote: None,
                root_key: *shared_secret.as_bytes(),
                chain_key_send: None,
                chain_key_recv: None,
                send_count: 0,
                recv_count: 0,
                previous_send_count: 0,
                skipped_keys: HashMap::new(),
            },
        }
    }

    /// Encrypt a message.
    ///
    /// Returns the header and ciphertext; the header travels alongside the
    /// ciphertext and is authenticated as associated data.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>)> {
        let chain_key = self
            .state
            .chain_key_send
            .ok_or_else(|| Error::Protocol("no sending chain".into()))?;

        let (message_key, new_chain_key) = kdf_chain(&chain_key);

        let header = RatchetHeader {
            dh_public: self.state.dh_self.public_key().clone(),
            previous_chain_length: self.state.previous_send_count,
            message_number: self.state.send_count,
        };

        let ad = concat_ad(associated_data, &header);
        let ciphertext = aead::seal(&message_key, plaintext, &ad)?;

        self.state.chain_key_send = Some(new_chain_key);
        self.state.send_count += 1;

        Ok((header, ciphertext))
    }

    /// Decrypt a message, handling DH ratchet steps and out-of-order
    /// delivery.
    ///
    /// Fails with [`Error::TooManySkipped`] when a single chain jump would
    /// cache more than [`MAX_SKIP`] keys, and [`Error::BadCiphertext`] on
    /// AEAD failure. Neither failure mutates session state.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let ad = concat_ad(associated_data, header);

        // Skipped-key fast path: the cached entry is removed only after a
        // successful open.
        let key_id = (*header.dh_public.as_bytes(), header.message_number);
        if let Some(message_key) = self.state.skipped_keys.get(&key_id) {
            let plaintext = aead::open(message_key, ciphertext, &ad)?;
            self.state.skipped_keys.remove(&key_id);
            return Ok(plaintext.to_vec());
        }

        // Stage all chain advancement on a scratch copy; commit on success.
        let mut staged = self.state.clone();

        let need_dh_step = staged
            .dh_remote
            .as_ref()
            .map(|remote| remote != &header.dh_public)
            .unwrap_or(true);

        if need_dh_step {
            if staged.chain_key_recv.is_some() {
                staged.skip_message_keys(header.previous_chain_length)?;
            }
            staged.dh_ratchet(&header.dh_public)?;
        }

        staged.skip_message_keys(header.message_number)?;

        let chain_key = staged
            .chain_key_recv
            .ok_or_else(|| Error::Protocol("no receiving chain".into()))?;
        let (message_key, new_chain_key) = kdf_chain(&chain_key);

        let plaintext = aead::open(&message_key, ciphertext, &ad)?;

        staged.chain_key_recv = Some(new_chain_key);
        staged.recv_count += 1;
        self.state = staged;

        Ok(plaintext.to_vec())
    }

    /// Our current ratchet public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        self.state.dh_self.public_key()
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.state.skipped_keys.len()
    }
}

impl RatchetState {
    /// Advance the receiving chain to `until`, caching each skipped
    /// message key.
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        if until > self.recv_count.saturating_add(MAX_SKIP) {
            return Err(Error::TooManySkipped);
        }

        let (mut chain_key, dh_remote) = match (self.chain_key_recv, self.dh_remote.as_ref()) {
            (Some(ck), Some(remote)) => (ck, *remote.as_bytes()),
            _ => return Ok(()),
        };

        while self.recv_count < until {
            let (message_key, new_chain_key) = kdf_chain(&chain_key);
            self.skipped_keys
                .insert((dh_remote, self.recv_count), message_key);
            chain_key = new_chain_key;
            self.recv_count += 1;
        }

        self.chain_key_recv = Some(chain_key);
        Ok(())
    }

    /// Perform a DH ratchet step against a new remote public key.
    fn dh_ratchet(&mut self, their_public: &X25519PublicKey) -> Result<()> {
        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.dh_remote = Some(their_public.clone());

        // New receiving chain from our current keypair.
        let dh_output = self.dh_self.diffie_hellman(their_public);
        let (root_key, chain_key_recv) = kdf_root(&self.root_key, dh_output.as_bytes())?;
        self.root_key = root_key;
        self.chain_key_recv = Some(chain_key_recv);

        // Fresh keypair, new sending chain.
        let new_dh = EphemeralKeypair::generate();
        let dh_output = new_dh.diffie_hellman(their_public);
        let (root_key, chain_key_send) = kdf_root(&self.root_key, dh_output.as_bytes())?;
        self.root_key = root_key;
        self.chain_key_send = Some(chain_key_send);
        self.dh_self = new_dh;

        Ok(())
    }
}

/// Root KDF: HKDF-SHA256(salt = root_key, ikm = dh_output) -> 64 bytes
/// split into (new_root_key, chain_key).
fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let output = super::hkdf_derive(Some(root_key), dh_output, ROOT_KDF_INFO, 64)?;

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);
    Ok((new_root, chain_key))
}

/// Chain KDF: (message_key, new_chain_key) =
/// (SHA-256(ck || 0x01), SHA-256(ck || 0x02)).
fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    use sha2::{Digest, Sha256};

    let mut h = Sha256::new();
    h.update(chain_key);
    h.update([0x01]);
    let message_key: [u8; 32] = h.finalize().into();

    let mut h = Sha256::new();
    h.update(chain_key);
    h.update([0x02]);
    let new_chain_key: [u8; 32] = h.finalize().into();

    (message_key, new_chain_key)
}

fn concat_ad(associated_data: &[u8], header: &RatchetHeader) -> Vec<u8> {
    let mut ad = Vec::with_capacity(associated_data.len() + RatchetHeader::SIZE);
    ad.extend_from_slice(associated_data);
    ad.extend_from_slice(&header.to_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn setup_session() -> (DoubleRatchet, DoubleRatchet) {
        let bob_prekey = EphemeralKeypair::generate();
        let shared = SharedSecret::from_bytes(random_bytes());
        let shared_for_bob = SharedSecret::from_bytes(*shared.as_bytes());

        let alice =
            DoubleRatchet::init_initiator(&shared, bob_prekey.public_key()).expect("init alice");
        let bob = DoubleRatchet::init_responder(&shared_for_bob, bob_prekey);
        (alice, bob)
    }

    #[test]
    fn test_basic_exchange() {
        let (mut alice, mut bob) = setup_session();

        let (header, ciphertext) = alice.encrypt(b"Hello, Bob!", b"conv").expect("encrypt");
        let decrypted = bob.decrypt(&header, &ciphertext, b"conv").expect("decrypt");
        assert_eq!(decrypted, b"Hello, Bob!");

        let (header, ciphertext) = bob.encrypt(b"Hello, Alice!", b"conv").expect("encrypt");
        let decrypted = alice.decrypt(&header, &ciphertext, b"conv").expect("decrypt");
        assert_eq!(decrypted, b"Hello, Alice!");
    }

    #[test]
    fn test_alternating_messages() {
        let (mut alice, mut bob) = setup_session();

        for i in 0..10 {
            if i % 2 == 0 {
                let msg = format!("Alice: {}", i);
                let (h, c) = alice.encrypt(msg.as_bytes(), b"").expect("encrypt");
                assert_eq!(bob.decrypt(&h, &c, b"").expect("decrypt"), msg.as_bytes());
            } else {
                let msg = format!("Bob: {}", i);
                let (h, c) = bob.encrypt(msg.as_bytes(), b"").expect("encrypt");
                assert_eq!(alice.decrypt(&h, &c, b"").expect("decrypt"), msg.as_bytes());
            }
        }
    }

    #[test]
    fn test_out_of_order() {
        let (mut alice, mut bob) = setup_session();

        let (h1, c1) = alice.encrypt(b"msg 1", b"").expect("encrypt");
        let (h2, c2) = alice.encrypt(b"msg 2", b"").expect("encrypt");
        let (h3, c3) = alice.encrypt(b"msg 3", b"").expect("encrypt");

        assert_eq!(bob.decrypt(&h3, &c3, b"").expect("decrypt"), b"msg 3");
        assert_eq!(bob.decrypt(&h1, &c1, b"").expect("decrypt"), b"msg 1");
        assert_eq!(bob.decrypt(&h2, &c2, b"").expect("decrypt"), b"msg 2");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_out_of_order_across_dh_step() {
        let (mut alice, mut bob) = setup_session();

        // Alice sends two, Bob reads only the first.
        let (h1, c1) = alice.encrypt(b"a1", b"").expect("encrypt");
        let (h2, c2) = alice.encrypt(b"a2", b"").expect("encrypt");
        assert_eq!(bob.decrypt(&h1, &c1, b"").expect("decrypt"), b"a1");

        // Bob replies, triggering a DH step on Alice's side.
        let (hb, cb) = bob.encrypt(b"b1", b"").expect("encrypt");
        assert_eq!(alice.decrypt(&hb, &cb, b"").expect("decrypt"), b"b1");

        // Alice sends from her new chain; Bob reads it before the old a2.
        let (h3, c3) = alice.encrypt(b"a3", b"").expect("encrypt");
        assert_eq!(bob.decrypt(&h3, &c3, b"").expect("decrypt"), b"a3");
        assert_eq!(bob.decrypt(&h2, &c2, b"").expect("decrypt"), b"a2");
    }

    #[test]
    fn test_max_skip_boundary() {
        let (mut alice, mut bob) = setup_session();

        // 100 skipped messages is the permitted maximum.
        let mut held = Vec::new();
        for i in 0..=MAX_SKIP {
            let msg = format!("m{}", i);
            held.push((alice.encrypt(msg.as_bytes(), b"").expect("encrypt"), msg));
        }

        // Deliver the last one first: exactly MAX_SKIP keys get cached.
        let ((h_last, c_last), msg_last) = held.pop().expect("held");
        assert_eq!(
            bob.decrypt(&h_last, &c_last, b"").expect("decrypt"),
            msg_last.as_bytes()
        );
        assert_eq!(bob.skipped_key_count(), MAX_SKIP as usize);

        // Every held message still decrypts from the cache.
        for ((h, c), msg) in held {
            assert_eq!(bob.decrypt(&h, &c, b"").expect("decrypt"), msg.as_bytes());
        }
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_too_many_skipped() {
        let (mut alice, mut bob) = setup_session();

        for _ in 0..=MAX_SKIP {
            let _ = alice.encrypt(b"skipped", b"").expect("encrypt");
        }
        let (h, c) = alice.encrypt(b"beyond the cap", b"").expect("encrypt");

        assert!(matches!(
            bob.decrypt(&h, &c, b""),
            Err(Error::TooManySkipped)
        ));
        // No state mutation: nothing cached, counters untouched.
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_bad_ciphertext_does_not_corrupt_state() {
        let (mut alice, mut bob) = setup_session();

        let (h1, c1) = alice.encrypt(b"first", b"").expect("encrypt");
        let (h2, mut c2) = alice.encrypt(b"second", b"").expect("encrypt");
        let last = c2.len() - 1;
        c2[last] ^= 0xFF;

        assert!(matches!(
            bob.decrypt(&h2, &c2, b""),
            Err(Error::BadCiphertext)
        ));

        // The session still decrypts in order after the failure.
        assert_eq!(bob.decrypt(&h1, &c1, b"").expect("decrypt"), b"first");
        let (h3, c3) = alice.encrypt(b"third", b"").expect("encrypt");
        assert_eq!(bob.decrypt(&h3, &c3, b"").expect("decrypt"), b"third");
    }

    #[test]
    fn test_wrong_ad_fails() {
        let (mut alice, mut bob) = setup_session();
        let (h, c) = alice.encrypt(b"payload", b"conversation-1").expect("encrypt");
        assert!(bob.decrypt(&h, &c, b"conversation-2").is_err());
    }

    #[test]
    fn test_header_serialization() {
        let header = RatchetHeader {
            dh_public: X25519PublicKey::from_bytes([42u8; 32]),
            previous_chain_length: 5,
            message_number: 10,
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), RatchetHeader::SIZE);
        let parsed = RatchetHeader::from_bytes(&bytes).expect("parse");
        assert_eq!(header, parsed);

        assert!(RatchetHeader::from_bytes(&bytes[..10]).is_err());
    }
}

//! SRP-6a password-authenticated key exchange.
//!
//! Runs during registration and login so the node never sees a plaintext
//! password. Group parameters: the 2048-bit MODP safe prime from RFC 3526,
//! generator g = 2, multiplier k = H(N || pad(g)).
//!
//! Hash layouts (all SHA-256, big-endian integer bytes with leading zeros
//! stripped):
//!
//! - `x  = H(salt || H(username ":" password))`
//! - `u  = H(A || B)`
//! - `K  = H(S)`
//! - `M1 = H(username || salt || A || B || K)`
//! - `M2 = H(A || M1 || K)`

use crate::crypto::constant_time_eq;
use crate::error::{Error, Result};
use num_bigint::{BigUint, RandBigInt};
use num_traits::Zero;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// RFC 3526 2048-bit MODP group prime.
const N_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                     020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                     4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                     EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
                     98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
                     9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                     E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
                     3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// SRP-6a group parameters.
pub struct SrpGroup {
    n: BigUint,
    g: BigUint,
    k: BigUint,
}

impl SrpGroup {
    /// Construct the standard group. k is derived rather than pinned.
    pub fn new() -> Self {
        let n = BigUint::parse_bytes(N_HEX.as_bytes(), 16).unwrap_or_else(BigUint::zero);
        let g = BigUint::from(2u8);

        // k = H(N || pad(g)): g left-padded to N's byte length.
        let n_bytes = n.to_bytes_be();
        let mut padded_g = vec![0u8; n_bytes.len()];
        let g_bytes = g.to_bytes_be();
        padded_g[n_bytes.len() - g_bytes.len()..].copy_from_slice(&g_bytes);

        let mut h = Sha256::new();
        h.update(&n_bytes);
        h.update(&padded_g);
        let k = BigUint::from_bytes_be(&h.finalize());

        Self { n, g, k }
    }

    /// Derive the private key x from salt and credentials.
    pub fn derive_x(&self, username: &str, salt: &[u8], password: &str) -> BigUint {
        let mut inner = Sha256::new();
        inner.update(username.as_bytes());
        inner.update(b":");
        inner.update(password.as_bytes());
        let inner = inner.finalize();

        let mut outer = Sha256::new();
        outer.update(salt);
        outer.update(inner);
        BigUint::from_bytes_be(&outer.finalize())
    }

    /// Compute the password verifier v = g^x mod N.
    pub fn create_verifier(&self, username: &str, salt: &[u8], password: &str) -> BigUint {
        let x = self.derive_x(username, salt, password);
        self.g.modpow(&x, &self.n)
    }

    /// Begin a client session.
    pub fn client_session(&self, username: &str, password: &str) -> ClientSession<'_> {
        let a = self.random_exponent();
        let big_a = self.g.modpow(&a, &self.n);
        ClientSession {
            group: self,
            username: username.to_string(),
            password: password.to_string(),
            a,
            big_a,
        }
    }

    /// Begin a server session from the stored (salt, verifier).
    pub fn server_session(
        &self,
        username: &str,
        salt: Vec<u8>,
        verifier: BigUint,
    ) -> ServerSession<'_> {
        let b = self.random_exponent();
        let gb = self.g.modpow(&b, &self.n);
        let kv = (&self.k * &verifier) % &self.n;
        let big_b = (kv + gb) % &self.n;
        ServerSession {
            group: self,
            username: username.to_string(),
            salt,
            verifier,
            b,
            big_b,
        }
    }

    fn random_exponent(&self) -> BigUint {
        let mut rng = OsRng;
        loop {
            let candidate = rng.gen_biguint_below(&self.n);
            if !candidate.is_zero() {
                return candidate;
            }
        }
    }
}

impl Default for SrpGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Client half of the exchange.
pub struct ClientSession<'g> {
    group: &'g SrpGroup,
    username: String,
    password: String,
    a: BigUint,
    big_a: BigUint,
}

impl ClientSession<'_> {
    /// The client's public value A.
    pub fn public_a(&self) -> &BigUint {
        &self.big_a
    }

    /// Process the server's (salt, B) challenge.
    ///
    /// Returns (M1, K). Fails with [`Error::InvalidPublic`] when B ≡ 0 mod N.
    pub fn process_challenge(
        &self,
        salt: &[u8],
        big_b: &BigUint,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let n = &self.group.n;
        if (big_b % n).is_zero() {
            return Err(Error::InvalidPublic);
        }

        let u = hash_ints(&self.big_a, big_b);
        let x = self.group.derive_x(&self.username, salt, &self.password);

        // diff = (B - k * g^x) mod N, kept non-negative.
        let kgx = (&self.group.k * self.group.g.modpow(&x, n)) % n;
        let diff = ((big_b % n) + n - kgx) % n;

        let exponent = &self.a + &u * &x;
        let s = diff.modpow(&exponent, n);
        let key = sha256(&s.to_bytes_be());

        let m1 = hash_m1(&self.username, salt, &self.big_a, big_b, &key);
        Ok((m1, key))
    }

    /// Verify the server's proof M2 against our M1 and session key.
    pub fn verify_server_proof(&self, m1: &[u8], key: &[u8], m2: &[u8]) -> Result<()> {
        let expected = hash_m2(&self.big_a, m1, key);
        if constant_time_eq(m2, &expected) {
            Ok(())
        } else {
            Err(Error::BadProof)
        }
    }
}

/// Server half of the exchange.
pub struct ServerSession<'g> {
    group: &'g SrpGroup,
    username: String,
    salt: Vec<u8>,
    verifier: BigUint,
    b: BigUint,
    big_b: BigUint,
}

impl ServerSession<'_> {
    /// The server's public value B.
    pub fn public_b(&self) -> &BigUint {
        &self.big_b
    }

    /// The salt issued with the challenge.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Verify the client's (A, M1) proof.
    ///
    /// Returns (M2, K) on success. Fails with [`Error::InvalidPublic`] when
    /// A ≡ 0 mod N and [`Error::BadProof`] on an M1 mismatch (checked in
    /// constant time).
    pub fn verify_client_proof(
        &self,
        big_a: &BigUint,
        m1: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let n = &self.group.n;
        if (big_a % n).is_zero() {
            return Err(Error::InvalidPublic);
        }

        let u = hash_ints(big_a, &self.big_b);
        let avu = (big_a * self.verifier.modpow(&u, n)) % n;
        let s = avu.modpow(&self.b, n);
        let key = sha256(&s.to_bytes_be());

        let expected_m1 = hash_m1(&self.username, &self.salt, big_a, &self.big_b, &key);
        if !constant_time_eq(m1, &expected_m1) {
            return Err(Error::BadProof);
        }

        let m2 = hash_m2(big_a, m1, &key);
        Ok((m2, key))
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn hash_ints(a: &BigUint, b: &BigUint) -> BigUint {
    let mut h = Sha256::new();
    h.update(a.to_bytes_be());
    h.update(b.to_bytes_be());
    BigUint::from_bytes_be(&h.finalize())
}

fn hash_m1(username: &str, salt: &[u8], a: &BigUint, b: &BigUint, key: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(username.as_bytes());
    h.update(salt);
    h.update(a.to_bytes_be());
    h.update(b.to_bytes_be());
    h.update(key);
    h.finalize().to_vec()
}

fn hash_m2(a: &BigUint, m1: &[u8], key: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(a.to_bytes_be());
    h.update(m1);
    h.update(key);
    h.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_parameters() {
        let group = SrpGroup::new();
        assert_eq!(group.n.bits(), 2048);
        assert_eq!(group.g, BigUint::from(2u8));
        assert!(!group.k.is_zero());
    }

    #[test]
    fn test_successful_exchange() {
        let group = SrpGroup::new();
        let salt = b"0123456789abcdef".to_vec();
        let verifier = group.create_verifier("alice", &salt, "hunter2");

        let client = group.client_session("alice", "hunter2");
        let server = group.server_session("alice", salt.clone(), verifier);

        let (m1, client_key) = client
            .process_challenge(&salt, server.public_b())
            .expect("challenge");
        let (m2, server_key) = server
            .verify_client_proof(client.public_a(), &m1)
            .expect("client proof");

        assert_eq!(client_key, server_key);
        assert!(client.verify_server_proof(&m1, &client_key, &m2).is_ok());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let group = SrpGroup::new();
        let salt = b"0123456789abcdef".to_vec();
        let verifier = group.create_verifier("alice", &salt, "hunter2");

        let client = group.client_session("alice", "wrong-password");
        let server = group.server_session("alice", salt.clone(), verifier);

        let (m1, _) = client
            .process_challenge(&salt, server.public_b())
            .expect("challenge");
        assert!(matches!(
            server.verify_client_proof(client.public_a(), &m1),
            Err(Error::BadProof)
        ));
    }

    #[test]
    fn test_zero_public_values_rejected() {
        let group = SrpGroup::new();
        let salt = b"0123456789abcdef".to_vec();
        let verifier = group.create_verifier("alice", &salt, "hunter2");

        let client = group.client_session("alice", "hunter2");
        assert!(matches!(
            client.process_challenge(&salt, &BigUint::zero()),
            Err(Error::InvalidPublic)
        ));

        // A multiple of N is congruent to zero and equally invalid.
        let n_multiple = group.n.clone() * BigUint::from(3u8);
        assert!(matches!(
            client.process_challenge(&salt, &n_multiple),
            Err(Error::InvalidPublic)
        ));

        let server = group.server_session("alice", salt, verifier);
        assert!(matches!(
            server.verify_client_proof(&BigUint::zero(), b"m1"),
            Err(Error::InvalidPublic)
        ));
    }

    #[test]
    fn test_tampered_m1_rejected() {
        let group = SrpGroup::new();
        let salt = b"0123456789abcdef".to_vec();
        let verifier = group.create_verifier("alice", &salt, "hunter2");

        let client = group.client_session("alice", "hunter2");
        let server = group.server_session("alice", salt.clone(), verifier);

        let (mut m1, _) = client
            .process_challenge(&salt, server.public_b())
            .expect("challenge");
        m1[0] ^= 0xFF;
        assert!(server.verify_client_proof(client.public_a(), &m1).is_err());
    }

    #[test]
    fn test_tampered_m2_rejected() {
        let group = SrpGroup::new();
        let salt = b"0123456789abcdef".to_vec();
        let verifier = group.create_verifier("alice", &salt, "hunter2");

        let client = group.client_session("alice", "hunter2");
        let server = group.server_session("alice", salt.clone(), verifier);

        let (m1, key) = client
            .process_challenge(&salt, server.public_b())
            .expect("challenge");
        let (mut m2, _) = server
            .verify_client_proof(client.public_a(), &m1)
            .expect("proof");
        m2[0] ^= 0xFF;
        assert!(matches!(
            client.verify_server_proof(&m1, &key, &m2),
            Err(Error::BadProof)
        ));
    }
}

//! Access and refresh token handling.
//!
//! An access token is the base32-no-pad encoding of
//! `json_payload || HMAC-SHA256(key, json_payload)`. Verification splits
//! the trailing 32 MAC bytes, compares in constant time, then enforces
//! issuer and expiry. Refresh tokens are 32 random bytes (base32); only
//! their SHA-256 hash is stored.

use crate::crypto::{constant_time_eq, random_bytes};
use crate::error::{Error, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const MAC_SIZE: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Subject (user id).
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Bound device.
    pub device_id: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Random nonce, 8 bytes.
    pub n: Vec<u8>,
}

/// Issues and verifies HMAC-signed access tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    key: [u8; 32],
    issuer: String,
    lifetime: Duration,
    allowed_skew: Duration,
}

impl TokenIssuer {
    /// Create an issuer with a 32-byte HMAC key.
    pub fn new(key: [u8; 32], issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            key,
            issuer: issuer.into(),
            lifetime,
            allowed_skew: Duration::from_secs(30),
        }
    }

    /// Override the clock skew tolerated at verification.
    pub fn with_allowed_skew(mut self, skew: Duration) -> Self {
        self.allowed_skew = skew;
        self
    }

    /// Issue an access token for (subject, device) at `now_unix`.
    ///
    /// Returns the token and its expiry.
    pub fn issue(&self, subject: &str, device_id: &str, now_unix: i64) -> Result<(String, i64)> {
        let exp = now_unix + self.lifetime.as_secs() as i64;
        let payload = TokenPayload {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            device_id: device_id.to_string(),
            exp,
            n: random_bytes::<8>().to_vec(),
        };

        let body = serde_json::to_vec(&payload)
            .map_err(|e| Error::Internal(format!("token payload: {}", e)))?;
        let mac = hmac_sign(&self.key, &body);

        let mut raw = body;
        raw.extend_from_slice(&mac);
        Ok((BASE32_NOPAD.encode(&raw), exp))
    }

    /// Verify a token and return its claims.
    ///
    /// Fails with [`Error::Unauthenticated`] on decode/MAC/issuer problems
    /// and [`Error::SessionExpired`] once `exp` (plus allowed skew) has
    /// passed.
    pub fn verify(&self, token: &str, now_unix: i64) -> Result<TokenPayload> {
        let raw = BASE32_NOPAD
            .decode(token.as_bytes())
            .map_err(|_| Error::Unauthenticated)?;
        if raw.len() <= MAC_SIZE {
            return Err(Error::Unauthenticated);
        }

        let (body, mac) = raw.split_at(raw.len() - MAC_SIZE);
        let expected = hmac_sign(&self.key, body);
        if !constant_time_eq(mac, &expected) {
            return Err(Error::Unauthenticated);
        }

        let payload: TokenPayload =
            serde_json::from_slice(body).map_err(|_| Error::Unauthenticated)?;
        if payload.iss != self.issuer {
            return Err(Error::Unauthenticated);
        }
        if now_unix > payload.exp + self.allowed_skew.as_secs() as i64 {
            return Err(Error::SessionExpired);
        }
        Ok(payload)
    }
}

fn hmac_sign(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts any key length; new_from_slice cannot fail here.
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Mint a fresh refresh token.
///
/// Returns the client-facing base32 string and the SHA-256 hash stored
/// server-side.
pub fn new_refresh_token() -> (String, Vec<u8>) {
    let raw: [u8; 32] = random_bytes();
    let token = BASE32_NOPAD.encode(&raw);
    let hash = Sha256::digest(token.as_bytes()).to_vec();
    (token, hash)
}

/// Hash a presented refresh token for lookup.
pub fn refresh_token_hash(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

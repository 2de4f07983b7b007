//! Identity and authentication service.
//!
//! Registration stores an Argon2id password verifier (the node never sees
//! the plaintext password; the client derives a proof via SRP-6a plus the
//! KDF), a long-term Ed25519 public key, and a per-user second-factor
//! secret. Login re-derives the verifier off the request hot path,
//! compares in constant time, checks the second factor, and issues HMAC
//! access tokens plus hashed refresh tokens bound to a device.

mod rate_limit;
mod second_factor;
mod token;

pub use rate_limit::RateLimiter;
pub use second_factor::SecondFactor;
pub use token::{new_refresh_token, refresh_token_hash, TokenIssuer, TokenPayload};

use crate::crypto::{constant_time_eq, password::PasswordHasher, random_bytes};
use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::storage::{Database, UserRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Access token.
    pub access: String,
    /// Refresh token (store only client-side).
    pub refresh: String,
    /// Access token expiry (Unix seconds).
    pub expires_at: i64,
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Fresh access token.
    pub access: String,
    /// Rotated refresh token replacing the presented one.
    pub refresh: String,
    /// Access token expiry (Unix seconds).
    pub expires_at: i64,
}

/// Authentication service.
pub struct AuthService {
    db: Arc<Mutex<Database>>,
    hasher: PasswordHasher,
    issuer: TokenIssuer,
    second_factor: SecondFactor,
    refresh_ttl: Duration,
    limiter: RateLimiter,
}

impl AuthService {
    /// Create the service.
    pub fn new(
        db: Arc<Mutex<Database>>,
        hasher: PasswordHasher,
        issuer: TokenIssuer,
        second_factor: SecondFactor,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            db,
            hasher,
            issuer,
            second_factor,
            refresh_ttl,
            limiter: RateLimiter::default(),
        }
    }

    /// Replace the default rate limiter.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Register a new user.
    ///
    /// `password_proof` carries `hex(salt) ":" hex(derived)`; the node
    /// stores the salt and the verifier, never a password. Usernames are
    /// lowercased for uniqueness. Returns the new time-ordered user id.
    pub async fn register(
        &self,
        remote_addr: &str,
        username: &str,
        password_proof: &[u8],
        client_public_key: &[u8],
    ) -> Result<String> {
        self.limiter.check(remote_addr)?;

        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let (salt, derived) = parse_password_proof(password_proof)?;

        let user = UserRecord {
            id: uuid::Uuid::now_v7().to_string(),
            username: username.clone(),
            server_salt: salt,
            password_hash: derived,
            public_key: client_public_key.to_vec(),
            second_factor_secret: random_bytes::<32>().to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        };

        {
            let db = self.db.lock().await;
            db.create_user(&user)?;
            db.write_audit(&user.id, "", "register")?;
        }

        info!(user_id = %user.id, %username, "registered user");
        Ok(user.id)
    }

    /// Log a user in, issuing an access/refresh token pair.
    ///
    /// The password check and the second-factor check both fail with the
    /// same generic [`Error::InvalidCredentials`], in constant time.
    pub async fn login(
        &self,
        remote_addr: &str,
        username: &str,
        password_proof: &[u8],
        device_id: &str,
        second_code: &str,
        now_unix: i64,
    ) -> Result<LoginOutcome> {
        self.limiter.check(remote_addr)?;

        let username = username.trim().to_lowercase();
        let user = self
            .db
            .lock()
            .await
            .find_user_by_username(&username)?
            .ok_or(Error::InvalidCredentials)?;

        // Argon2id is deliberately slow; keep it off the async hot path.
        let hasher = self.hasher.clone();
        let proof = password_proof.to_vec();
        let salt = user.server_salt.clone();
        let derived = tokio::task::spawn_blocking(move || hasher.hash(&proof, &salt))
            .await
            .map_err(|e| Error::Internal(format!("kdf task: {}", e)))??;

        if !constant_time_eq(&derived, &user.password_hash) {
            warn!(%username, "login failed: bad password proof");
            return Err(Error::InvalidCredentials);
        }

        if !self
            .second_factor
            .verify(&user.second_factor_secret, now_unix, second_code)
        {
            warn!(%username, "login failed: bad second factor");
            return Err(Error::InvalidCredentials);
        }

        let (access, expires_at) = self.issuer.issue(&user.id, device_id, now_unix)?;
        let (refresh, refresh_hash) = new_refresh_token();
        let refresh_expires = now_unix + self.refresh_ttl.as_secs() as i64;

        {
            let db = self.db.lock().await;
            db.create_session(
                &uuid::Uuid::now_v7().to_string(),
                &user.id,
                device_id,
                &refresh_hash,
                refresh_expires,
            )?;
            db.write_audit(&user.id, device_id, "login")?;
        }

        info!(user_id = %user.id, device_id, "login succeeded");
        Ok(LoginOutcome {
            access,
            refresh,
            expires_at,
        })
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// The presented token must hash to a live session bound to the same
    /// device. The refresh hash is rotated atomically, so at most one
    /// refresh token is outstanding per (user, device).
    pub async fn refresh(
        &self,
        remote_addr: &str,
        refresh_token: &str,
        device_id: &str,
        now_unix: i64,
    ) -> Result<RefreshOutcome> {
        self.limiter.check(remote_addr)?;

        let old_hash = refresh_token_hash(refresh_token);
        let session = self
            .db
            .lock()
            .await
            .session_by_refresh_hash(&old_hash)?
            .ok_or(Error::InvalidCredentials)?;

        if session.device_id != device_id {
            warn!(
                token = %RedactedHex(refresh_token),
                "refresh failed: device mismatch"
            );
            return Err(Error::InvalidCredentials);
        }
        if now_unix > session.expires_at {
            return Err(Error::SessionExpired);
        }

        let (access, expires_at) = self.issuer.issue(&session.user_id, device_id, now_unix)?;
        let (refresh, new_hash) = new_refresh_token();

        {
            let db = self.db.lock().await;
            // Keyed by the old hash: a racing refresh with the same token
            // rotates at most once.
            if !db.rotate_refresh_hash(&old_hash, &new_hash)? {
                return Err(Error::InvalidCredentials);
            }
            db.write_audit(&session.user_id, device_id, "refresh")?;
        }

        Ok(RefreshOutcome {
            access,
            refresh,
            expires_at,
        })
    }

    /// Destroy the session bound to (user, device).
    pub async fn logout(&self, user_id: &str, device_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.delete_session(user_id, device_id)?;
        db.write_audit(user_id, device_id, "logout")?;
        Ok(())
    }

    /// Fetch a user's registered Ed25519 public key.
    pub async fn get_public_key(&self, remote_addr: &str, user_id: &str) -> Result<Vec<u8>> {
        self.limiter.check(remote_addr)?;
        self.db
            .lock()
            .await
            .get_public_key(user_id)?
            .ok_or(Error::UnknownSender)
    }

    /// Verify an access token and return its claims.
    pub fn verify_access(&self, token: &str, now_unix: i64) -> Result<TokenPayload> {
        self.issuer.verify(token, now_unix)
    }
}

/// Split a `hex(salt) ":" hex(derived)` proof into its parts.
fn parse_password_proof(proof: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let text = std::str::from_utf8(proof).map_err(|_| Error::InvalidCredentials)?;
    let (salt_hex, derived_hex) = text.split_once(':').ok_or(Error::InvalidCredentials)?;

    let salt = hex::decode(salt_hex).map_err(|_| Error::InvalidCredentials)?;
    let derived = hex::decode(derived_hex).map_err(|_| Error::InvalidCredentials)?;
    if salt.is_empty() || derived.is_empty() {
        return Err(Error::InvalidCredentials);
    }
    Ok((salt, derived))
}

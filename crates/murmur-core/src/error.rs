//! Error types for murmur.
//!
//! Every failure maps to a stable code so the RPC glue can translate it
//! without inspecting message text. Display strings are intentionally
//! generic; authentication and cryptographic errors never reveal which
//! field failed.

use thiserror::Error;

/// Core error type for murmur operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No valid access token was presented.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Username/password/second-factor check failed.
    /// Deliberately generic; the comparison itself is timing-safe.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Per-address sliding window exceeded.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Refresh session expired or was revoked.
    #[error("session expired")]
    SessionExpired,

    /// Username already registered.
    #[error("username taken")]
    UsernameTaken,

    /// Envelope failed to decode or is missing required fields.
    #[error("bad envelope")]
    BadEnvelope(String),

    /// Envelope signature did not verify under the sender's key.
    #[error("bad signature")]
    BadSignature,

    /// Envelope sender has no registered public key.
    #[error("unknown sender")]
    UnknownSender,

    /// Caller lacks the required group role.
    #[error("not authorized")]
    NotAuthorized,

    /// Caller is not a member of the group.
    #[error("not a member")]
    NotMember,

    /// Member key version diverged from the group's current version.
    #[error("key version mismatch")]
    KeyVersionMismatch,

    /// AEAD open failed (tag, nonce, or associated data mismatch).
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("bad ciphertext")]
    BadCiphertext,

    /// A single chain jump would cache more skipped keys than allowed.
    #[error("too many skipped message keys")]
    TooManySkipped,

    /// SRP public value was congruent to zero mod N.
    #[error("invalid public value")]
    InvalidPublic,

    /// SRP proof mismatch.
    #[error("bad proof")]
    BadProof,

    /// Reconstructed CAR hash disagreed with the declared BLAKE3 digest.
    #[error("blake3 mismatch")]
    Blake3Mismatch,

    /// Stream or upload crossed its byte cap.
    #[error("size limit exceeded")]
    SizeLimitExceeded,

    /// The requested transport is not registered or cannot dial.
    #[error("transport unavailable")]
    TransportUnavailable(String),

    /// Every registered transport failed to dial.
    #[error("all transports failed")]
    AllTransportsFailed,

    /// Key validation or derivation failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Wire protocol error (malformed frame, oversize payload).
    #[error("protocol error")]
    Protocol(String),

    /// Resource not found.
    #[error("not found")]
    NotFound,

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),

    /// Configuration could not be loaded or validated.
    #[error("config error")]
    Config(String),

    /// Transient I/O failure that survived retries.
    #[error("unavailable")]
    Unavailable(String),

    /// Invariant violation; a bug, not an operational condition.
    #[error("internal error")]
    Internal(String),
}

/// Result type alias using murmur's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadEnvelope(e.to_string())
    }
}

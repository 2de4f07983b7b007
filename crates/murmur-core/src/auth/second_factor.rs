//! Time-based second-factor codes.
//!
//! A code is HMAC-SHA256(secret, big-endian period counter), encoded as
//! uppercase base32-no-pad and truncated to the configured length. Each
//! user holds their own 32-byte secret, generated at registration.
//! Verification accepts the previous, current, and next rotation window
//! and compares in constant time.

use crate::crypto::constant_time_eq;
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Second-factor code generator/verifier.
#[derive(Debug, Clone)]
pub struct SecondFactor {
    length: usize,
    period: Duration,
}

impl SecondFactor {
    /// Create with a code length and rotation period.
    pub fn new(length: usize, rotate_minutes: u64) -> Self {
        Self {
            length,
            period: Duration::from_secs(rotate_minutes * 60),
        }
    }

    /// The code for a secret at a given wall-clock time.
    pub fn code_at(&self, secret: &[u8], now_unix: i64) -> String {
        let period = self.period.as_secs().max(1) as i64;
        let counter = now_unix.div_euclid(period);

        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
            return String::new();
        };
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let mut code = BASE32_NOPAD.encode(&digest);
        code.truncate(self.length);
        code
    }

    /// Verify a presented code within windows {-1, 0, +1}.
    pub fn verify(&self, secret: &[u8], now_unix: i64, code: &str) -> bool {
        let code = code.trim().to_uppercase();
        if code.is_empty() || code.len() != self.length {
            return false;
        }

        let period = self.period.as_secs().max(1) as i64;
        for offset in [-1i64, 0, 1] {
            let candidate = self.code_at(secret, now_unix + offset * period);
            if constant_time_eq(candidate.as_bytes(), code.as_bytes()) {
                return true;
            }
        }
        false
    }
}

impl Default for SecondFactor {
    fn default() -> Self {
        Self::new(8, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"per-user-second-factor-secret!!!";

    #[test]
    fn test_current_code_accepted() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        let code = sf.code_at(SECRET, now);
        assert_eq!(code.len(), 8);
        assert!(sf.verify(SECRET, now, &code));
    }

    #[test]
    fn test_adjacent_windows_accepted() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        let previous = sf.code_at(SECRET, now - 300);
        let next = sf.code_at(SECRET, now + 300);
        assert!(sf.verify(SECRET, now, &previous));
        assert!(sf.verify(SECRET, now, &next));
    }

    #[test]
    fn test_distant_windows_rejected() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        let stale = sf.code_at(SECRET, now - 2 * 300);
        // A two-window-old code only passes if it happens to collide.
        if stale != sf.code_at(SECRET, now - 300)
            && stale != sf.code_at(SECRET, now)
            && stale != sf.code_at(SECRET, now + 300)
        {
            assert!(!sf.verify(SECRET, now, &stale));
        }
    }

    #[test]
    fn test_malformed_codes_rejected() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        assert!(!sf.verify(SECRET, now, ""));
        assert!(!sf.verify(SECRET, now, "SHORT"));
        assert!(!sf.verify(SECRET, now, "WAYTOOLONGCODE"));
    }

    #[test]
    fn test_case_and_whitespace_tolerated() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        let code = sf.code_at(SECRET, now);
        let sloppy = format!("  {}  ", code.to_lowercase());
        assert!(sf.verify(SECRET, now, &sloppy));
    }

    #[test]
    fn test_secret_isolation() {
        let sf = SecondFactor::new(8, 5);
        let now = 1_700_000_000;
        let code = sf.code_at(SECRET, now);
        assert!(!sf.verify(b"a different 32-byte user secret.", now, &code));
    }
}

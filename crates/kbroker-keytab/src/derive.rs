//! Deterministic password derivation
//!
//! The password for a principal in a given period is a pure function of the
//! shared seed, the principal name and the period's start time:
//!
//! ```text
//! otp      = TOTP-SHA512(seed, boundary)          8 digits, 30s step
//! digest   = SHA-512(otp || seed || principal)
//! password = base64url(digest)[..31] + "!"
//! ```
//!
//! Every replica sharing the seed and a synchronized clock therefore arrives
//! at the same password for the same period without talking to the others.
//! The trailing `!` puts a character outside the base64url alphabet into
//! every password, which KDC password-quality policies usually demand.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ring::hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};

/// TOTP time step in seconds
pub const TOTP_STEP_SECS: i64 = 30;

/// TOTP code length
pub const TOTP_DIGITS: u32 = 8;

/// Length of a derived password, suffix included
pub const PASSWORD_LEN: usize = 32;

const PASSWORD_SUFFIX: char = '!';

/// RFC 6238 TOTP over HMAC-SHA512 at Unix time `unix_secs`
///
/// Times before the epoch use counter zero.
pub fn totp(secret: &[u8], unix_secs: i64) -> String {
    let counter = u64::try_from(unix_secs.div_euclid(TOTP_STEP_SECS)).unwrap_or(0);
    let key = hmac::Key::new(hmac::HMAC_SHA512, secret);
    let tag = hmac::sign(&key, &counter.to_be_bytes());
    let mac = tag.as_ref();

    // RFC 4226 dynamic truncation
    let offset = usize::from(mac[mac.len() - 1] & 0x0f);
    let binary = (u32::from(mac[offset] & 0x7f) << 24)
        | (u32::from(mac[offset + 1]) << 16)
        | (u32::from(mac[offset + 2]) << 8)
        | u32::from(mac[offset + 3]);

    let code = binary % 10u32.pow(TOTP_DIGITS);
    format!("{code:0width$}", width = TOTP_DIGITS as usize)
}

/// Derive the password for `principal` in the period starting at `boundary`
pub fn derive_password(seed: &SecretString, principal: &str, boundary: DateTime<Utc>) -> SecretString {
    let seed = seed.expose_secret().as_bytes();
    let otp = totp(seed, boundary.timestamp());

    let mut hasher = Sha512::new();
    hasher.update(otp.as_bytes());
    hasher.update(seed);
    hasher.update(principal.as_bytes());
    let digest = hasher.finalize();

    let mut password = URL_SAFE_NO_PAD.encode(digest);
    password.truncate(PASSWORD_LEN - 1);
    password.push(PASSWORD_SUFFIX);
    SecretString::new(password)
}

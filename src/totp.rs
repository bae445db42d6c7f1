//! Time-based one-time codes, as specified in RFC 6238 (HMAC-SHA1 variant).
//!
//! Secrets are exchanged as Base32 strings, the format used by
//! [Key URIs](https://github.com/google/google-authenticator/wiki/Key-Uri-Format),
//! e.g. `otpauth://totp/acme:alice?secret=JBSWY3DPEHPK3PXP&issuer=acme`.
//!
//! Verification tolerates one step of clock skew in either direction: a code is
//! accepted if it matches the code at `now`, `now - 30s` or `now + 30s`.

use hmac::{Hmac, Mac};
use log::{trace, warn};
use sha1::Sha1;
use subtle::{Choice, ConstantTimeEq};

type HmacSha1 = Hmac<Sha1>;

/// Period in seconds after which the counter for the TOTP token is incremented
pub const PERIOD_SECONDS: u64 = 30;
/// Tolerated clock skew between code generator and verifier
pub const DRIFT_SECONDS: u64 = 30;
/// Number of decimal digits in a code
pub const DIGITS: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Contains a one-time password
pub struct Otp(pub u32);

/// OTP codes are typically presented as left-zero-padded strings
impl core::fmt::Display for Otp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:0width$}", self.0, width = DIGITS as usize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret is empty")]
    Empty,
    #[error("secret is not valid base32: {0}")]
    Encoding(#[from] data_encoding::DecodeError),
    #[error("secret has an unusable key length")]
    KeyLength,
}

/// Decodes a Base32 secret. Case, whitespace and `=` padding are ignored.
pub fn decode_secret(base32_secret: &str) -> Result<Vec<u8>, SecretError> {
    let normalized: String = base32_secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(SecretError::Empty);
    }
    Ok(data_encoding::BASE32_NOPAD.decode(normalized.as_bytes())?)
}

/// The seam through which the decision engine checks submitted codes.
pub trait CodeVerifier {
    /// Returns true iff `code` is valid for the Base32 `secret` at `now`
    /// (seconds since the UNIX epoch). Must fail closed.
    fn verify(&self, secret: &str, code: &str, now: u64) -> bool;
}

impl<V: CodeVerifier + ?Sized> CodeVerifier for &V {
    fn verify(&self, secret: &str, code: &str, now: u64) -> bool {
        (**self).verify(secret, code, now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// TOTP parameters. The default is the policy of the door controller:
/// 30 second steps, 30 seconds of drift tolerance.
pub struct Totp {
    pub period_seconds: u64,
    pub drift_seconds: u64,
}

impl Default for Totp {
    fn default() -> Self {
        Self { period_seconds: PERIOD_SECONDS, drift_seconds: DRIFT_SECONDS }
    }
}

impl Totp {
    /// Calculates the code for a raw key at `timestamp` (seconds since UNIX epoch).
    pub fn generate(&self, key: &[u8], timestamp: u64) -> Result<Otp, SecretError> {
        let counter = timestamp / self.period_seconds;
        hotp(key, counter)
    }

    /// Like [`Totp::generate`], for a Base32 secret.
    pub fn generate_for(&self, base32_secret: &str, timestamp: u64) -> Result<Otp, SecretError> {
        self.generate(&decode_secret(base32_secret)?, timestamp)
    }

    /// The three instants at which a submitted code may have been generated.
    pub fn anchors(&self, now: u64) -> [u64; 3] {
        [
            now,
            now.saturating_sub(self.drift_seconds),
            now.saturating_add(self.drift_seconds),
        ]
    }
}

impl CodeVerifier for Totp {
    fn verify(&self, secret: &str, code: &str, now: u64) -> bool {
        if code.is_empty() {
            return false;
        }
        let key = match decode_secret(secret) {
            Ok(key) => key,
            Err(error) => {
                warn!("stored secret is unusable: {}", error);
                return false;
            }
        };

        let mut matched = Choice::from(0);
        for anchor in self.anchors(now) {
            match self.generate(&key, anchor) {
                Ok(expected) => {
                    trace!("checking anchor {}", anchor);
                    matched |= expected.to_string().as_bytes().ct_eq(code.as_bytes());
                }
                Err(error) => {
                    warn!("cannot compute code: {}", error);
                    return false;
                }
            }
        }
        matched.into()
    }
}

/// Verifies `code` against `secret` with the default policy.
pub fn verify(secret: &str, code: &str, now: u64) -> bool {
    Totp::default().verify(secret, code, now)
}

/// RFC 4226 HOTP with dynamic truncation.
fn hotp(key: &[u8], counter: u64) -> Result<Otp, SecretError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| SecretError::KeyLength)?;
    mac.update(&counter.to_be_bytes());
    let hmac = mac.finalize().into_bytes();

    let offset = (hmac[hmac.len() - 1] & 0xf) as usize;
    let binary = u32::from_be_bytes([
        hmac[offset],
        hmac[offset + 1],
        hmac[offset + 2],
        hmac[offset + 3],
    ]) & 0x7fff_ffff;

    Ok(Otp(binary % 10u32.pow(DIGITS)))
}

/// Provisioning URI for authenticator apps, in Key URI format.
pub fn key_uri(uid: &str, issuer: &str, base32_secret: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{uid}?secret={secret}&period={period}&digits={digits}&algorithm=SHA1&issuer={issuer}",
        issuer = urlencoding::encode(issuer),
        uid = urlencoding::encode(uid),
        secret = base32_secret,
        period = PERIOD_SECONDS,
        digits = DIGITS,
    )
}

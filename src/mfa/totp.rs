//! RFC 6238 TOTP over RFC 4226 HOTP, fixed to HMAC-SHA1, 6 digits and a
//! 30 second step, matching what authenticator apps implement.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;

pub const DIGITS: u32 = 6;
pub const PERIOD_SECONDS: i64 = 30;

const SECRET_BYTES: usize = 20;

/// Generate a fresh 160-bit shared secret.
///
/// # Errors
/// Returns an error if the OS random number generator fails.
pub fn generate_secret() -> Result<Vec<u8>> {
    let mut secret = vec![0u8; SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut secret)
        .context("Failed to generate TOTP secret")?;
    Ok(secret)
}

/// Base32 (RFC 4648, no padding) encoding used in provisioning URIs.
#[must_use]
pub fn encode_secret(secret: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, secret)
}

/// Decode a base32 secret as handed out by [`encode_secret`]. Accepts
/// lowercase input and ignores padding.
#[must_use]
pub fn decode_secret(encoded: &str) -> Option<Vec<u8>> {
    let cleaned = encoded.trim().trim_end_matches('=').to_ascii_uppercase();
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
}

/// One HOTP value (RFC 4226 dynamic truncation).
///
/// # Errors
/// Returns an error if the secret is rejected as an HMAC key.
pub fn hotp(secret: &[u8], counter: u64, digits: u32) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret)
        .map_err(|_| anyhow!("invalid HMAC key length"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[19] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(digits);

    Ok(format!("{code:0width$}", width = digits as usize))
}

fn step_at(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(PERIOD_SECONDS)
}

/// The code an authenticator app would show at `at`.
///
/// # Errors
/// Returns an error if the secret is rejected as an HMAC key.
pub fn totp_at(secret: &[u8], at: DateTime<Utc>) -> Result<String> {
    let counter = u64::try_from(step_at(at)).unwrap_or(0);
    hotp(secret, counter, DIGITS)
}

/// Check `code` against the step containing `at` plus `drift_steps` steps of
/// clock drift in both directions.
///
/// # Errors
/// Returns an error if the secret is rejected as an HMAC key.
pub fn verify_at(
    secret: &[u8],
    code: &str,
    at: DateTime<Utc>,
    drift_steps: i64,
) -> Result<bool> {
    let presented = code.trim();
    if presented.len() != DIGITS as usize || !presented.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let step = step_at(at);
    for delta in -drift_steps..=drift_steps {
        let Ok(counter) = u64::try_from(step + delta) else {
            continue;
        };
        if hotp(secret, counter, DIGITS)? == presented {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `otpauth://` URI consumed by authenticator apps when scanned as a QR
/// code. Issuer and account are percent-encoded; the secret is base32.
#[must_use]
pub fn provisioning_uri(issuer: &str, account: &str, secret_base32: &str) -> String {
    format!(
        "otpauth://totp/{issuer_enc}:{account_enc}?secret={secret_base32}&issuer={issuer_enc}&algorithm=SHA1&digits={DIGITS}&period={PERIOD_SECONDS}",
        issuer_enc = urlencoding::encode(issuer),
        account_enc = urlencoding::encode(account),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // RFC 4226 Appendix D secret.
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn hotp_matches_rfc4226_appendix_d() {
        let expected = [
            "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583",
            "399871", "520489",
        ];
        for (counter, code) in expected.iter().enumerate() {
            assert_eq!(
                hotp(RFC_SECRET, counter as u64, DIGITS).unwrap(),
                *code,
                "counter {counter}"
            );
        }
    }

    #[test]
    fn totp_matches_rfc6238_appendix_b() {
        // SHA-1 rows of the RFC 6238 test table, 8 digits.
        let rows = [
            (59, "94287082"),
            (1_111_111_109, "07081804"),
            (1_111_111_111, "14050471"),
            (1_234_567_890, "89005924"),
            (2_000_000_000, "69279037"),
            (20_000_000_000, "65353130"),
        ];
        for (timestamp, code) in rows {
            let at = Utc.timestamp_opt(timestamp, 0).unwrap();
            let counter = u64::try_from(at.timestamp().div_euclid(PERIOD_SECONDS)).unwrap();
            assert_eq!(hotp(RFC_SECRET, counter, 8).unwrap(), code, "t={timestamp}");
        }
    }

    #[test]
    fn six_digit_codes_keep_leading_zeros() {
        // The 8-digit RFC vector 07081804 truncates to 081804 at 6 digits.
        let at = Utc.timestamp_opt(1_111_111_109, 0).unwrap();
        assert_eq!(totp_at(RFC_SECRET, at).unwrap(), "081804");
    }

    #[test]
    fn secret_base32_round_trip() {
        let secret = generate_secret().unwrap();
        assert_eq!(secret.len(), 20);

        let encoded = encode_secret(&secret);
        assert!(!encoded.contains('='));
        assert_eq!(decode_secret(&encoded).unwrap(), secret);
        assert_eq!(decode_secret(&encoded.to_lowercase()).unwrap(), secret);
    }

    #[test]
    fn decode_rejects_invalid_characters() {
        assert!(decode_secret("not base32 !!").is_none());
    }

    #[test]
    fn verify_accepts_one_step_of_drift() {
        let secret = decode_secret("JBSWY3DPEHPK3PXP").unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let code = totp_at(&secret, at).unwrap();

        assert!(verify_at(&secret, &code, at, 1).unwrap());
        assert!(verify_at(&secret, &code, at + chrono::Duration::seconds(30), 1).unwrap());
        assert!(verify_at(&secret, &code, at - chrono::Duration::seconds(30), 1).unwrap());
    }

    #[test]
    fn verify_rejects_two_steps_of_drift() {
        let secret = decode_secret("JBSWY3DPEHPK3PXP").unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let code = totp_at(&secret, at).unwrap();

        assert!(!verify_at(&secret, &code, at + chrono::Duration::seconds(90), 1).unwrap());
        assert!(!verify_at(&secret, &code, at - chrono::Duration::seconds(90), 1).unwrap());
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        let secret = decode_secret("JBSWY3DPEHPK3PXP").unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert!(!verify_at(&secret, "12345", at, 1).unwrap());
        assert!(!verify_at(&secret, "1234567", at, 1).unwrap());
        assert!(!verify_at(&secret, "12345a", at, 1).unwrap());
        assert!(!verify_at(&secret, "", at, 1).unwrap());
    }

    #[test]
    fn provisioning_uri_encodes_label_and_params() {
        let uri = provisioning_uri("Example App", "alice@example.com", "JBSWY3DPEHPK3PXP");
        assert!(uri.starts_with("otpauth://totp/Example%20App:alice%40example.com?"));
        assert!(uri.contains("secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.contains("issuer=Example%20App"));
        assert!(uri.contains("algorithm=SHA1"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }
}

//! Single-use recovery codes.
//!
//! Codes are eight digits, shown to the user once as `NNNN-NNNN`. Only
//! salted SHA-256 hashes are stored (`hex(salt)$hex(sha256(salt || code))`),
//! so a keystore leak does not expose usable codes.

use anyhow::{Context, Result};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const RECOVERY_CODE_COUNT: usize = 10;

const CODE_DIGITS: usize = 8;
const GROUP_SIZE: usize = 4;
const SALT_BYTES: usize = 16;

/// A freshly generated batch: formatted plaintext codes for one-time
/// display and the hashes that get persisted.
#[derive(Debug)]
pub struct RecoveryCodeSet {
    pub codes: Vec<String>,
    pub hashes: Vec<String>,
}

impl RecoveryCodeSet {
    /// Generate a full batch of codes with per-code salts.
    ///
    /// # Errors
    /// Returns an error if the OS random number generator fails.
    pub fn generate() -> Result<Self> {
        let mut codes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        let mut hashes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        for _ in 0..RECOVERY_CODE_COUNT {
            let digits = generate_digits()?;
            hashes.push(hash_code(&digits)?);
            codes.push(format_code(&digits));
        }
        Ok(Self { codes, hashes })
    }
}

fn generate_digits() -> Result<String> {
    let mut bytes = [0u8; CODE_DIGITS];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("Failed to generate recovery code")?;
    Ok(bytes.iter().map(|b| char::from(b'0' + b % 10)).collect())
}

/// Strip formatting and validate shape: exactly eight digits once dashes
/// and whitespace are removed. Returns `None` for anything else.
#[must_use]
pub fn normalize_code(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if cleaned.len() == CODE_DIGITS && cleaned.bytes().all(|b| b.is_ascii_digit()) {
        Some(cleaned)
    } else {
        None
    }
}

fn format_code(digits: &str) -> String {
    let (head, tail) = digits.split_at(GROUP_SIZE);
    format!("{head}-{tail}")
}

fn hash_with_salt(salt: &[u8], digits: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(digits.as_bytes());
    format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
}

/// Hash a normalized code with a fresh random salt.
///
/// # Errors
/// Returns an error if the OS random number generator fails.
pub fn hash_code(digits: &str) -> Result<String> {
    let mut salt = [0u8; SALT_BYTES];
    OsRng
        .try_fill_bytes(&mut salt)
        .context("Failed to generate recovery code salt")?;
    Ok(hash_with_salt(&salt, digits))
}

/// Check user input against one stored hash. Malformed input or a
/// malformed stored hash is simply no match.
#[must_use]
pub fn verify_code(input: &str, stored: &str) -> bool {
    let Some(digits) = normalize_code(input) else {
        return false;
    };
    let Some((salt_hex, _)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    hash_with_salt(&salt, &digits) == stored
}

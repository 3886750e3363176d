//! # Gardisto (Account Security & Trust Layer)
//!
//! `gardisto` is the account security and trust layer that sits between an
//! application and its backing stores. It records every security-relevant
//! event, throttles abusive clients, manages TOTP-based second factors, and
//! keeps service credentials fresh.
//!
//! ## Storage Model
//!
//! Operational state (audit events, rate-limit counters, credential records)
//! lives in an external table-oriented HTTP store behind the [`store::TableStore`]
//! trait. Secrets (TOTP seeds, recovery code hashes, rotation state, session
//! records) live in a secure key-value store behind [`keystore::SecureStore`].
//! Secret material never touches the table store.
//!
//! ## Failure Posture
//!
//! - **Fail open:** [`ratelimit::RateLimiter`] and [`audit::AuditLog`] degrade
//!   when the table store is unreachable. A user is never locked out of their
//!   account because the bookkeeping backend is down.
//! - **Fail closed:** [`mfa::MfaEngine`] and [`rotation::CredentialRotator`]
//!   abort on keystore or backend errors. A half-applied secret mutation is
//!   worse than a retried one.
//!
//! ## Transport Trust
//!
//! Outbound HTTPS connections are guarded by [`pinning::CertificatePinner`]:
//! the server certificate must match a pinned SHA-256 fingerprint or the
//! connection is refused before any request is sent. There is no silent
//! downgrade path; the only escape hatch is an explicit development-only flag.

pub mod audit;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod keystore;
pub mod mfa;
pub mod monitor;
pub mod pinning;
pub mod ratelimit;
pub mod rotation;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

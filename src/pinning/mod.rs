//! TLS peer-certificate pinning.
//!
//! [`CertificatePinner`] holds the accepted SHA-256 fingerprints for one
//! hostname. Several fingerprints may be pinned at once so a server
//! certificate can be rotated without downtime: pin the new certificate
//! first, rotate the server, then drop the old pin.
//!
//! Validation runs synchronously inside the TLS handshake (see
//! [`verifier`]), so rejections are handed to an async reporter task over
//! a channel instead of being audited inline.

use crate::audit::{AuditAction, AuditLog, EventMetadata};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub mod verifier;

pub use verifier::{pinned_client, PinnedServerVerifier};

const TRANSPORT_RESOURCE: &str = "transport";

/// Outcome of checking one peer certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinCheck {
    Accepted,
    Rejected { fingerprint: String, reason: String },
}

/// A rejected peer certificate, reported out of the handshake path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinningViolation {
    pub hostname: String,
    pub fingerprint: String,
    pub reason: String,
}

/// SHA-256 fingerprint of a DER-encoded certificate, lowercase hex.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Canonical form for pinned fingerprints: lowercase hex with the
/// colon separators of `openssl x509 -fingerprint` output removed.
#[must_use]
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_lowercase()
}

#[derive(Clone, Debug)]
pub struct CertificatePinner {
    hostname: String,
    pins: Arc<RwLock<HashSet<String>>>,
    allow_any: bool,
    violations: Option<mpsc::UnboundedSender<PinningViolation>>,
}

impl CertificatePinner {
    pub fn new<I, S>(hostname: &str, fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pins = fingerprints
            .into_iter()
            .map(|raw| normalize_fingerprint(raw.as_ref()))
            .collect();
        Self {
            hostname: hostname.to_lowercase(),
            pins: Arc::new(RwLock::new(pins)),
            allow_any: false,
            violations: None,
        }
    }

    /// Development escape hatch: accept every certificate. Never the
    /// default; construction and every acceptance are logged loudly.
    #[must_use]
    pub fn dangerously_allow_any(hostname: &str) -> Self {
        error!("Certificate pinning is DISABLED for {hostname}; all certificates will be accepted");
        Self {
            hostname: hostname.to_lowercase(),
            pins: Arc::new(RwLock::new(HashSet::new())),
            allow_any: true,
            violations: None,
        }
    }

    /// Send rejections to `sender` for asynchronous audit reporting.
    #[must_use]
    pub fn with_violation_reporter(
        mut self,
        sender: mpsc::UnboundedSender<PinningViolation>,
    ) -> Self {
        self.violations = Some(sender);
        self
    }

    /// Pin an additional fingerprint, e.g. ahead of a server certificate
    /// rotation.
    pub fn add_fingerprint(&self, raw: &str) {
        let normalized = normalize_fingerprint(raw);
        let mut pins = match self.pins.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pins.insert(normalized);
    }

    /// Drop a fingerprint once the certificate it pins is retired.
    pub fn remove_fingerprint(&self, raw: &str) {
        let normalized = normalize_fingerprint(raw);
        let mut pins = match self.pins.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pins.remove(&normalized);
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Check a DER-encoded peer certificate presented for `hostname`.
    ///
    /// Accepts when the hostname matches the pinned hostname and the
    /// certificate's SHA-256 fingerprint is pinned. Every rejection is
    /// pushed to the violation reporter when one is wired.
    #[must_use]
    pub fn validate(&self, der: &[u8], hostname: &str) -> PinCheck {
        let fingerprint = fingerprint(der);

        if self.allow_any {
            warn!("Accepting unpinned certificate {fingerprint} for {hostname}: pinning disabled");
            return PinCheck::Accepted;
        }

        if !hostname.eq_ignore_ascii_case(&self.hostname) {
            return self.reject(hostname, fingerprint, "hostname mismatch");
        }

        let pinned = self
            .pins
            .read()
            .map(|pins| pins.contains(&fingerprint))
            // Poisoned pin set: no way to tell what is pinned, so refuse.
            .unwrap_or(false);
        if pinned {
            PinCheck::Accepted
        } else {
            self.reject(hostname, fingerprint, "fingerprint not pinned")
        }
    }

    fn reject(&self, hostname: &str, fingerprint: String, reason: &str) -> PinCheck {
        error!("Rejected certificate {fingerprint} for {hostname}: {reason}");
        if let Some(sender) = &self.violations {
            let violation = PinningViolation {
                hostname: hostname.to_string(),
                fingerprint: fingerprint.clone(),
                reason: reason.to_string(),
            };
            // The reporter shutting down must not break the handshake path.
            let _ = sender.send(violation);
        }
        PinCheck::Rejected {
            fingerprint,
            reason: reason.to_string(),
        }
    }
}

/// Drain pinning violations into the audit log until the channel closes.
#[must_use]
pub fn spawn_reporter(
    audit: AuditLog,
    mut violations: mpsc::UnboundedReceiver<PinningViolation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(violation) = violations.recv().await {
            let event = audit
                .event(
                    AuditAction::CertificatePinningFailure,
                    TRANSPORT_RESOURCE,
                    false,
                )
                .with_target(&violation.hostname)
                .with_metadata(EventMetadata {
                    fingerprint: Some(violation.fingerprint),
                    reason: Some(violation.reason),
                    ..EventMetadata::default()
                });
            audit.record(event).await;
        }
    })
}

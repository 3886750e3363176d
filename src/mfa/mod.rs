//! TOTP second factor and recovery codes.
//!
//! All MFA state for one owner lives in a single secure-store document
//! (`mfa/{owner}`): the shared secret, the enabled flag, and the recovery
//! code hashes. Mutations replace the whole document in one write, so there
//! is no partially-enrolled state to clean up.
//!
//! Unlike the rate limiter this component is fail-closed: keystore errors
//! abort the operation. Verification failures are ordinary `Rejected`
//! results, not errors.

pub mod recovery;
pub mod totp;

use crate::audit::{AuditAction, AuditLog, EventMetadata};
use crate::clock::Clock;
use crate::keystore::SecureStore;
use anyhow::{Context, Result, bail};
use base64ct::{Base64, Encoding};
use recovery::RecoveryCodeSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MFA_RESOURCE: &str = "mfa";
const KEY_PREFIX: &str = "mfa";

/// Accepted clock drift, in 30 second steps, on either side of now.
const DRIFT_STEPS: i64 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MfaDocument {
    owner_id: String,
    secret_b64: String,
    enabled: bool,
    recovery_hashes: Vec<String>,
}

/// Handed back from [`MfaEngine::setup`]; the only time secret material is
/// shown in the clear.
#[derive(Debug)]
pub struct MfaEnrollment {
    pub secret_base32: String,
    pub provisioning_uri: String,
    pub recovery_codes: Vec<String>,
}

/// Outcome of a code check. A wrong code is a result, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfaCheck {
    Accepted,
    Rejected,
}

#[derive(Clone)]
pub struct MfaEngine {
    keystore: Arc<dyn SecureStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    issuer: String,
}

impl MfaEngine {
    pub fn new(
        keystore: Arc<dyn SecureStore>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            keystore,
            audit,
            clock,
            issuer: issuer.into(),
        }
    }

    /// Begin enrollment: generate a secret and recovery codes, persist them
    /// disabled, and hand the material back for one-time display.
    ///
    /// # Errors
    /// Returns an error if MFA is already enabled for `owner` or the
    /// keystore write fails.
    pub async fn setup(&self, owner: &str) -> Result<MfaEnrollment> {
        if let Some(existing) = self.load(owner).await? {
            if existing.enabled {
                bail!("MFA is already enabled for {owner}");
            }
        }

        let secret = totp::generate_secret()?;
        let codes = RecoveryCodeSet::generate()?;
        let document = MfaDocument {
            owner_id: owner.to_string(),
            secret_b64: Base64::encode_string(&secret),
            enabled: false,
            recovery_hashes: codes.hashes,
        };
        self.persist(&document).await?;

        let event = self
            .audit
            .event(AuditAction::MfaSetupStarted, MFA_RESOURCE, true)
            .with_actor(owner);
        self.audit.record(event).await;

        let secret_base32 = totp::encode_secret(&secret);
        let provisioning_uri = totp::provisioning_uri(&self.issuer, owner, &secret_base32);
        Ok(MfaEnrollment {
            secret_base32,
            provisioning_uri,
            recovery_codes: codes.codes,
        })
    }

    /// Confirm enrollment with a first code from the authenticator app and
    /// flip the factor on.
    ///
    /// # Errors
    /// Returns an error if setup has not been run for `owner` or the
    /// keystore fails.
    pub async fn enable(&self, owner: &str, code: &str) -> Result<MfaCheck> {
        let Some(mut document) = self.load(owner).await? else {
            bail!("MFA setup has not been started for {owner}");
        };

        let secret = decode_secret_field(&document.secret_b64)?;
        if !totp::verify_at(&secret, code, self.clock.now(), DRIFT_STEPS)? {
            return Ok(MfaCheck::Rejected);
        }

        if !document.enabled {
            document.enabled = true;
            self.persist(&document).await?;

            let event = self
                .audit
                .event(AuditAction::MfaEnabled, MFA_RESOURCE, true)
                .with_actor(owner);
            self.audit.record(event).await;
        }
        Ok(MfaCheck::Accepted)
    }

    /// Check a TOTP code for an enabled factor. Owners without an enabled
    /// factor are rejected rather than revealing whether one exists.
    ///
    /// # Errors
    /// Returns an error if the keystore fails.
    pub async fn verify(&self, owner: &str, code: &str) -> Result<MfaCheck> {
        let Some(document) = self.load(owner).await? else {
            return Ok(MfaCheck::Rejected);
        };
        if !document.enabled {
            return Ok(MfaCheck::Rejected);
        }

        let secret = decode_secret_field(&document.secret_b64)?;
        if totp::verify_at(&secret, code, self.clock.now(), DRIFT_STEPS)? {
            Ok(MfaCheck::Accepted)
        } else {
            Ok(MfaCheck::Rejected)
        }
    }

    /// Check a recovery code and consume it on success. A consumed code can
    /// never be used again.
    ///
    /// # Errors
    /// Returns an error if the keystore fails.
    pub async fn verify_recovery_code(&self, owner: &str, code: &str) -> Result<MfaCheck> {
        let Some(mut document) = self.load(owner).await? else {
            return Ok(MfaCheck::Rejected);
        };
        if !document.enabled {
            return Ok(MfaCheck::Rejected);
        }

        let Some(index) = document
            .recovery_hashes
            .iter()
            .position(|hash| recovery::verify_code(code, hash))
        else {
            return Ok(MfaCheck::Rejected);
        };

        document.recovery_hashes.remove(index);
        self.persist(&document).await?;

        let remaining = document.recovery_hashes.len() as u64;
        let event = self
            .audit
            .event(AuditAction::MfaRecoveryCodeUsed, MFA_RESOURCE, true)
            .with_actor(owner)
            .with_metadata(EventMetadata {
                count: Some(remaining),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        Ok(MfaCheck::Accepted)
    }

    /// Replace all recovery codes with a fresh batch, invalidating any
    /// unused ones.
    ///
    /// # Errors
    /// Returns an error if MFA is not configured for `owner` or the
    /// keystore fails.
    pub async fn regenerate_recovery_codes(&self, owner: &str) -> Result<Vec<String>> {
        let Some(mut document) = self.load(owner).await? else {
            bail!("MFA is not configured for {owner}");
        };

        let codes = RecoveryCodeSet::generate()?;
        document.recovery_hashes = codes.hashes;
        self.persist(&document).await?;

        let event = self
            .audit
            .event(AuditAction::MfaRecoveryCodesRegenerated, MFA_RESOURCE, true)
            .with_actor(owner)
            .with_metadata(EventMetadata {
                count: Some(recovery::RECOVERY_CODE_COUNT as u64),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        Ok(codes.codes)
    }

    /// Remove the factor and all recovery material.
    ///
    /// # Errors
    /// Returns an error if the keystore fails.
    pub async fn disable(&self, owner: &str) -> Result<()> {
        if self.load(owner).await?.is_none() {
            return Ok(());
        }

        self.keystore
            .delete(&owner_key(owner))
            .await
            .context("Failed to delete MFA document")?;

        let event = self
            .audit
            .event(AuditAction::MfaDisabled, MFA_RESOURCE, true)
            .with_actor(owner);
        self.audit.record(event).await;
        Ok(())
    }

    /// Whether logins for `owner` must present a second factor.
    ///
    /// # Errors
    /// Returns an error if the keystore fails.
    pub async fn is_enabled(&self, owner: &str) -> Result<bool> {
        Ok(self
            .load(owner)
            .await?
            .is_some_and(|document| document.enabled))
    }

    async fn load(&self, owner: &str) -> Result<Option<MfaDocument>> {
        let Some(value) = self
            .keystore
            .read(&owner_key(owner))
            .await
            .context("Failed to read MFA document")?
        else {
            return Ok(None);
        };
        let document =
            serde_json::from_value(value).context("Malformed MFA document in keystore")?;
        Ok(Some(document))
    }

    async fn persist(&self, document: &MfaDocument) -> Result<()> {
        let value = serde_json::to_value(document).context("Failed to serialize MFA document")?;
        self.keystore
            .write(&owner_key(&document.owner_id), value)
            .await
            .context("Failed to write MFA document")
    }
}

fn owner_key(owner: &str) -> String {
    format!("{KEY_PREFIX}/{owner}")
}

fn decode_secret_field(secret_b64: &str) -> Result<Vec<u8>> {
    Base64::decode_vec(secret_b64).map_err(|_| anyhow::anyhow!("Malformed TOTP secret in keystore"))
}

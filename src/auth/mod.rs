//! Login orchestration: rate limiting, credential checks, MFA, sessions.
//!
//! [`LoginFlow`] is the front door. It gates every attempt through the
//! rate limiter (identifier scope first, then source IP), only then calls
//! the external [`Authenticator`], feeds the outcome back into the
//! limiter, and writes the attempt to the audit trail. Accounts with MFA
//! enabled get a [`LoginOutcome::MfaRequired`] intermission; the host
//! holds the principal and calls [`LoginFlow::complete_mfa`] with the
//! second factor.

pub mod session;

pub use session::{LogoutReason, Session, SessionRegistry};

use crate::audit::{AuditAction, AuditEvent, AuditLog, EventMetadata};
use crate::config::SecurityConfig;
use crate::mfa::{MfaCheck, MfaEngine};
use crate::ratelimit::{LoginGate, RateLimiter, Scope};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const AUTH_RESOURCE: &str = "auth";

/// Authenticated account as reported by the credential backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub roles: Vec<String>,
}

/// Credential verification collaborator. Implementations sit in front of
/// whatever holds the actual password or key material.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` means the credentials did not match; errors mean the
    /// backend could not be consulted at all.
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Option<Principal>>;
}

/// Request context carried into audit events.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub device_fingerprint: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoginOutcome {
    Locked {
        until: DateTime<Utc>,
        reason: String,
    },
    InvalidCredentials {
        remaining_attempts: u32,
    },
    /// Credentials matched but the account requires a second factor. The
    /// host stashes `pending` and passes it back to
    /// [`LoginFlow::complete_mfa`].
    MfaRequired {
        pending: Principal,
    },
    Success {
        principal: Principal,
    },
}

/// Normalize an identifier for lookups and rate-limit keys.
#[must_use]
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Format check on already-normalized input. Accepts usernames and
/// email-shaped identifiers, 3 to 64 characters.
#[must_use]
pub fn valid_identifier(normalized: &str) -> bool {
    Regex::new(r"^[a-z0-9][a-z0-9._@+-]{2,63}$").is_ok_and(|regex| regex.is_match(normalized))
}

#[derive(Clone)]
pub struct LoginFlow {
    authenticator: Arc<dyn Authenticator>,
    limiter: RateLimiter,
    mfa: MfaEngine,
    audit: AuditLog,
    config: SecurityConfig,
}

impl LoginFlow {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        limiter: RateLimiter,
        mfa: MfaEngine,
        audit: AuditLog,
        config: SecurityConfig,
    ) -> Self {
        Self {
            authenticator,
            limiter,
            mfa,
            audit,
            config,
        }
    }

    /// First phase of a login attempt.
    ///
    /// Locked identifiers and IPs are refused before the authenticator is
    /// consulted, so lockouts cannot be used as a password oracle.
    ///
    /// # Errors
    /// Returns an error if the authenticator backend or the MFA keystore
    /// cannot be reached. Rate limiter outages do not error; the limiter
    /// fails open by design.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &str,
        client: &ClientInfo,
    ) -> Result<LoginOutcome> {
        let identifier = normalize_identifier(identifier);
        if !valid_identifier(&identifier) {
            return Ok(self.register_malformed(&identifier, client).await);
        }

        if let Some(locked) = self.gate(&identifier, client).await {
            return Ok(locked);
        }

        let principal = self
            .authenticator
            .authenticate(&identifier, secret)
            .await?;
        let Some(principal) = principal else {
            return Ok(self
                .register_failure(&identifier, client, "invalid credentials")
                .await);
        };

        // Keystore outage here refuses the login rather than skipping the
        // second factor.
        if self.mfa.is_enabled(&identifier).await? {
            let event = self.client_event(AuditAction::MfaChallenge, true, &identifier, client);
            self.audit.record(event).await;
            return Ok(LoginOutcome::MfaRequired { pending: principal });
        }

        Ok(self.register_success(&identifier, client, principal, None).await)
    }

    /// Second phase for MFA-enabled accounts: accepts a TOTP code or a
    /// recovery code. `principal` is the one returned alongside
    /// [`LoginOutcome::MfaRequired`]; the host keeps it between phases.
    ///
    /// Failures count toward the same lockout ladder as bad passwords,
    /// and the refusal does not say which factor was wrong.
    ///
    /// # Errors
    /// Returns an error if the MFA keystore cannot be reached.
    pub async fn complete_mfa(
        &self,
        principal: &Principal,
        code: &str,
        client: &ClientInfo,
    ) -> Result<LoginOutcome> {
        let identifier = normalize_identifier(&principal.id);

        if let Some(locked) = self.gate(&identifier, client).await {
            return Ok(locked);
        }

        if self.mfa.verify(&identifier, code).await? == MfaCheck::Accepted {
            return Ok(self
                .register_success(&identifier, client, principal.clone(), Some("totp"))
                .await);
        }
        if self.mfa.verify_recovery_code(&identifier, code).await? == MfaCheck::Accepted {
            return Ok(self
                .register_success(&identifier, client, principal.clone(), Some("recovery"))
                .await);
        }

        Ok(self
            .register_failure(&identifier, client, "invalid code")
            .await)
    }

    /// Lock checks shared by both phases. A denial is itself an audited
    /// failed attempt, but does not increment the failure counter.
    async fn gate(&self, identifier: &str, client: &ClientInfo) -> Option<LoginOutcome> {
        if let LoginGate::Locked { until, reason } =
            self.limiter.check_login(identifier, Scope::Identifier).await
        {
            self.audit_denial(identifier, client, until, &reason).await;
            return Some(LoginOutcome::Locked { until, reason });
        }

        if let Some(ip) = &client.ip_address {
            if let LoginGate::Locked { until, reason } =
                self.limiter.check_login(ip, Scope::Ip).await
            {
                self.audit_denial(identifier, client, until, &reason).await;
                return Some(LoginOutcome::Locked { until, reason });
            }
        }
        None
    }

    async fn audit_denial(
        &self,
        identifier: &str,
        client: &ClientInfo,
        until: DateTime<Utc>,
        reason: &str,
    ) {
        let event = self
            .client_event(AuditAction::LoginFailed, false, identifier, client)
            .with_metadata(EventMetadata {
                reason: Some(reason.to_string()),
                locked_until: Some(until),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
    }

    /// Identifiers that fail the format check never reach the
    /// authenticator; the attempt still counts against the source IP so
    /// probing with garbage identifiers is not free.
    async fn register_malformed(&self, identifier: &str, client: &ClientInfo) -> LoginOutcome {
        let snapshot = match &client.ip_address {
            Some(ip) => Some(self.limiter.record_failure(ip, Scope::Ip).await),
            None => None,
        };

        let remaining = snapshot.as_ref().map_or(self.config.max_failed_attempts(), |s| {
            self.config
                .max_failed_attempts()
                .saturating_sub(s.failed_attempts)
        });
        let event = self
            .client_event(AuditAction::LoginFailed, false, identifier, client)
            .with_metadata(EventMetadata {
                reason: Some("malformed identifier".to_string()),
                remaining: Some(remaining),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;

        match snapshot.and_then(|s| s.locked_until) {
            Some(until) => LoginOutcome::Locked {
                until,
                reason: format!("too many failed attempts; locked until {until}"),
            },
            None => LoginOutcome::InvalidCredentials {
                remaining_attempts: remaining,
            },
        }
    }

    async fn register_failure(
        &self,
        identifier: &str,
        client: &ClientInfo,
        reason: &str,
    ) -> LoginOutcome {
        let snapshot = self
            .limiter
            .record_failure(identifier, Scope::Identifier)
            .await;
        if let Some(ip) = &client.ip_address {
            self.limiter.record_failure(ip, Scope::Ip).await;
        }

        let remaining = self
            .config
            .max_failed_attempts()
            .saturating_sub(snapshot.failed_attempts);
        let event = self
            .client_event(AuditAction::LoginFailed, false, identifier, client)
            .with_metadata(EventMetadata {
                reason: Some(reason.to_string()),
                remaining: Some(remaining),
                locked_until: snapshot.locked_until,
                ..EventMetadata::default()
            });
        self.audit.record(event).await;

        match snapshot.locked_until {
            Some(until) => LoginOutcome::Locked {
                until,
                reason: format!("too many failed attempts; locked until {until}"),
            },
            None => LoginOutcome::InvalidCredentials {
                remaining_attempts: remaining,
            },
        }
    }

    async fn register_success(
        &self,
        identifier: &str,
        client: &ClientInfo,
        principal: Principal,
        factor: Option<&str>,
    ) -> LoginOutcome {
        self.limiter
            .record_success(identifier, Scope::Identifier)
            .await;
        if let Some(ip) = &client.ip_address {
            self.limiter.record_success(ip, Scope::Ip).await;
        }

        let event = self
            .client_event(AuditAction::LoginSuccess, true, identifier, client)
            .with_metadata(EventMetadata {
                code_ref: factor.map(str::to_string),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;

        LoginOutcome::Success { principal }
    }

    fn client_event(
        &self,
        action: AuditAction,
        success: bool,
        identifier: &str,
        client: &ClientInfo,
    ) -> AuditEvent {
        let mut event = self
            .audit
            .event(action, AUTH_RESOURCE, success)
            .with_actor(identifier);
        if let Some(ip) = &client.ip_address {
            event = event.with_ip(ip);
        }
        if let Some(fingerprint) = &client.device_fingerprint {
            event = event.with_device(fingerprint);
        }
        if let Some(user_agent) = &client.user_agent {
            event = event.with_user_agent(user_agent);
        }
        event
    }
}

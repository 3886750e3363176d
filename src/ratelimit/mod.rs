//! Login throttling and API rate limiting.
//!
//! Failed login attempts are counted per identifier and per source IP in
//! separate records; crossing the configured threshold inside the attempt
//! window locks that scope until the lockout expires. API usage is tracked
//! in fixed windows per caller.
//!
//! Every gate here is fail-open: if the backing store cannot be reached the
//! request is allowed and a warning is logged. A store outage must never
//! lock users out. The cost is that attempts during an outage go uncounted.

use crate::audit::{AuditAction, AuditLog, EventMetadata};
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::store::{Filter, StoreError, TableStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const RATE_LIMIT_TABLE: &str = "rate_limits";
pub const API_WINDOW_TABLE: &str = "api_windows";

const AUTH_RESOURCE: &str = "auth";
const API_RESOURCE: &str = "api";

/// What a failure is counted against. An attempt is counted in both scopes;
/// each scope locks independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Identifier,
    Ip,
}

impl Scope {
    #[must_use]
    pub const fn is_ip_based(self) -> bool {
        matches!(self, Self::Ip)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Ip => "ip",
        }
    }
}

/// Persisted failure counter for one scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub identifier: String,
    pub is_ip_based: bool,
    pub failed_attempts: u32,
    // Serialized without skip attributes: updates are field merges, so a
    // cleared Option must overwrite the stored value with null.
    pub last_failed_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Persisted fixed-window API counter for one caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiWindowRecord {
    pub identifier: String,
    pub request_count: u32,
    pub window_started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginGate {
    Allowed { remaining_attempts: u32 },
    Locked { until: DateTime<Utc>, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiGate {
    Allowed { remaining: u32 },
    Limited { window_resets_at: DateTime<Utc> },
}

/// Result of counting one failure: the attempt count after the write and
/// the lock it triggered, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureSnapshot {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TableStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    config: SecurityConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn TableStore>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            config,
        }
    }

    /// Gate a login attempt before credentials are checked.
    pub async fn check_login(&self, identifier: &str, scope: Scope) -> LoginGate {
        let max = self.config.max_failed_attempts();
        let allowed_fresh = LoginGate::Allowed {
            remaining_attempts: max,
        };

        let record = match self.load_limit(identifier, scope).await {
            Ok(found) => found,
            Err(err) => {
                warn!("Failed to read rate limit for {identifier}: {err}");
                return allowed_fresh;
            }
        };
        let Some((_, record)) = record else {
            return allowed_fresh;
        };

        let now = self.clock.now();
        if let Some(until) = record.locked_until {
            if until > now {
                return LoginGate::Locked {
                    until,
                    reason: format!("too many failed attempts; locked until {until}"),
                };
            }
            // Expired lock: the scope starts over.
            return allowed_fresh;
        }

        let Some(last_failed) = record.last_failed_at else {
            return allowed_fresh;
        };
        if now - last_failed > self.config.attempt_window() {
            return allowed_fresh;
        }

        if record.failed_attempts >= max {
            // Threshold reached but the locking write was lost. Deny from
            // what the counter says; the lock window starts at the last
            // failure.
            let until = last_failed + self.config.lockout();
            if until > now {
                return LoginGate::Locked {
                    until,
                    reason: format!("too many failed attempts; locked until {until}"),
                };
            }
            return allowed_fresh;
        }

        LoginGate::Allowed {
            remaining_attempts: max - record.failed_attempts,
        }
    }

    /// Count one failed attempt against `scope`. Crossing the threshold
    /// locks the scope and audits `ACCOUNT_LOCKED`.
    pub async fn record_failure(&self, identifier: &str, scope: Scope) -> FailureSnapshot {
        let now = self.clock.now();
        let max = self.config.max_failed_attempts();

        let loaded = match self.load_limit(identifier, scope).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!("Failed to read rate limit for {identifier}: {err}");
                return FailureSnapshot {
                    failed_attempts: 1,
                    locked_until: None,
                };
            }
        };

        let (record_id, prior_attempts) = match loaded {
            None => (None, 0),
            Some((id, record)) => {
                let stale = match (record.locked_until, record.last_failed_at) {
                    // An expired lock resets the counter.
                    (Some(until), _) if until <= now => true,
                    (None, Some(last)) => now - last > self.config.attempt_window(),
                    (None, None) => true,
                    _ => false,
                };
                (Some(id), if stale { 0 } else { record.failed_attempts })
            }
        };

        let failed_attempts = prior_attempts.saturating_add(1);
        let locked_until = (failed_attempts >= max).then(|| now + self.config.lockout());
        let record = RateLimitRecord {
            identifier: identifier.to_string(),
            is_ip_based: scope.is_ip_based(),
            failed_attempts,
            last_failed_at: Some(now),
            locked_until,
        };

        if let Err(err) = self.persist_limit(record_id.as_deref(), &record).await {
            warn!("Failed to persist rate limit for {identifier}: {err}");
        }

        if let Some(until) = locked_until {
            let event = self
                .audit
                .event(AuditAction::AccountLocked, AUTH_RESOURCE, true)
                .with_actor(identifier)
                .with_metadata(EventMetadata {
                    scope: Some(scope.as_str().to_string()),
                    count: Some(u64::from(failed_attempts)),
                    locked_until: Some(until),
                    ..EventMetadata::default()
                });
            self.audit.record(event).await;
        }

        FailureSnapshot {
            failed_attempts,
            locked_until,
        }
    }

    /// Reset the failure counter after a successful login.
    pub async fn record_success(&self, identifier: &str, scope: Scope) {
        match self.load_limit(identifier, scope).await {
            Ok(Some((id, record))) => {
                if record.failed_attempts == 0
                    && record.last_failed_at.is_none()
                    && record.locked_until.is_none()
                {
                    return;
                }
                let reset = RateLimitRecord {
                    identifier: identifier.to_string(),
                    is_ip_based: scope.is_ip_based(),
                    failed_attempts: 0,
                    last_failed_at: None,
                    locked_until: None,
                };
                if let Err(err) = self.persist_limit(Some(&id), &reset).await {
                    warn!("Failed to reset rate limit for {identifier}: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to read rate limit for {identifier}: {err}");
            }
        }
    }

    /// Administrative reset of a locked scope. Unlike the gates this
    /// propagates store errors: an admin needs to know the unlock did not
    /// take effect.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn unlock(
        &self,
        identifier: &str,
        scope: Scope,
        admin: &str,
    ) -> Result<(), StoreError> {
        if let Some((id, _)) = self.load_limit(identifier, scope).await? {
            let reset = RateLimitRecord {
                identifier: identifier.to_string(),
                is_ip_based: scope.is_ip_based(),
                failed_attempts: 0,
                last_failed_at: None,
                locked_until: None,
            };
            self.persist_limit(Some(&id), &reset).await?;
        }

        let event = self
            .audit
            .event(AuditAction::AccountUnlocked, AUTH_RESOURCE, true)
            .with_actor(admin)
            .with_target(identifier)
            .with_metadata(EventMetadata {
                scope: Some(scope.as_str().to_string()),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        Ok(())
    }

    /// Gate an API request against the caller's fixed window.
    pub async fn check_api_rate(&self, identifier: &str) -> ApiGate {
        let max = self.config.api_max_requests();
        let allowed_fresh = ApiGate::Allowed { remaining: max };

        let window = match self.load_window(identifier).await {
            Ok(found) => found,
            Err(err) => {
                warn!("Failed to read API window for {identifier}: {err}");
                return allowed_fresh;
            }
        };
        let Some((_, window)) = window else {
            return allowed_fresh;
        };

        let now = self.clock.now();
        let resets_at = window.window_started_at + self.config.api_window();
        if now >= resets_at {
            return allowed_fresh;
        }

        if window.request_count >= max {
            let window_seconds = u64::try_from(self.config.api_window().num_seconds()).unwrap_or(0);
            let event = self
                .audit
                .event(AuditAction::ApiRateLimited, API_RESOURCE, false)
                .with_actor(identifier)
                .with_metadata(EventMetadata {
                    count: Some(u64::from(window.request_count)),
                    window_seconds: Some(window_seconds),
                    ..EventMetadata::default()
                });
            self.audit.record(event).await;
            return ApiGate::Limited {
                window_resets_at: resets_at,
            };
        }

        ApiGate::Allowed {
            remaining: max - window.request_count,
        }
    }

    /// Count one API request against the caller's window, starting a fresh
    /// window when the previous one has elapsed.
    pub async fn record_api_request(&self, identifier: &str) {
        let now = self.clock.now();

        let loaded = match self.load_window(identifier).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!("Failed to read API window for {identifier}: {err}");
                return;
            }
        };

        let (record_id, window) = match loaded {
            None => (
                None,
                ApiWindowRecord {
                    identifier: identifier.to_string(),
                    request_count: 1,
                    window_started_at: now,
                },
            ),
            Some((id, window)) => {
                let expired = now >= window.window_started_at + self.config.api_window();
                let next = if expired {
                    ApiWindowRecord {
                        identifier: identifier.to_string(),
                        request_count: 1,
                        window_started_at: now,
                    }
                } else {
                    ApiWindowRecord {
                        request_count: window.request_count.saturating_add(1),
                        ..window
                    }
                };
                (Some(id), next)
            }
        };

        if let Err(err) = self.persist_window(record_id.as_deref(), &window).await {
            warn!("Failed to persist API window for {identifier}: {err}");
        }
    }

    /// Snapshot of all current API windows. Feeds the usage metrics in the
    /// security monitor.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn api_windows(&self) -> Result<Vec<ApiWindowRecord>, StoreError> {
        let records = self.store.list(API_WINDOW_TABLE, None, None, None).await?;
        let mut windows = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_value::<ApiWindowRecord>(record.fields) {
                Ok(window) => windows.push(window),
                Err(err) => {
                    warn!(id = %record.id, "Skipping malformed API window record: {err}");
                }
            }
        }
        Ok(windows)
    }

    async fn load_limit(
        &self,
        identifier: &str,
        scope: Scope,
    ) -> Result<Option<(String, RateLimitRecord)>, StoreError> {
        let filter = Filter::new()
            .eq("identifier", identifier)
            .eq("is_ip_based", scope.is_ip_based());
        let records = self
            .store
            .list(RATE_LIMIT_TABLE, Some(&filter), None, Some(1))
            .await?;
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let parsed = serde_json::from_value::<RateLimitRecord>(record.fields)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(Some((record.id, parsed)))
    }

    async fn persist_limit(
        &self,
        record_id: Option<&str>,
        record: &RateLimitRecord,
    ) -> Result<(), StoreError> {
        let fields =
            serde_json::to_value(record).map_err(|err| StoreError::Malformed(err.to_string()))?;
        match record_id {
            Some(id) => self.store.update(RATE_LIMIT_TABLE, id, fields).await,
            None => self
                .store
                .create(RATE_LIMIT_TABLE, fields)
                .await
                .map(|_| ()),
        }
    }

    async fn load_window(
        &self,
        identifier: &str,
    ) -> Result<Option<(String, ApiWindowRecord)>, StoreError> {
        let filter = Filter::new().eq("identifier", identifier);
        let records = self
            .store
            .list(API_WINDOW_TABLE, Some(&filter), None, Some(1))
            .await?;
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let parsed = serde_json::from_value::<ApiWindowRecord>(record.fields)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(Some((record.id, parsed)))
    }

    async fn persist_window(
        &self,
        record_id: Option<&str>,
        window: &ApiWindowRecord,
    ) -> Result<(), StoreError> {
        let fields =
            serde_json::to_value(window).map_err(|err| StoreError::Malformed(err.to_string()))?;
        match record_id {
            Some(id) => self.store.update(API_WINDOW_TABLE, id, fields).await,
            None => self
                .store
                .create(API_WINDOW_TABLE, fields)
                .await
                .map(|_| ()),
        }
    }
}

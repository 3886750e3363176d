//! Append-only security audit trail.
//!
//! Every security-relevant action in the crate flows through [`AuditLog`]:
//! append via [`AuditLog::record`], read via query helpers. Events are never
//! updated or deleted once written.
//!
//! Recording is fail-open: a store outage must not take authentication down
//! with it, so `record` degrades to a structured log line and reports
//! `false` instead of returning an error. Writing the audit trail is the
//! one place where losing data is preferable to blocking logins.

use crate::clock::Clock;
use crate::store::{Filter, Sort, StoreError, TableStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

pub const AUDIT_TABLE: &str = "audit_events";

const DEFAULT_QUERY_LIMIT: usize = 500;
const STATS_SAMPLE_LIMIT: usize = 1000;

/// Closed vocabulary of audited actions. Serialized as
/// `SCREAMING_SNAKE_CASE` strings in store records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    LoginSuccess,
    LoginFailed,
    Logout,
    SessionOpened,
    AccountLocked,
    AccountUnlocked,
    ApiRateLimited,
    MfaSetupStarted,
    MfaEnabled,
    MfaDisabled,
    MfaChallenge,
    MfaRecoveryCodeUsed,
    MfaRecoveryCodesRegenerated,
    ApiKeyRotated,
    ApiKeyGracePurged,
    CertificatePinningFailure,
    AlertDispatched,
    AlertDispatchFailed,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::Logout => "LOGOUT",
            Self::SessionOpened => "SESSION_OPENED",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountUnlocked => "ACCOUNT_UNLOCKED",
            Self::ApiRateLimited => "API_RATE_LIMITED",
            Self::MfaSetupStarted => "MFA_SETUP_STARTED",
            Self::MfaEnabled => "MFA_ENABLED",
            Self::MfaDisabled => "MFA_DISABLED",
            Self::MfaChallenge => "MFA_CHALLENGE",
            Self::MfaRecoveryCodeUsed => "MFA_RECOVERY_CODE_USED",
            Self::MfaRecoveryCodesRegenerated => "MFA_RECOVERY_CODES_REGENERATED",
            Self::ApiKeyRotated => "API_KEY_ROTATED",
            Self::ApiKeyGracePurged => "API_KEY_GRACE_PURGED",
            Self::CertificatePinningFailure => "CERTIFICATE_PINNING_FAILURE",
            Self::AlertDispatched => "ALERT_DISPATCHED",
            Self::AlertDispatchFailed => "ALERT_DISPATCH_FAILED",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "LOGIN_SUCCESS" => Ok(Self::LoginSuccess),
            "LOGIN_FAILED" => Ok(Self::LoginFailed),
            "LOGOUT" => Ok(Self::Logout),
            "SESSION_OPENED" => Ok(Self::SessionOpened),
            "ACCOUNT_LOCKED" => Ok(Self::AccountLocked),
            "ACCOUNT_UNLOCKED" => Ok(Self::AccountUnlocked),
            "API_RATE_LIMITED" => Ok(Self::ApiRateLimited),
            "MFA_SETUP_STARTED" => Ok(Self::MfaSetupStarted),
            "MFA_ENABLED" => Ok(Self::MfaEnabled),
            "MFA_DISABLED" => Ok(Self::MfaDisabled),
            "MFA_CHALLENGE" => Ok(Self::MfaChallenge),
            "MFA_RECOVERY_CODE_USED" => Ok(Self::MfaRecoveryCodeUsed),
            "MFA_RECOVERY_CODES_REGENERATED" => Ok(Self::MfaRecoveryCodesRegenerated),
            "API_KEY_ROTATED" => Ok(Self::ApiKeyRotated),
            "API_KEY_GRACE_PURGED" => Ok(Self::ApiKeyGracePurged),
            "CERTIFICATE_PINNING_FAILURE" => Ok(Self::CertificatePinningFailure),
            "ALERT_DISPATCHED" => Ok(Self::AlertDispatched),
            "ALERT_DISPATCH_FAILED" => Ok(Self::AlertDispatchFailed),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context attached to an event. Fixed keys, absent keys are
/// omitted from the serialized record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

impl EventMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Component or domain the event belongs to (`auth`, `mfa`,
    /// `credentials`, `transport`, `alerts`, `sessions`).
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "EventMetadata::is_empty")]
    pub metadata: EventMetadata,
}

impl AuditEvent {
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>, action: AuditAction, resource: &str, success: bool) -> Self {
        Self {
            timestamp,
            action,
            resource: resource.to_string(),
            actor: None,
            target_id: None,
            success,
            ip_address: None,
            device_fingerprint: None,
            user_agent: None,
            metadata: EventMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    #[must_use]
    pub fn with_device(mut self, fingerprint: impl Into<String>) -> Self {
        self.device_fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub action: Option<AuditAction>,
    pub actor: Option<String>,
    pub resource: Option<String>,
    pub target_id: Option<String>,
    pub ip_address: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unique_actors: u64,
    pub unique_ips: u64,
    pub by_action: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn TableStore>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn TableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Start an event stamped with the current time. Callers add context via
    /// the `with_*` builders and hand the event to [`Self::record`].
    #[must_use]
    pub fn event(&self, action: AuditAction, resource: &str, success: bool) -> AuditEvent {
        AuditEvent::at(self.clock.now(), action, resource, success)
    }

    /// Append an event to the trail. Returns whether the event was persisted;
    /// on store failure the event is emitted as a log line instead so the
    /// trail degrades rather than blocking the caller.
    pub async fn record(&self, event: AuditEvent) -> bool {
        info!(
            target: "audit",
            action = event.action.as_str(),
            resource = %event.resource,
            actor = event.actor.as_deref().unwrap_or("-"),
            success = event.success,
            "audit event"
        );

        let fields = match serde_json::to_value(&event) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(target: "audit", "Failed to serialize audit event: {err}");
                return false;
            }
        };

        match self.store.create(AUDIT_TABLE, fields).await {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    target: "audit",
                    action = event.action.as_str(),
                    "Failed to persist audit event: {err}"
                );
                false
            }
        }
    }

    /// Query events, newest first. Records that fail to decode are skipped
    /// with a warning rather than failing the whole query.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<AuditEvent>, StoreError> {
        let mut filter = Filter::new();
        if let Some(action) = query.action {
            filter = filter.eq("action", action.as_str());
        }
        if let Some(actor) = &query.actor {
            filter = filter.eq("actor", actor.as_str());
        }
        if let Some(resource) = &query.resource {
            filter = filter.eq("resource", resource.as_str());
        }
        if let Some(target_id) = &query.target_id {
            filter = filter.eq("target_id", target_id.as_str());
        }
        if let Some(ip) = &query.ip_address {
            filter = filter.eq("ip_address", ip.as_str());
        }
        if let Some(success) = query.success {
            filter = filter.eq("success", success);
        }
        if let Some(since) = query.since {
            filter = filter.gte("timestamp", since.to_rfc3339());
        }

        let filter = if filter.is_empty() { None } else { Some(filter) };
        let sort = Sort::descending("timestamp");
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

        let records = self
            .store
            .list(AUDIT_TABLE, filter.as_ref(), Some(&sort), Some(limit))
            .await?;

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_value::<AuditEvent>(record.fields) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(target: "audit", id = %record.id, "Skipping malformed audit record: {err}");
                }
            }
        }
        Ok(events)
    }

    /// Failed login events within `window`, optionally narrowed to an
    /// identifier and/or source IP.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn failed_logins(
        &self,
        identifier: Option<&str>,
        ip: Option<&str>,
        window: Duration,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        self.query(&EventQuery {
            action: Some(AuditAction::LoginFailed),
            actor: identifier.map(ToString::to_string),
            ip_address: ip.map(ToString::to_string),
            since: Some(self.clock.now() - window),
            ..EventQuery::default()
        })
        .await
    }

    /// All of one actor's events within `window`.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn user_activity(
        &self,
        actor: &str,
        window: Duration,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        self.query(&EventQuery {
            actor: Some(actor.to_string()),
            since: Some(self.clock.now() - window),
            ..EventQuery::default()
        })
        .await
    }

    /// All events for one resource within `window`.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn resource_events(
        &self,
        resource: &str,
        window: Duration,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        self.query(&EventQuery {
            resource: Some(resource.to_string()),
            since: Some(self.clock.now() - window),
            ..EventQuery::default()
        })
        .await
    }

    /// Aggregate statistics over events in `window`. Computed client-side
    /// from a bounded sample of the newest events.
    ///
    /// # Errors
    /// Returns an error if the store request fails.
    pub async fn statistics(&self, window: Duration) -> Result<AuditStats, StoreError> {
        let events = self
            .query(&EventQuery {
                since: Some(self.clock.now() - window),
                limit: Some(STATS_SAMPLE_LIMIT),
                ..EventQuery::default()
            })
            .await?;

        let mut stats = AuditStats::default();
        let mut actors = HashSet::new();
        let mut ips = HashSet::new();
        for event in events {
            stats.total += 1;
            if event.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if let Some(actor) = event.actor {
                actors.insert(actor);
            }
            if let Some(ip) = event.ip_address {
                ips.insert(ip);
            }
            *stats
                .by_action
                .entry(event.action.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats.unique_actors = actors.len() as u64;
        stats.unique_ips = ips.len() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryTableStore;
    use chrono::TimeZone;

    fn fixture() -> (AuditLog, InMemoryTableStore, ManualClock) {
        let store = InMemoryTableStore::new();
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        let log = AuditLog::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (log, store, clock)
    }

    #[test]
    fn action_names_round_trip() {
        let actions = [
            AuditAction::LoginSuccess,
            AuditAction::LoginFailed,
            AuditAction::AccountLocked,
            AuditAction::MfaRecoveryCodesRegenerated,
            AuditAction::CertificatePinningFailure,
            AuditAction::AlertDispatchFailed,
        ];
        for action in actions {
            let parsed: AuditAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
            // serde uses the same spelling as as_str
            let json = serde_json::to_value(action).unwrap();
            assert_eq!(json, serde_json::Value::String(action.as_str().to_string()));
        }
        assert!("NOT_AN_ACTION".parse::<AuditAction>().is_err());
    }

    #[test]
    fn serialized_event_omits_absent_fields() {
        let event = AuditEvent::at(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            AuditAction::LoginFailed,
            "auth",
            false,
        )
        .with_actor("alice");

        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("actor"));
        assert!(!object.contains_key("ip_address"));
        assert!(!object.contains_key("target_id"));
        assert!(!object.contains_key("metadata"));
        assert_eq!(object["action"], "LOGIN_FAILED");
    }

    #[tokio::test]
    async fn record_persists_and_query_reads_back() {
        let (log, _store, _clock) = fixture();

        let event = log
            .event(AuditAction::LoginFailed, "auth", false)
            .with_actor("alice")
            .with_ip("10.0.0.1")
            .with_metadata(EventMetadata {
                reason: Some("invalid_credentials".to_string()),
                remaining: Some(4),
                ..EventMetadata::default()
            });
        assert!(log.record(event).await);

        let events = log
            .query(&EventQuery {
                action: Some(AuditAction::LoginFailed),
                actor: Some("alice".to_string()),
                ..EventQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.remaining, Some(4));
        assert_eq!(events[0].ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn record_degrades_when_store_is_down() {
        let (log, store, _clock) = fixture();
        store.set_failing(true);

        let event = log.event(AuditAction::LoginSuccess, "auth", true);
        assert!(!log.record(event).await);

        store.set_failing(false);
        assert!(store.records(AUDIT_TABLE).is_empty());
    }

    #[tokio::test]
    async fn failed_logins_respects_window_and_identifier() {
        let (log, _store, clock) = fixture();

        let stale = log
            .event(AuditAction::LoginFailed, "auth", false)
            .with_actor("alice");
        log.record(stale).await;

        clock.advance(Duration::hours(2));
        let fresh = log
            .event(AuditAction::LoginFailed, "auth", false)
            .with_actor("alice");
        log.record(fresh).await;
        let other = log
            .event(AuditAction::LoginFailed, "auth", false)
            .with_actor("bob");
        log.record(other).await;

        let events = log
            .failed_logins(Some("alice"), None, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn query_returns_newest_first() {
        let (log, _store, clock) = fixture();

        for actor in ["first", "second", "third"] {
            let event = log
                .event(AuditAction::LoginSuccess, "auth", true)
                .with_actor(actor);
            log.record(event).await;
            clock.advance(Duration::minutes(1));
        }

        let events = log.query(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].actor.as_deref(), Some("third"));
        assert_eq!(events[2].actor.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn statistics_aggregate_by_action_and_source() {
        let (log, _store, _clock) = fixture();

        let success = log
            .event(AuditAction::LoginSuccess, "auth", true)
            .with_actor("alice")
            .with_ip("10.0.0.1");
        log.record(success).await;
        for _ in 0..2 {
            let failure = log
                .event(AuditAction::LoginFailed, "auth", false)
                .with_actor("bob")
                .with_ip("10.0.0.2");
            log.record(failure).await;
        }

        let stats = log.statistics(Duration::hours(1)).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.unique_actors, 2);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.by_action.get("LOGIN_FAILED"), Some(&2));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (log, store, _clock) = fixture();

        let event = log.event(AuditAction::Logout, "sessions", true);
        log.record(event).await;
        store
            .create(AUDIT_TABLE, serde_json::json!({"action": "NOT_AN_ACTION"}))
            .await
            .unwrap();

        let events = log.query(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::Logout);
    }
}

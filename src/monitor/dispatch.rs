//! Alert delivery with per-alert throttling.
//!
//! Channels are independent: a failure on one never stops delivery on the
//! others. Every delivery attempt lands on the audit trail. The throttle
//! ledger is in-process only; a restart may redeliver sooner than the
//! window would otherwise allow.

use super::{SecurityAlert, SecurityMonitor, Severity};
use crate::audit::{AuditAction, AuditLog, EventMetadata};
use crate::clock::Clock;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const ALERTS_RESOURCE: &str = "alerts";

/// Delivery target for security alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver an alert or return an error to mark the attempt failed.
    async fn deliver(&self, alert: &SecurityAlert) -> Result<()>;
}

/// Local dev channel that logs the alert instead of sending it anywhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
        info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            message = %alert.message,
            "security alert delivery stub"
        );
        Ok(())
    }
}

/// Posts alerts to an email relay endpoint.
pub struct EmailChannel {
    client: Client,
    endpoint: String,
    token: SecretString,
    recipient: String,
}

impl EmailChannel {
    pub fn new(client: Client, endpoint: &str, token: SecretString, recipient: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            token,
            recipient: recipient.to_string(),
        }
    }

    fn payload(&self, alert: &SecurityAlert) -> serde_json::Value {
        serde_json::json!({
            "to": self.recipient,
            "subject": format!("[{}] {} alert for {}", alert.severity, alert.kind, alert.identifier),
            "body": alert.message,
            "alert": alert,
        })
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .json(&self.payload(alert))
            .send()
            .await
            .context("Failed to reach email relay")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("email relay returned {status}");
        }
        Ok(())
    }
}

/// Posts alerts to a push notification webhook.
pub struct PushChannel {
    client: Client,
    endpoint: String,
    token: SecretString,
}

impl PushChannel {
    pub fn new(client: Client, endpoint: &str, token: SecretString) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            token,
        }
    }

    fn payload(alert: &SecurityAlert) -> serde_json::Value {
        serde_json::json!({
            "title": format!("{} ({})", alert.kind, alert.severity),
            "body": alert.message,
            "alert": alert,
        })
    }
}

#[async_trait]
impl AlertChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .json(&Self::payload(alert))
            .send()
            .await
            .context("Failed to reach push webhook")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("push webhook returned {status}");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Severity below the configured dispatch threshold.
    BelowThreshold,
    /// Same alert id delivered within the throttle window.
    Throttled { until: DateTime<Utc> },
    Dispatched {
        delivered: Vec<&'static str>,
        failed: Vec<&'static str>,
    },
}

#[derive(Clone)]
pub struct AlertDispatcher {
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    channels: Vec<Arc<dyn AlertChannel>>,
    threshold: Severity,
    throttle: chrono::Duration,
    recent: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl AlertDispatcher {
    pub fn new(
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        channels: Vec<Arc<dyn AlertChannel>>,
        threshold: Severity,
        throttle: chrono::Duration,
    ) -> Self {
        Self {
            audit,
            clock,
            channels,
            threshold,
            throttle,
            recent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver one alert over every configured channel.
    ///
    /// Repeats of the same alert id inside the throttle window are dropped
    /// unless `force` is set. The throttle clock only advances when at
    /// least one channel accepted the alert, so a fully failed dispatch is
    /// retried on the next round.
    pub async fn dispatch(&self, alert: &SecurityAlert, force: bool) -> DispatchOutcome {
        if alert.severity < self.threshold {
            debug!(alert_id = %alert.id, "Alert below dispatch threshold");
            return DispatchOutcome::BelowThreshold;
        }

        let now = self.clock.now();
        if !force {
            if let Some(until) = self.throttled_until(&alert.id, now) {
                debug!(alert_id = %alert.id, "Alert throttled until {until}");
                return DispatchOutcome::Throttled { until };
            }
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for channel in &self.channels {
            match channel.deliver(alert).await {
                Ok(()) => {
                    delivered.push(channel.name());
                    self.record_attempt(alert, channel.name(), true, None).await;
                }
                Err(err) => {
                    error!(
                        alert_id = %alert.id,
                        channel = channel.name(),
                        "Alert delivery failed: {err}"
                    );
                    failed.push(channel.name());
                    self.record_attempt(alert, channel.name(), false, Some(err.to_string()))
                        .await;
                }
            }
        }

        if !delivered.is_empty() {
            let mut recent = match self.recent.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            recent.insert(alert.id.clone(), now);
        }

        DispatchOutcome::Dispatched { delivered, failed }
    }

    /// Dispatch a batch, returning how many were actually sent somewhere.
    pub async fn dispatch_all(&self, alerts: &[SecurityAlert]) -> usize {
        let mut sent = 0;
        for alert in alerts {
            if let DispatchOutcome::Dispatched { delivered, .. } =
                self.dispatch(alert, false).await
            {
                if !delivered.is_empty() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Recompute alerts and dispatch them on a fixed cadence.
    #[must_use]
    pub fn spawn_refresh_schedule(
        &self,
        monitor: SecurityMonitor,
        interval: std::time::Duration,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                match monitor.security_alerts().await {
                    Ok(alerts) => {
                        if !alerts.is_empty() {
                            let sent = dispatcher.dispatch_all(&alerts).await;
                            info!("Security sweep found {} alert(s), dispatched {sent}", alerts.len());
                        }
                    }
                    Err(err) => warn!("Security sweep failed: {err}"),
                }
                sleep(interval).await;
            }
        })
    }

    fn throttled_until(&self, alert_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let last = recent.get(alert_id)?;
        let until = *last + self.throttle;
        (now < until).then_some(until)
    }

    async fn record_attempt(
        &self,
        alert: &SecurityAlert,
        channel: &str,
        success: bool,
        reason: Option<String>,
    ) {
        let action = if success {
            AuditAction::AlertDispatched
        } else {
            AuditAction::AlertDispatchFailed
        };
        let event = self
            .audit
            .event(action, ALERTS_RESOURCE, success)
            .with_target(&alert.identifier)
            .with_metadata(EventMetadata {
                alert_id: Some(alert.id.clone()),
                channel: Some(channel.to_string()),
                reason,
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AUDIT_TABLE;
    use crate::clock::ManualClock;
    use crate::monitor::AlertKind;
    use crate::store::InMemoryTableStore;
    use chrono::{Duration, TimeZone};

    struct RecordingChannel {
        channel_name: &'static str,
        fail: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingChannel {
        fn new(channel_name: &'static str, fail: bool) -> Self {
            Self {
                channel_name,
                fail,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            self.channel_name
        }

        async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
            if self.fail {
                anyhow::bail!("wire down");
            }
            self.sent.lock().unwrap().push(alert.id.clone());
            Ok(())
        }
    }

    fn alert(severity: Severity) -> SecurityAlert {
        SecurityAlert {
            id: "suspicious_ip:10.0.0.9".to_string(),
            kind: AlertKind::SuspiciousIp,
            severity,
            identifier: "10.0.0.9".to_string(),
            message: "20 failed logins from 10.0.0.9 in the last 24h".to_string(),
            count: 20,
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn fixture(
        channels: Vec<Arc<dyn AlertChannel>>,
        threshold: Severity,
    ) -> (AlertDispatcher, InMemoryTableStore, ManualClock) {
        let store = InMemoryTableStore::new();
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        let audit = AuditLog::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        let dispatcher = AlertDispatcher::new(
            audit,
            Arc::new(clock.clone()),
            channels,
            threshold,
            Duration::hours(1),
        );
        (dispatcher, store, clock)
    }

    fn audited_actions(store: &InMemoryTableStore) -> Vec<(String, String)> {
        store
            .records(AUDIT_TABLE)
            .into_iter()
            .map(|record| {
                (
                    record.fields["action"].as_str().unwrap_or_default().to_string(),
                    record.fields["metadata"]["channel"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn below_threshold_is_not_dispatched() {
        let channel = Arc::new(RecordingChannel::new("primary", false));
        let (dispatcher, store, _clock) = fixture(vec![channel.clone()], Severity::High);

        let outcome = dispatcher.dispatch(&alert(Severity::Medium), false).await;
        assert_eq!(outcome, DispatchOutcome::BelowThreshold);
        assert!(channel.sent.lock().unwrap().is_empty());
        assert!(store.records(AUDIT_TABLE).is_empty());
    }

    #[tokio::test]
    async fn delivers_and_audits_per_channel() {
        let first = Arc::new(RecordingChannel::new("primary", false));
        let second = Arc::new(RecordingChannel::new("secondary", false));
        let (dispatcher, store, _clock) =
            fixture(vec![first.clone(), second.clone()], Severity::Medium);

        let outcome = dispatcher.dispatch(&alert(Severity::High), false).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                delivered: vec!["primary", "secondary"],
                failed: vec![],
            }
        );
        assert_eq!(first.sent.lock().unwrap().len(), 1);
        assert_eq!(second.sent.lock().unwrap().len(), 1);
        assert_eq!(
            audited_actions(&store),
            vec![
                ("ALERT_DISPATCHED".to_string(), "primary".to_string()),
                ("ALERT_DISPATCHED".to_string(), "secondary".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn same_alert_is_throttled_within_window() {
        let channel = Arc::new(RecordingChannel::new("primary", false));
        let (dispatcher, _store, clock) = fixture(vec![channel.clone()], Severity::Medium);

        dispatcher.dispatch(&alert(Severity::High), false).await;
        let outcome = dispatcher.dispatch(&alert(Severity::High), false).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Throttled {
                until: clock.now() + Duration::hours(1)
            }
        );
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        // Force bypasses the window.
        let outcome = dispatcher.dispatch(&alert(Severity::High), true).await;
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        assert_eq!(channel.sent.lock().unwrap().len(), 2);

        // And the window reopens on its own once time passes.
        clock.advance(Duration::hours(2));
        let outcome = dispatcher.dispatch(&alert(Severity::High), false).await;
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        assert_eq!(channel.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_the_other() {
        let healthy = Arc::new(RecordingChannel::new("healthy", false));
        let broken = Arc::new(RecordingChannel::new("broken", true));
        let (dispatcher, store, _clock) =
            fixture(vec![broken.clone(), healthy.clone()], Severity::Medium);

        let outcome = dispatcher.dispatch(&alert(Severity::High), false).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                delivered: vec!["healthy"],
                failed: vec!["broken"],
            }
        );
        assert_eq!(
            audited_actions(&store),
            vec![
                ("ALERT_DISPATCH_FAILED".to_string(), "broken".to_string()),
                ("ALERT_DISPATCHED".to_string(), "healthy".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_start_the_throttle() {
        let broken = Arc::new(RecordingChannel::new("broken", true));
        let (dispatcher, _store, _clock) = fixture(vec![broken], Severity::Medium);

        dispatcher.dispatch(&alert(Severity::High), false).await;
        // Nothing was delivered, so the retry is not throttled.
        let outcome = dispatcher.dispatch(&alert(Severity::High), false).await;
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    }

    #[tokio::test]
    async fn dispatch_all_counts_deliveries() {
        let channel = Arc::new(RecordingChannel::new("primary", false));
        let (dispatcher, _store, _clock) = fixture(vec![channel], Severity::Medium);

        let mut second = alert(Severity::High);
        second.id = "suspicious_ip:10.0.0.10".to_string();
        second.identifier = "10.0.0.10".to_string();
        let batch = vec![alert(Severity::High), second, alert(Severity::Low)];

        // Third is below threshold, first two deliver.
        assert_eq!(dispatcher.dispatch_all(&batch).await, 2);
        // Second pass: every survivor is throttled.
        assert_eq!(dispatcher.dispatch_all(&batch).await, 0);
    }

    #[test]
    fn email_payload_carries_recipient_and_subject() {
        let channel = EmailChannel::new(
            Client::new(),
            "https://relay.example.com/send",
            SecretString::from("relay-token".to_string()),
            "secops@example.com",
        );
        let payload = channel.payload(&alert(Severity::High));
        assert_eq!(payload["to"], "secops@example.com");
        assert_eq!(
            payload["subject"],
            "[high] suspicious_ip alert for 10.0.0.9"
        );
        assert_eq!(payload["alert"]["id"], "suspicious_ip:10.0.0.9");
    }

    #[test]
    fn push_payload_carries_severity() {
        let payload = PushChannel::payload(&alert(Severity::Critical));
        assert_eq!(payload["title"], "suspicious_ip (critical)");
        assert_eq!(payload["alert"]["severity"], "critical");
    }
}

//! Security metrics and alerting over the audit trail.
//!
//! [`SecurityMonitor`] derives its numbers from what is actually on file:
//! audit events for failed logins and session activity, the rate limiter's
//! persisted windows for API usage. Fixed windows keep no history, so
//! usage figures are an approximation over the records still present, and
//! event queries are capped at the audit module's sampling limit.

use crate::audit::{AuditAction, AuditLog, EventQuery};
use crate::clock::Clock;
use crate::ratelimit::RateLimiter;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod dispatch;

pub use dispatch::{
    AlertChannel, AlertDispatcher, DispatchOutcome, EmailChannel, LogChannel, PushChannel,
};

/// An IP crosses into suspicious territory at this many failed logins.
const SUSPICIOUS_IP_FAILURES: u64 = 10;
const HIGH_IP_FAILURES: u64 = 20;
const CRITICAL_IP_FAILURES: u64 = 50;

/// Lookback for failed-login alerting.
const FAILED_LOGIN_LOOKBACK_HOURS: i64 = 24;
/// An actor is "active" with an audit event inside this many minutes.
const SESSION_ACTIVITY_MINUTES: i64 = 5;
/// Active from this many distinct IPs at once is anomalous.
const ANOMALOUS_DISTINCT_IPS: usize = 3;

const USAGE_LOOKBACK_MINUTES: i64 = 60;
const ACTOR_USAGE_LIMIT: u64 = 100;
const IP_USAGE_LIMIT: u64 = 200;

const QUERY_LIMIT: usize = 1000;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "invalid severity '{other}', expected one of: low, medium, high, critical"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SuspiciousIp,
    AnomalousSessions,
    ExcessiveUsage,
}

impl AlertKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SuspiciousIp => "suspicious_ip",
            Self::AnomalousSessions => "anomalous_sessions",
            Self::ExcessiveUsage => "excessive_usage",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding from the monitor. The `id` is stable for a given kind and
/// identifier so the dispatcher can throttle repeats of the same finding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SecurityAlert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub identifier: String,
    pub message: String,
    pub count: u64,
    pub timestamp: DateTime<Utc>,
}

impl SecurityAlert {
    fn new(
        kind: AlertKind,
        severity: Severity,
        identifier: &str,
        message: String,
        count: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{kind}:{identifier}"),
            kind,
            severity,
            identifier: identifier.to_string(),
            message,
            count,
            timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SuspiciousIp {
    pub ip: String,
    pub failures: u64,
    pub severity: Severity,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FailedLoginMetrics {
    pub total: u64,
    pub by_actor: HashMap<String, u64>,
    pub by_ip: HashMap<String, u64>,
    pub suspicious_ips: Vec<SuspiciousIp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnomalousActor {
    pub actor: String,
    pub distinct_ips: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionMetrics {
    pub active_actors: u64,
    pub anomalous: Vec<AnomalousActor>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UsageMetrics {
    pub by_actor: HashMap<String, u64>,
    pub by_ip: HashMap<String, u64>,
    pub heavy_actors: Vec<(String, u64)>,
    pub heavy_ips: Vec<(String, u64)>,
}

const fn severity_for_ip_failures(failures: u64) -> Severity {
    if failures >= CRITICAL_IP_FAILURES {
        Severity::Critical
    } else if failures >= HIGH_IP_FAILURES {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Identifiers in the API window table are either account identifiers or
/// caller IPs; tell them apart by shape.
fn is_ip_identifier(identifier: &str) -> bool {
    identifier.parse::<std::net::IpAddr>().is_ok()
}

#[derive(Clone)]
pub struct SecurityMonitor {
    audit: AuditLog,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl SecurityMonitor {
    pub fn new(audit: AuditLog, limiter: RateLimiter, clock: Arc<dyn Clock>) -> Self {
        Self {
            audit,
            limiter,
            clock,
        }
    }

    /// Failed-login counts over `window`, grouped by actor and source IP.
    /// IPs at or above the suspicious threshold are listed with a severity
    /// scaled by volume.
    ///
    /// # Errors
    /// Returns an error if the audit trail cannot be queried.
    pub async fn failed_login_metrics(&self, window: Duration) -> Result<FailedLoginMetrics> {
        let events = self
            .audit
            .failed_logins(None, None, window)
            .await
            .context("Failed to query failed logins")?;

        let mut metrics = FailedLoginMetrics {
            total: events.len() as u64,
            ..FailedLoginMetrics::default()
        };
        let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();

        for event in &events {
            if let Some(actor) = &event.actor {
                *metrics.by_actor.entry(actor.clone()).or_default() += 1;
            }
            if let Some(ip) = &event.ip_address {
                *metrics.by_ip.entry(ip.clone()).or_default() += 1;
                let seen = last_seen.entry(ip.clone()).or_insert(event.timestamp);
                if event.timestamp > *seen {
                    *seen = event.timestamp;
                }
            }
        }

        metrics.suspicious_ips = metrics
            .by_ip
            .iter()
            .filter(|(_, failures)| **failures >= SUSPICIOUS_IP_FAILURES)
            .map(|(ip, failures)| SuspiciousIp {
                ip: ip.clone(),
                failures: *failures,
                severity: severity_for_ip_failures(*failures),
                last_seen: last_seen.get(ip).copied().unwrap_or_else(|| self.clock.now()),
            })
            .collect();
        metrics
            .suspicious_ips
            .sort_by(|a, b| b.failures.cmp(&a.failures).then(a.ip.cmp(&b.ip)));
        Ok(metrics)
    }

    /// Actors with any audit event in the last five minutes. An actor seen
    /// from three or more distinct IPs in that window is anomalous.
    ///
    /// # Errors
    /// Returns an error if the audit trail cannot be queried.
    pub async fn session_metrics(&self) -> Result<SessionMetrics> {
        let since = self.clock.now() - Duration::minutes(SESSION_ACTIVITY_MINUTES);
        let events = self
            .audit
            .query(&EventQuery {
                since: Some(since),
                limit: Some(QUERY_LIMIT),
                ..EventQuery::default()
            })
            .await
            .context("Failed to query recent activity")?;

        let mut ips_by_actor: HashMap<String, HashSet<String>> = HashMap::new();
        let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        for event in &events {
            let Some(actor) = &event.actor else { continue };
            let entry = ips_by_actor.entry(actor.clone()).or_default();
            if let Some(ip) = &event.ip_address {
                entry.insert(ip.clone());
            }
            let seen = last_seen.entry(actor.clone()).or_insert(event.timestamp);
            if event.timestamp > *seen {
                *seen = event.timestamp;
            }
        }

        let mut anomalous: Vec<AnomalousActor> = ips_by_actor
            .iter()
            .filter(|(_, ips)| ips.len() >= ANOMALOUS_DISTINCT_IPS)
            .map(|(actor, ips)| AnomalousActor {
                actor: actor.clone(),
                distinct_ips: ips.len() as u64,
                last_seen: last_seen.get(actor).copied().unwrap_or(since),
            })
            .collect();
        anomalous.sort_by(|a, b| b.distinct_ips.cmp(&a.distinct_ips).then(a.actor.cmp(&b.actor)));

        Ok(SessionMetrics {
            active_actors: ips_by_actor.len() as u64,
            anomalous,
        })
    }

    /// API request volume over the last hour per actor and per IP, from the
    /// limiter's persisted windows plus rate-limited denials on the audit
    /// trail. Actors above 100 and IPs above 200 requests are flagged.
    ///
    /// # Errors
    /// Returns an error if the store or audit trail cannot be queried.
    pub async fn usage_metrics(&self) -> Result<UsageMetrics> {
        let since = self.clock.now() - Duration::minutes(USAGE_LOOKBACK_MINUTES);

        let mut metrics = UsageMetrics::default();
        let windows = self
            .limiter
            .api_windows()
            .await
            .context("Failed to list API windows")?;
        for window in windows {
            if window.window_started_at < since {
                continue;
            }
            let count = u64::from(window.request_count);
            if is_ip_identifier(&window.identifier) {
                *metrics.by_ip.entry(window.identifier).or_default() += count;
            } else {
                *metrics.by_actor.entry(window.identifier).or_default() += count;
            }
        }

        // Denied requests never reach a window counter; each denial event
        // represents one attempted request.
        let denials = self
            .audit
            .query(&EventQuery {
                action: Some(AuditAction::ApiRateLimited),
                since: Some(since),
                limit: Some(QUERY_LIMIT),
                ..EventQuery::default()
            })
            .await
            .context("Failed to query rate-limit denials")?;
        for event in &denials {
            let Some(actor) = &event.actor else { continue };
            if is_ip_identifier(actor) {
                *metrics.by_ip.entry(actor.clone()).or_default() += 1;
            } else {
                *metrics.by_actor.entry(actor.clone()).or_default() += 1;
            }
        }

        metrics.heavy_actors = metrics
            .by_actor
            .iter()
            .filter(|(_, count)| **count > ACTOR_USAGE_LIMIT)
            .map(|(actor, count)| (actor.clone(), *count))
            .collect();
        metrics.heavy_ips = metrics
            .by_ip
            .iter()
            .filter(|(_, count)| **count > IP_USAGE_LIMIT)
            .map(|(ip, count)| (ip.clone(), *count))
            .collect();
        metrics.heavy_actors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        metrics.heavy_ips.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(metrics)
    }

    /// Combined findings from all metric groups, most severe and most
    /// recent first.
    ///
    /// # Errors
    /// Returns an error if any underlying query fails.
    pub async fn security_alerts(&self) -> Result<Vec<SecurityAlert>> {
        let now = self.clock.now();
        let mut alerts = Vec::new();

        let failed = self
            .failed_login_metrics(Duration::hours(FAILED_LOGIN_LOOKBACK_HOURS))
            .await?;
        for suspicious in failed.suspicious_ips {
            alerts.push(SecurityAlert::new(
                AlertKind::SuspiciousIp,
                suspicious.severity,
                &suspicious.ip,
                format!(
                    "{} failed logins from {} in the last {}h",
                    suspicious.failures, suspicious.ip, FAILED_LOGIN_LOOKBACK_HOURS
                ),
                suspicious.failures,
                suspicious.last_seen,
            ));
        }

        let sessions = self.session_metrics().await?;
        for anomalous in sessions.anomalous {
            alerts.push(SecurityAlert::new(
                AlertKind::AnomalousSessions,
                Severity::High,
                &anomalous.actor,
                format!(
                    "{} active from {} distinct IPs within {} minutes",
                    anomalous.actor, anomalous.distinct_ips, SESSION_ACTIVITY_MINUTES
                ),
                anomalous.distinct_ips,
                anomalous.last_seen,
            ));
        }

        let usage = self.usage_metrics().await?;
        for (actor, count) in usage.heavy_actors {
            alerts.push(SecurityAlert::new(
                AlertKind::ExcessiveUsage,
                Severity::Medium,
                &actor,
                format!("{actor} made {count} API requests in the last hour"),
                count,
                now,
            ));
        }
        for (ip, count) in usage.heavy_ips {
            alerts.push(SecurityAlert::new(
                AlertKind::ExcessiveUsage,
                Severity::Medium,
                &ip,
                format!("{ip} made {count} API requests in the last hour"),
                count,
                now,
            ));
        }

        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.timestamp.cmp(&a.timestamp))
                .then(a.id.cmp(&b.id))
        });
        Ok(alerts)
    }
}

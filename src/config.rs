//! Security policy knobs shared across components.
//!
//! One value object created at startup from CLI/environment arguments and
//! handed (cloned) to the components that consume it. `normalize` clamps
//! nonsensical values instead of erroring so a stray `0` in an environment
//! variable cannot disable lockouts entirely.

use chrono::Duration;

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityConfig {
    max_failed_attempts: u32,
    attempt_window: Duration,
    lockout: Duration,
    api_window: Duration,
    api_max_requests: u32,
    rotation_interval: Duration,
    grace_period: Duration,
    session_timeout: Duration,
    alert_throttle: Duration,
    mfa_issuer: String,
}

impl SecurityConfig {
    /// Default policy: 5 failed attempts within 15 minutes locks for
    /// 15 minutes, 100 API requests per minute, 90 day rotation with a
    /// 24 hour grace period, 30 minute session idle timeout, and one
    /// alert per kind and source per hour.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_failed_attempts: 5,
            attempt_window: Duration::minutes(15),
            lockout: Duration::minutes(15),
            api_window: Duration::minutes(1),
            api_max_requests: 100,
            rotation_interval: Duration::days(90),
            grace_period: Duration::hours(24),
            session_timeout: Duration::minutes(30),
            alert_throttle: Duration::hours(1),
            mfa_issuer: "gardisto".to_string(),
        }
    }

    #[must_use]
    pub fn with_max_failed_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_attempt_window_seconds(mut self, secs: u64) -> Self {
        self.attempt_window = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_lockout_seconds(mut self, secs: u64) -> Self {
        self.lockout = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_api_window_seconds(mut self, secs: u64) -> Self {
        self.api_window = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_api_max_requests(mut self, requests: u32) -> Self {
        self.api_max_requests = requests;
        self
    }

    #[must_use]
    pub fn with_rotation_interval_days(mut self, days: u32) -> Self {
        self.rotation_interval = Duration::days(i64::from(days));
        self
    }

    #[must_use]
    pub fn with_grace_period_seconds(mut self, secs: u64) -> Self {
        self.grace_period = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_session_timeout_seconds(mut self, secs: u64) -> Self {
        self.session_timeout = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_alert_throttle_seconds(mut self, secs: u64) -> Self {
        self.alert_throttle = seconds(secs);
        self
    }

    #[must_use]
    pub fn with_mfa_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.mfa_issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn normalize(mut self) -> Self {
        self.max_failed_attempts = self.max_failed_attempts.max(1);
        self.api_max_requests = self.api_max_requests.max(1);
        if self.attempt_window <= Duration::zero() {
            self.attempt_window = Duration::minutes(15);
        }
        if self.lockout <= Duration::zero() {
            self.lockout = Duration::minutes(15);
        }
        if self.api_window <= Duration::zero() {
            self.api_window = Duration::minutes(1);
        }
        if self.rotation_interval <= Duration::zero() {
            self.rotation_interval = Duration::days(90);
        }
        if self.grace_period < Duration::zero() {
            self.grace_period = Duration::zero();
        }
        if self.session_timeout <= Duration::zero() {
            self.session_timeout = Duration::minutes(30);
        }
        if self.alert_throttle < Duration::zero() {
            self.alert_throttle = Duration::zero();
        }
        if self.mfa_issuer.trim().is_empty() {
            self.mfa_issuer = "gardisto".to_string();
        }
        self
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    #[must_use]
    pub fn attempt_window(&self) -> Duration {
        self.attempt_window
    }

    #[must_use]
    pub fn lockout(&self) -> Duration {
        self.lockout
    }

    #[must_use]
    pub fn api_window(&self) -> Duration {
        self.api_window
    }

    #[must_use]
    pub fn api_max_requests(&self) -> u32 {
        self.api_max_requests
    }

    #[must_use]
    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    #[must_use]
    pub fn alert_throttle(&self) -> Duration {
        self.alert_throttle
    }

    #[must_use]
    pub fn mfa_issuer(&self) -> &str {
        &self.mfa_issuer
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::new()
    }
}

use crate::config::SecurityConfig;
use clap::{Arg, ArgMatches, Command};

pub const ARG_MAX_FAILED_ATTEMPTS: &str = "max-failed-attempts";
pub const ARG_ATTEMPT_WINDOW_SECONDS: &str = "attempt-window-seconds";
pub const ARG_LOCKOUT_SECONDS: &str = "lockout-seconds";
pub const ARG_API_WINDOW_SECONDS: &str = "api-window-seconds";
pub const ARG_API_MAX_REQUESTS: &str = "api-max-requests";
pub const ARG_ROTATION_INTERVAL_DAYS: &str = "rotation-interval-days";
pub const ARG_GRACE_PERIOD_SECONDS: &str = "grace-period-seconds";
pub const ARG_SESSION_TIMEOUT_SECONDS: &str = "session-timeout-seconds";
pub const ARG_MFA_ISSUER: &str = "mfa-issuer";

#[derive(Debug, Clone)]
pub struct Options {
    pub max_failed_attempts: u32,
    pub attempt_window_seconds: u64,
    pub lockout_seconds: u64,
    pub api_window_seconds: u64,
    pub api_max_requests: u32,
    pub rotation_interval_days: u32,
    pub grace_period_seconds: u64,
    pub session_timeout_seconds: u64,
    pub mfa_issuer: String,
}

impl Options {
    /// Parse security policy arguments from matches.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        Ok(Self {
            max_failed_attempts: matches
                .get_one::<u32>(ARG_MAX_FAILED_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            attempt_window_seconds: matches
                .get_one::<u64>(ARG_ATTEMPT_WINDOW_SECONDS)
                .copied()
                .unwrap_or(900),
            lockout_seconds: matches
                .get_one::<u64>(ARG_LOCKOUT_SECONDS)
                .copied()
                .unwrap_or(900),
            api_window_seconds: matches
                .get_one::<u64>(ARG_API_WINDOW_SECONDS)
                .copied()
                .unwrap_or(60),
            api_max_requests: matches
                .get_one::<u32>(ARG_API_MAX_REQUESTS)
                .copied()
                .unwrap_or(100),
            rotation_interval_days: matches
                .get_one::<u32>(ARG_ROTATION_INTERVAL_DAYS)
                .copied()
                .unwrap_or(90),
            grace_period_seconds: matches
                .get_one::<u64>(ARG_GRACE_PERIOD_SECONDS)
                .copied()
                .unwrap_or(86_400),
            session_timeout_seconds: matches
                .get_one::<u64>(ARG_SESSION_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(1800),
            mfa_issuer: matches
                .get_one::<String>(ARG_MFA_ISSUER)
                .cloned()
                .unwrap_or_else(|| "gardisto".to_string()),
        })
    }

    /// Build the policy object handed to the security components.
    #[must_use]
    pub fn to_config(&self) -> SecurityConfig {
        SecurityConfig::new()
            .with_max_failed_attempts(self.max_failed_attempts)
            .with_attempt_window_seconds(self.attempt_window_seconds)
            .with_lockout_seconds(self.lockout_seconds)
            .with_api_window_seconds(self.api_window_seconds)
            .with_api_max_requests(self.api_max_requests)
            .with_rotation_interval_days(self.rotation_interval_days)
            .with_grace_period_seconds(self.grace_period_seconds)
            .with_session_timeout_seconds(self.session_timeout_seconds)
            .with_mfa_issuer(self.mfa_issuer.clone())
            .normalize()
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_login_args(command);
    let command = with_api_args(command);
    with_lifecycle_args(command)
}

fn with_login_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_FAILED_ATTEMPTS)
                .long(ARG_MAX_FAILED_ATTEMPTS)
                .help("Failed login attempts before an identifier or IP is locked")
                .env("GARDISTO_MAX_FAILED_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ATTEMPT_WINDOW_SECONDS)
                .long(ARG_ATTEMPT_WINDOW_SECONDS)
                .help("Window over which failed attempts are counted")
                .env("GARDISTO_ATTEMPT_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SECONDS)
                .long(ARG_LOCKOUT_SECONDS)
                .help("Lockout duration after too many failed attempts")
                .env("GARDISTO_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_api_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_API_WINDOW_SECONDS)
                .long(ARG_API_WINDOW_SECONDS)
                .help("Fixed window length for API request limiting")
                .env("GARDISTO_API_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_API_MAX_REQUESTS)
                .long(ARG_API_MAX_REQUESTS)
                .help("API requests allowed per identifier per window")
                .env("GARDISTO_API_MAX_REQUESTS")
                .default_value("100")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn with_lifecycle_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ROTATION_INTERVAL_DAYS)
                .long(ARG_ROTATION_INTERVAL_DAYS)
                .help("Days between scheduled API credential rotations")
                .env("GARDISTO_ROTATION_INTERVAL_DAYS")
                .default_value("90")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_GRACE_PERIOD_SECONDS)
                .long(ARG_GRACE_PERIOD_SECONDS)
                .help("How long the previous API key stays valid after a rotation")
                .env("GARDISTO_GRACE_PERIOD_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TIMEOUT_SECONDS)
                .long(ARG_SESSION_TIMEOUT_SECONDS)
                .help("Idle time after which a session is closed")
                .env("GARDISTO_SESSION_TIMEOUT_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MFA_ISSUER)
                .long(ARG_MFA_ISSUER)
                .help("Issuer label shown in authenticator apps")
                .env("GARDISTO_MFA_ISSUER")
                .default_value("gardisto"),
        )
}

use crate::monitor::Severity;
use clap::{Arg, ArgMatches, Command, builder::ValueParser};
use secrecy::SecretString;

pub const ARG_ALERT_THRESHOLD: &str = "alert-threshold";
pub const ARG_ALERT_THROTTLE_SECONDS: &str = "alert-throttle-seconds";
pub const ARG_ALERT_EMAIL_ENDPOINT: &str = "alert-email-endpoint";
pub const ARG_ALERT_EMAIL_TOKEN: &str = "alert-email-token";
pub const ARG_ALERT_EMAIL_RECIPIENT: &str = "alert-email-recipient";
pub const ARG_ALERT_PUSH_ENDPOINT: &str = "alert-push-endpoint";
pub const ARG_ALERT_PUSH_TOKEN: &str = "alert-push-token";

#[derive(Debug, Clone)]
pub struct EmailOptions {
    pub endpoint: String,
    pub token: SecretString,
    pub recipient: String,
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub endpoint: String,
    pub token: SecretString,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub threshold: Severity,
    pub throttle_seconds: u64,
    pub email: Option<EmailOptions>,
    pub push: Option<PushOptions>,
}

impl Options {
    /// Parse alerting arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a delivery channel is only partially configured.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        // Helper to filter empty strings which clap might pass through if env vars are set to ""
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let email = match get_non_empty(ARG_ALERT_EMAIL_ENDPOINT) {
            Some(endpoint) => {
                let token = get_non_empty(ARG_ALERT_EMAIL_TOKEN).ok_or_else(|| {
                    anyhow::anyhow!(
                        "missing required argument: --{ARG_ALERT_EMAIL_TOKEN} (required with --{ARG_ALERT_EMAIL_ENDPOINT})"
                    )
                })?;
                let recipient = get_non_empty(ARG_ALERT_EMAIL_RECIPIENT).ok_or_else(|| {
                    anyhow::anyhow!(
                        "missing required argument: --{ARG_ALERT_EMAIL_RECIPIENT} (required with --{ARG_ALERT_EMAIL_ENDPOINT})"
                    )
                })?;
                Some(EmailOptions {
                    endpoint,
                    token: SecretString::from(token),
                    recipient,
                })
            }
            None => None,
        };

        let push = match get_non_empty(ARG_ALERT_PUSH_ENDPOINT) {
            Some(endpoint) => {
                let token = get_non_empty(ARG_ALERT_PUSH_TOKEN).ok_or_else(|| {
                    anyhow::anyhow!(
                        "missing required argument: --{ARG_ALERT_PUSH_TOKEN} (required with --{ARG_ALERT_PUSH_ENDPOINT})"
                    )
                })?;
                Some(PushOptions {
                    endpoint,
                    token: SecretString::from(token),
                })
            }
            None => None,
        };

        Ok(Self {
            threshold: matches
                .get_one::<Severity>(ARG_ALERT_THRESHOLD)
                .copied()
                .unwrap_or(Severity::High),
            throttle_seconds: matches
                .get_one::<u64>(ARG_ALERT_THROTTLE_SECONDS)
                .copied()
                .unwrap_or(3600),
            email,
            push,
        })
    }
}

#[must_use]
pub fn validator_severity() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<Severity, String> {
        value.parse::<Severity>()
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALERT_THRESHOLD)
                .long(ARG_ALERT_THRESHOLD)
                .help("Minimum severity dispatched to alert channels: low, medium, high, critical")
                .env("GARDISTO_ALERT_THRESHOLD")
                .default_value("high")
                .value_parser(validator_severity()),
        )
        .arg(
            Arg::new(ARG_ALERT_THROTTLE_SECONDS)
                .long(ARG_ALERT_THROTTLE_SECONDS)
                .help("Quiet period before the same alert is delivered again")
                .env("GARDISTO_ALERT_THROTTLE_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ALERT_EMAIL_ENDPOINT)
                .long(ARG_ALERT_EMAIL_ENDPOINT)
                .help("Email relay webhook URL for alert delivery")
                .env("GARDISTO_ALERT_EMAIL_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_ALERT_EMAIL_TOKEN)
                .long(ARG_ALERT_EMAIL_TOKEN)
                .help("Bearer token for the email relay")
                .env("GARDISTO_ALERT_EMAIL_TOKEN"),
        )
        .arg(
            Arg::new(ARG_ALERT_EMAIL_RECIPIENT)
                .long(ARG_ALERT_EMAIL_RECIPIENT)
                .help("Recipient address for alert emails")
                .env("GARDISTO_ALERT_EMAIL_RECIPIENT"),
        )
        .arg(
            Arg::new(ARG_ALERT_PUSH_ENDPOINT)
                .long(ARG_ALERT_PUSH_ENDPOINT)
                .help("Push gateway URL for alert delivery")
                .env("GARDISTO_ALERT_PUSH_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_ALERT_PUSH_TOKEN)
                .long(ARG_ALERT_PUSH_TOKEN)
                .help("Bearer token for the push gateway")
                .env("GARDISTO_ALERT_PUSH_TOKEN"),
        )
}

//! Command-line argument dispatch.
//!
//! This module parses validated CLI arguments and maps them to the
//! appropriate action, such as starting the daemon with its full
//! configuration state.

use crate::cli::actions::{Action, daemon::Args};
use crate::cli::commands::{alerts, keystore, pinning, security, store};
use anyhow::Result;

/// Map validated CLI matches to a daemon action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    // Refuse unusable transport trust settings before anything dials out
    crate::cli::commands::validate(matches).map_err(|e| anyhow::anyhow!(e))?;

    let store_opts = store::Options::parse(matches)?;
    let keystore_opts = keystore::Options::parse(matches)?;
    let security_opts = security::Options::parse(matches)?;
    let pinning_opts = pinning::Options::parse(matches)?;
    let alert_opts = alerts::Options::parse(matches)?;

    let config = security_opts
        .to_config()
        .with_alert_throttle_seconds(alert_opts.throttle_seconds);

    let (alert_email_endpoint, alert_email_token, alert_email_recipient) = match alert_opts.email {
        Some(email) => (
            Some(email.endpoint),
            Some(email.token),
            Some(email.recipient),
        ),
        None => (None, None, None),
    };
    let (alert_push_endpoint, alert_push_token) = match alert_opts.push {
        Some(push) => (Some(push.endpoint), Some(push.token)),
        None => (None, None),
    };

    Ok(Action::Daemon(Args {
        store_url: store_opts.url,
        store_token: store_opts.token,
        keystore_url: keystore_opts.url,
        keystore_token: keystore_opts.token,
        keystore_mount: keystore_opts.mount,
        keystore_prefix: keystore_opts.prefix,
        config,
        pin_fingerprints: pinning_opts.fingerprints,
        allow_any_certificate: pinning_opts.allow_any,
        alert_threshold: alert_opts.threshold,
        alert_email_endpoint,
        alert_email_token,
        alert_email_recipient,
        alert_push_endpoint,
        alert_push_token,
    }))
}

use crate::{
    APP_USER_AGENT,
    audit::AuditLog,
    auth::SessionRegistry,
    clock::{Clock, SystemClock},
    config::SecurityConfig,
    keystore::{SecureStore, VaultKeystore},
    monitor::{
        AlertChannel, AlertDispatcher, EmailChannel, LogChannel, PushChannel, SecurityMonitor,
        Severity,
    },
    pinning::{self, CertificatePinner, pinned_client},
    ratelimit::RateLimiter,
    rotation::CredentialRotator,
    store::{HttpTableStore, TableStore},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info};
use ulid::Ulid;
use url::Url;

/// Rotation is due at most once per interval; a daily check is plenty.
const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ALERT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct Args {
    pub store_url: String,
    pub store_token: SecretString,
    pub keystore_url: String,
    pub keystore_token: SecretString,
    pub keystore_mount: String,
    pub keystore_prefix: String,
    pub config: SecurityConfig,
    pub pin_fingerprints: Vec<String>,
    pub allow_any_certificate: bool,
    pub alert_threshold: Severity,
    pub alert_email_endpoint: Option<String>,
    pub alert_email_token: Option<SecretString>,
    pub alert_email_recipient: Option<String>,
    pub alert_push_endpoint: Option<String>,
    pub alert_push_token: Option<SecretString>,
}

/// Execute the daemon action: wire the security components and run the
/// background schedules until a shutdown signal arrives.
///
/// # Errors
/// Returns an error if the transport clients cannot be built, rotation
/// state cannot be initialized, or signal handling fails.
pub async fn execute(args: Args) -> Result<()> {
    let run_id = Ulid::new();
    info!("Starting daemon run {run_id}");
    debug!("Daemon args: {args:?}");

    let Args {
        store_url,
        store_token,
        keystore_url,
        keystore_token,
        keystore_mount,
        keystore_prefix,
        config,
        pin_fingerprints,
        allow_any_certificate,
        alert_threshold,
        alert_email_endpoint,
        alert_email_token,
        alert_email_recipient,
        alert_push_endpoint,
        alert_push_token,
    } = args;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Every store request passes the pinned verifier before it leaves the
    // process; rejections flow to the reporter task for auditing.
    let hostname = store_hostname(&store_url)?;
    let (violation_tx, violation_rx) = mpsc::unbounded_channel();
    let pinner = if allow_any_certificate {
        CertificatePinner::dangerously_allow_any(&hostname)
    } else {
        CertificatePinner::new(&hostname, &pin_fingerprints)
    }
    .with_violation_reporter(violation_tx);

    let store_client = pinned_client(pinner, APP_USER_AGENT)?;
    let store: Arc<dyn TableStore> = Arc::new(HttpTableStore::with_client(
        store_client,
        &store_url,
        store_token,
    )?);
    let keystore: Arc<dyn SecureStore> = Arc::new(VaultKeystore::new(
        &keystore_url,
        keystore_token,
        &keystore_mount,
        &keystore_prefix,
        APP_USER_AGENT,
    )?);

    let audit = AuditLog::new(store.clone(), clock.clone());
    let pin_reporter = pinning::spawn_reporter(audit.clone(), violation_rx);

    let limiter = RateLimiter::new(store.clone(), audit.clone(), clock.clone(), config.clone());
    let rotator = CredentialRotator::new(
        store,
        keystore.clone(),
        audit.clone(),
        clock.clone(),
        config.clone(),
    );
    rotator
        .init()
        .await
        .context("Could not initialize credential rotation state")?;

    let sessions = SessionRegistry::new(keystore, audit.clone(), clock.clone(), config.clone());
    let monitor = SecurityMonitor::new(audit.clone(), limiter, clock.clone());

    let mut channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogChannel)];
    if let (Some(endpoint), Some(token), Some(recipient)) = (
        alert_email_endpoint,
        alert_email_token,
        alert_email_recipient,
    ) {
        channels.push(Arc::new(EmailChannel::new(
            webhook_client()?,
            &endpoint,
            token,
            &recipient,
        )));
    }
    if let (Some(endpoint), Some(token)) = (alert_push_endpoint, alert_push_token) {
        channels.push(Arc::new(PushChannel::new(webhook_client()?, &endpoint, token)));
    }
    info!("Alert delivery over {} channel(s)", channels.len());

    let dispatcher = AlertDispatcher::new(
        audit,
        clock,
        channels,
        alert_threshold,
        config.alert_throttle(),
    );

    let rotation_task = rotator.spawn_schedule(ROTATION_CHECK_INTERVAL);
    let sweeper_task = sessions.spawn_sweeper(SESSION_SWEEP_INTERVAL);
    let alert_task = dispatcher.spawn_refresh_schedule(monitor, ALERT_REFRESH_INTERVAL);

    info!("Daemon run {run_id} ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received; stopping schedules");

    alert_task.abort();
    sweeper_task.abort();
    rotation_task.abort();
    pin_reporter.abort();

    Ok(())
}

fn store_hostname(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid store URL: {url}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("Store URL has no host: {url}"))?;
    Ok(host.to_string())
}

fn webhook_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()
        .context("Failed to build alert delivery HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_hostname() {
        assert_eq!(
            store_hostname("https://store.example.com:8443/api").ok(),
            Some("store.example.com".to_string())
        );
        assert_eq!(
            store_hostname("https://10.0.0.7").ok(),
            Some("10.0.0.7".to_string())
        );
    }

    #[test]
    fn test_store_hostname_rejects_garbage() {
        assert!(store_hostname("not a url").is_err());
        assert!(store_hostname("unix:///tmp/store.sock").is_err());
    }
}

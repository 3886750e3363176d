//! Scheduled API credential rotation.
//!
//! The current and previous key live in one keystore document
//! (`rotation/state`); the backend's credential record is the distribution
//! point for the current key. Rotation order is backend first, then state:
//! if the backend write fails the old state is untouched and the old key
//! keeps working. After a rotation the previous key stays valid for the
//! configured grace period so deployed consumers can catch up.
//!
//! Mutations are fail-closed: any store or keystore error aborts and the
//! next scheduled tick retries.

use crate::audit::{AuditAction, AuditLog, EventMetadata};
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::keystore::SecureStore;
use crate::store::{Filter, TableStore};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const CREDENTIAL_TABLE: &str = "credentials";
/// Identifying `name` of our credential record in the backend table.
pub const CREDENTIAL_NAME: &str = "gardisto-api-key";

const CREDENTIALS_RESOURCE: &str = "credentials";
const STATE_KEY: &str = "rotation/state";
const KEY_PREFIX: &str = "gsk_";
const KEY_BYTES: usize = 32;
/// Keys report `ExpiringSoon` and rotate this many days before expiry.
const EXPIRY_LEAD_DAYS: i64 = 7;
const MAX_TICK_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationState {
    pub current_key: String,
    pub current_expires_at: DateTime<Utc>,
    pub previous_key: Option<String>,
    pub previous_expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Valid,
    ExpiringSoon,
    Expired,
    /// No rotation state could be read; nothing can be said about the key.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationStatus {
    pub status: KeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub grace_active: bool,
}

#[derive(Clone)]
pub struct CredentialRotator {
    store: Arc<dyn TableStore>,
    keystore: Arc<dyn SecureStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    config: SecurityConfig,
    state: Arc<RwLock<Option<RotationState>>>,
}

fn generate_key() -> Result<String> {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("Failed to generate API key")?;
    Ok(format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

/// Loggable identification of a key without exposing it.
fn key_display_prefix(key: &str) -> String {
    let prefix = key.get(..10).unwrap_or(key);
    format!("{prefix}...")
}

impl CredentialRotator {
    pub fn new(
        store: Arc<dyn TableStore>,
        keystore: Arc<dyn SecureStore>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            store,
            keystore,
            audit,
            clock,
            config,
            state: Arc::new(RwLock::new(None)),
        }
    }

    /// Load persisted rotation state, bootstrapping a first key when none
    /// exists. Called once at startup.
    ///
    /// # Errors
    /// Returns an error if the keystore or backend cannot be reached.
    pub async fn init(&self) -> Result<()> {
        if self.state().await?.is_some() {
            return Ok(());
        }
        self.bootstrap().await
    }

    /// Whether the current key is inside the rotation lead window.
    ///
    /// # Errors
    /// Returns an error if the keystore cannot be read.
    pub async fn rotation_needed(&self) -> Result<bool> {
        let Some(state) = self.state().await? else {
            return Ok(true);
        };
        Ok(self.inside_lead_window(&state))
    }

    /// Rotate the credential: mint a key, publish it to the backend, then
    /// demote the old key into its grace period. Returns whether a rotation
    /// happened.
    ///
    /// # Errors
    /// Returns an error if the backend or keystore write fails; state is
    /// only advanced after the backend accepted the new key.
    pub async fn rotate(&self, force: bool) -> Result<bool> {
        let Some(state) = self.state().await? else {
            self.bootstrap().await?;
            return Ok(true);
        };

        if !force && !self.inside_lead_window(&state) {
            return Ok(false);
        }

        let now = self.clock.now();
        let new_key = generate_key()?;
        self.push_backend(&new_key, now).await?;

        let next = RotationState {
            current_key: new_key.clone(),
            current_expires_at: now + self.config.rotation_interval(),
            previous_key: Some(state.current_key),
            previous_expires_at: Some(now + self.config.grace_period()),
        };
        self.persist_state(&next).await?;
        self.set_cache(next);

        let reason = if force { "forced" } else { "scheduled" };
        let event = self
            .audit
            .event(AuditAction::ApiKeyRotated, CREDENTIALS_RESOURCE, true)
            .with_metadata(EventMetadata {
                reason: Some(reason.to_string()),
                key_prefix: Some(key_display_prefix(&new_key)),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        info!("Rotated API credential ({reason})");
        Ok(true)
    }

    /// Drop the previous key once its grace period has elapsed. Returns
    /// whether anything was purged.
    ///
    /// # Errors
    /// Returns an error if the keystore write fails.
    pub async fn purge_expired_grace(&self) -> Result<bool> {
        let Some(state) = self.state().await? else {
            return Ok(false);
        };

        let expired = match (&state.previous_key, state.previous_expires_at) {
            (Some(_), Some(expires_at)) => self.clock.now() >= expires_at,
            _ => false,
        };
        if !expired {
            return Ok(false);
        }

        let next = RotationState {
            previous_key: None,
            previous_expires_at: None,
            ..state
        };
        self.persist_state(&next).await?;
        self.set_cache(next);

        let event = self
            .audit
            .event(AuditAction::ApiKeyGracePurged, CREDENTIALS_RESOURCE, true);
        self.audit.record(event).await;
        info!("Purged previous API credential after grace period");
        Ok(true)
    }

    /// Whether a presented key is the current key or a previous key still
    /// inside its grace period.
    ///
    /// # Errors
    /// Returns an error if the keystore cannot be read.
    pub async fn validate_key(&self, presented: &str) -> Result<bool> {
        let Some(state) = self.state().await? else {
            return Ok(false);
        };

        if presented == state.current_key {
            return Ok(true);
        }
        if let (Some(previous), Some(expires_at)) =
            (&state.previous_key, state.previous_expires_at)
        {
            if presented == previous && self.clock.now() < expires_at {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Expiry report for the current key. Degrades to `Unknown` rather than
    /// erroring so status displays stay available during outages.
    pub async fn status(&self) -> RotationStatus {
        let state = match self.state().await {
            Ok(state) => state,
            Err(err) => {
                warn!("Failed to read rotation state: {err}");
                None
            }
        };
        let Some(state) = state else {
            return RotationStatus {
                status: KeyStatus::Unknown,
                expires_at: None,
                days_until_expiry: None,
                grace_active: false,
            };
        };

        let now = self.clock.now();
        let status = if now >= state.current_expires_at {
            KeyStatus::Expired
        } else if self.inside_lead_window(&state) {
            KeyStatus::ExpiringSoon
        } else {
            KeyStatus::Valid
        };
        let grace_active = match (&state.previous_key, state.previous_expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        };

        RotationStatus {
            status,
            expires_at: Some(state.current_expires_at),
            days_until_expiry: Some((state.current_expires_at - now).num_days()),
            grace_active,
        }
    }

    /// Periodic rotation driver: checks the lead window, rotates when due,
    /// and purges expired grace keys. Failed ticks back off and retry up to
    /// three times, then wait for the next interval.
    #[must_use]
    pub fn spawn_schedule(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let rotator = self.clone();
        tokio::spawn(async move {
            loop {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match rotator.tick().await {
                        Ok(()) => break,
                        Err(err) => {
                            error!("Credential rotation attempt {attempt} failed: {err}");
                            if attempt >= MAX_TICK_ATTEMPTS {
                                break;
                            }
                            let backoff =
                                std::time::Duration::from_secs(2u64.pow(attempt - 1));
                            sleep(backoff).await;
                        }
                    }
                }

                let delay = jittered(interval);
                debug!("Next rotation check in {}s", delay.as_secs());
                sleep(delay).await;
            }
        })
    }

    async fn tick(&self) -> Result<()> {
        if self.rotation_needed().await? {
            self.rotate(false).await?;
        }
        self.purge_expired_grace().await?;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        let now = self.clock.now();
        let key = generate_key()?;
        self.push_backend(&key, now).await?;

        let state = RotationState {
            current_key: key.clone(),
            current_expires_at: now + self.config.rotation_interval(),
            previous_key: None,
            previous_expires_at: None,
        };
        self.persist_state(&state).await?;
        self.set_cache(state);

        let event = self
            .audit
            .event(AuditAction::ApiKeyRotated, CREDENTIALS_RESOURCE, true)
            .with_metadata(EventMetadata {
                reason: Some("bootstrap".to_string()),
                key_prefix: Some(key_display_prefix(&key)),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        info!("Bootstrapped initial API credential");
        Ok(())
    }

    fn inside_lead_window(&self, state: &RotationState) -> bool {
        self.clock.now() >= state.current_expires_at - Duration::days(EXPIRY_LEAD_DAYS)
    }

    async fn push_backend(&self, key: &str, rotated_at: DateTime<Utc>) -> Result<()> {
        let filter = Filter::new().eq("name", CREDENTIAL_NAME);
        let records = self
            .store
            .list(CREDENTIAL_TABLE, Some(&filter), None, Some(1))
            .await
            .context("Failed to look up credential record")?;

        let fields = serde_json::json!({
            "name": CREDENTIAL_NAME,
            "api_key": key,
            "rotated_at": rotated_at,
        });
        match records.first() {
            Some(record) => self
                .store
                .update(CREDENTIAL_TABLE, &record.id, fields)
                .await
                .context("Failed to update credential record")?,
            None => {
                self.store
                    .create(CREDENTIAL_TABLE, fields)
                    .await
                    .context("Failed to create credential record")?;
            }
        }
        Ok(())
    }

    async fn state(&self) -> Result<Option<RotationState>> {
        if let Some(state) = self.cached_state() {
            return Ok(Some(state));
        }
        let loaded = self.load_state().await?;
        if let Some(state) = &loaded {
            self.set_cache(state.clone());
        }
        Ok(loaded)
    }

    async fn load_state(&self) -> Result<Option<RotationState>> {
        let Some(value) = self
            .keystore
            .read(STATE_KEY)
            .await
            .context("Failed to read rotation state")?
        else {
            return Ok(None);
        };
        let state =
            serde_json::from_value(value).context("Malformed rotation state in keystore")?;
        Ok(Some(state))
    }

    async fn persist_state(&self, state: &RotationState) -> Result<()> {
        let value =
            serde_json::to_value(state).context("Failed to serialize rotation state")?;
        self.keystore
            .write(STATE_KEY, value)
            .await
            .context("Failed to write rotation state")
    }

    fn cached_state(&self) -> Option<RotationState> {
        self.state.read().ok().and_then(|guard| guard.clone())
    }

    fn set_cache(&self, state: RotationState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = Some(state);
        }
    }
}

fn jittered(interval: std::time::Duration) -> std::time::Duration {
    let factor = StdRng::from_entropy().gen_range(70..90);
    std::time::Duration::from_secs(interval.as_secs() * factor / 100)
}

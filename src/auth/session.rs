//! Session lifetime over the secure store.
//!
//! Raw session tokens are handed to the client once and never persisted;
//! storage is keyed by the token's SHA-256. A `sessions/index` document
//! lists the live handles so the sweeper can enumerate them. The index is
//! read-modify-write without a transaction: two concurrent opens can drop
//! a handle from it. An orphaned session document is still reachable by
//! its token and expires through `touch`, so the race costs coverage of
//! one sweep, not correctness.

use super::ClientInfo;
use crate::audit::{AuditAction, AuditLog, EventMetadata};
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::keystore::SecureStore;
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

const SESSIONS_RESOURCE: &str = "sessions";
const SESSION_PREFIX: &str = "sessions";
const INDEX_KEY: &str = "sessions/index";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogoutReason {
    UserInitiated,
    IdleTimeout,
    Administrative,
}

impl LogoutReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserInitiated => "user_initiated",
            Self::IdleTimeout => "idle_timeout",
            Self::Administrative => "administrative",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub identifier: String,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ip_address: Option<String>,
}

/// Raw bearer token for the client; the store only ever sees its hash.
fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("Failed to generate session token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn token_handle(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn session_key(handle: &str) -> String {
    format!("{SESSION_PREFIX}/{handle}")
}

#[derive(Clone)]
pub struct SessionRegistry {
    keystore: Arc<dyn SecureStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    config: SecurityConfig,
}

impl SessionRegistry {
    pub fn new(
        keystore: Arc<dyn SecureStore>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            keystore,
            audit,
            clock,
            config,
        }
    }

    /// Open a session and return the bearer token.
    ///
    /// # Errors
    /// Returns an error if the session cannot be persisted.
    pub async fn open(&self, identifier: &str, client: &ClientInfo) -> Result<String> {
        let token = generate_session_token()?;
        let handle = token_handle(&token);
        let now = self.clock.now();

        let session = Session {
            identifier: identifier.to_string(),
            opened_at: now,
            last_activity: now,
            ip_address: client.ip_address.clone(),
        };
        self.persist_session(&handle, &session).await?;

        let mut index = self.load_index().await?;
        index.push(handle);
        self.store_index(&index).await?;

        let mut event = self
            .audit
            .event(AuditAction::SessionOpened, SESSIONS_RESOURCE, true)
            .with_actor(identifier);
        if let Some(ip) = &client.ip_address {
            event = event.with_ip(ip);
        }
        self.audit.record(event).await;

        Ok(token)
    }

    /// Record activity on a session, returning its current state.
    ///
    /// A session idle past the timeout is closed on the spot with reason
    /// `idle_timeout` and reported as absent; touching cannot revive it.
    ///
    /// # Errors
    /// Returns an error if the keystore cannot be reached.
    pub async fn touch(&self, token: &str) -> Result<Option<Session>> {
        let handle = token_handle(token);
        let Some(mut session) = self.load_session(&handle).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if now >= session.last_activity + self.config.session_timeout() {
            self.close(&handle, &session, LogoutReason::IdleTimeout)
                .await?;
            self.drop_from_index(&handle).await?;
            return Ok(None);
        }

        session.last_activity = now;
        self.persist_session(&handle, &session).await?;
        Ok(Some(session))
    }

    /// Close a session. Returns whether one existed for the token.
    ///
    /// # Errors
    /// Returns an error if the keystore cannot be reached.
    pub async fn logout(&self, token: &str, reason: LogoutReason) -> Result<bool> {
        let handle = token_handle(token);
        let Some(session) = self.load_session(&handle).await? else {
            return Ok(false);
        };
        self.close(&handle, &session, reason).await?;
        self.drop_from_index(&handle).await?;
        Ok(true)
    }

    /// Expire every session idle past the timeout and prune handles whose
    /// documents are gone. Returns the number of sessions expired.
    ///
    /// # Errors
    /// Returns an error if the keystore cannot be reached.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let index = self.load_index().await?;
        let total = index.len();
        let now = self.clock.now();
        let timeout = self.config.session_timeout();

        let mut kept = Vec::with_capacity(index.len());
        let mut expired = 0;
        for handle in index {
            match self.load_session(&handle).await? {
                // Dangling handle, e.g. from a lost index write.
                None => {}
                Some(session) if now >= session.last_activity + timeout => {
                    self.close(&handle, &session, LogoutReason::IdleTimeout)
                        .await?;
                    expired += 1;
                }
                Some(_) => kept.push(handle),
            }
        }

        if kept.len() != total {
            self.store_index(&kept).await?;
        }
        Ok(expired)
    }

    /// Enforce the idle timeout on a fixed tick.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                match registry.sweep_expired().await {
                    Ok(0) => {}
                    Ok(expired) => info!("Expired {expired} idle session(s)"),
                    Err(err) => warn!("Session sweep failed: {err}"),
                }
                sleep(interval).await;
            }
        })
    }

    async fn close(&self, handle: &str, session: &Session, reason: LogoutReason) -> Result<()> {
        self.keystore
            .delete(&session_key(handle))
            .await
            .context("Failed to delete session")?;

        let event = self
            .audit
            .event(AuditAction::Logout, SESSIONS_RESOURCE, true)
            .with_actor(&session.identifier)
            .with_metadata(EventMetadata {
                reason: Some(reason.as_str().to_string()),
                ..EventMetadata::default()
            });
        self.audit.record(event).await;
        info!(identifier = %session.identifier, %reason, "Session closed");
        Ok(())
    }

    async fn persist_session(&self, handle: &str, session: &Session) -> Result<()> {
        let value = serde_json::to_value(session).context("Failed to serialize session")?;
        self.keystore
            .write(&session_key(handle), value)
            .await
            .context("Failed to persist session")
    }

    async fn load_session(&self, handle: &str) -> Result<Option<Session>> {
        let Some(value) = self
            .keystore
            .read(&session_key(handle))
            .await
            .context("Failed to read session")?
        else {
            return Ok(None);
        };
        let session = serde_json::from_value(value).context("Malformed session document")?;
        Ok(Some(session))
    }

    async fn drop_from_index(&self, handle: &str) -> Result<()> {
        let index = self.load_index().await?;
        let remaining: Vec<String> = index.into_iter().filter(|h| h != handle).collect();
        self.store_index(&remaining).await
    }

    async fn load_index(&self) -> Result<Vec<String>> {
        let Some(value) = self
            .keystore
            .read(INDEX_KEY)
            .await
            .context("Failed to read session index")?
        else {
            return Ok(Vec::new());
        };
        serde_json::from_value(value).context("Malformed session index")
    }

    async fn store_index(&self, handles: &[String]) -> Result<()> {
        let value = serde_json::to_value(handles).context("Failed to serialize session index")?;
        self.keystore
            .write(INDEX_KEY, value)
            .await
            .context("Failed to write session index")
    }
}

//! Credential rotation through the eyes of an API consumer.
//!
//! Everything here goes through the public surface: the key published in
//! the backend credential record, `validate_key`, and the audit trail.
//! 1. Bootstrap publishes the first key to the backend record.
//! 2. A scheduled rotation swaps the published key in place and keeps the
//!    old key valid for the grace period.
//! 3. Grace expiry invalidates the old key; the purge is audited.
//! 4. A restarted rotator resumes from persisted state, no re-bootstrap.
//! 5. A backend outage aborts the rotation and the next attempt succeeds.

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use gardisto::{
    audit::{AuditAction, AuditLog, EventQuery},
    clock::ManualClock,
    config::SecurityConfig,
    keystore::InMemoryKeystore,
    rotation::{CredentialRotator, KeyStatus, CREDENTIAL_NAME, CREDENTIAL_TABLE},
    store::InMemoryTableStore,
};
use std::sync::Arc;

struct Harness {
    rotator: CredentialRotator,
    audit: AuditLog,
    store: Arc<InMemoryTableStore>,
    keystore: Arc<InMemoryKeystore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryTableStore::new());
    let keystore = Arc::new(InMemoryKeystore::new());
    let clock = Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let audit = AuditLog::new(store.clone(), clock.clone());
    let rotator = CredentialRotator::new(
        store.clone(),
        keystore.clone(),
        audit.clone(),
        clock.clone(),
        SecurityConfig::new(),
    );
    Harness {
        rotator,
        audit,
        store,
        keystore,
        clock,
    }
}

/// The key a consumer would read out of the backend credential record.
fn published_key(store: &InMemoryTableStore) -> String {
    let records = store.records(CREDENTIAL_TABLE);
    assert_eq!(records.len(), 1, "expected exactly one credential record");
    records[0].fields["api_key"]
        .as_str()
        .expect("credential record carries an api_key field")
        .to_string()
}

#[tokio::test]
async fn bootstrap_publishes_key_to_backend() -> Result<()> {
    let h = harness();
    h.rotator.init().await?;

    let records = h.store.records(CREDENTIAL_TABLE);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields["name"], CREDENTIAL_NAME);
    assert!(records[0].fields["rotated_at"].is_string());

    let key = published_key(&h.store);
    assert!(key.starts_with("gsk_"));
    assert!(h.rotator.validate_key(&key).await?);
    assert!(!h.rotator.validate_key("gsk_not-that-one").await?);

    let status = h.rotator.status().await;
    assert_eq!(status.status, KeyStatus::Valid);
    assert_eq!(status.days_until_expiry, Some(90));
    assert!(!status.grace_active);

    let rotations = h
        .audit
        .query(&EventQuery {
            action: Some(AuditAction::ApiKeyRotated),
            ..EventQuery::default()
        })
        .await?;
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0].metadata.reason.as_deref(), Some("bootstrap"));
    assert!(
        rotations[0]
            .metadata
            .key_prefix
            .as_deref()
            .is_some_and(|prefix| prefix.starts_with("gsk_"))
    );
    Ok(())
}

#[tokio::test]
async fn scheduled_rotation_swaps_published_key() -> Result<()> {
    let h = harness();
    h.rotator.init().await?;
    let first = published_key(&h.store);
    assert!(!h.rotator.rotation_needed().await?);

    // 84 days in: 6 days before expiry, inside the 7 day lead window.
    h.clock.advance(Duration::days(84));
    assert!(h.rotator.rotation_needed().await?);
    assert!(h.rotator.rotate(false).await?);

    // Same record, new key; the old one stays valid through grace.
    let second = published_key(&h.store);
    assert_ne!(second, first);
    assert!(h.rotator.validate_key(&second).await?);
    assert!(h.rotator.validate_key(&first).await?);

    let status = h.rotator.status().await;
    assert_eq!(status.status, KeyStatus::Valid);
    assert_eq!(status.days_until_expiry, Some(90));
    assert!(status.grace_active);

    // Freshly rotated means nothing more to do this tick.
    assert!(!h.rotator.rotate(false).await?);

    let rotations = h
        .audit
        .query(&EventQuery {
            action: Some(AuditAction::ApiKeyRotated),
            ..EventQuery::default()
        })
        .await?;
    assert_eq!(rotations.len(), 2);
    assert!(
        rotations
            .iter()
            .any(|event| event.metadata.reason.as_deref() == Some("scheduled"))
    );
    Ok(())
}

#[tokio::test]
async fn grace_expiry_invalidates_old_key() -> Result<()> {
    let h = harness();
    h.rotator.init().await?;
    let first = published_key(&h.store);

    h.clock.advance(Duration::days(84));
    assert!(h.rotator.rotate(false).await?);
    let second = published_key(&h.store);

    // 23 hours into the 24 hour grace period the old key still works.
    h.clock.advance(Duration::hours(23));
    assert!(h.rotator.validate_key(&first).await?);

    h.clock.advance(Duration::hours(2));
    assert!(!h.rotator.validate_key(&first).await?);
    assert!(h.rotator.validate_key(&second).await?);

    assert!(h.rotator.purge_expired_grace().await?);
    assert!(!h.rotator.status().await.grace_active);
    assert!(!h.rotator.purge_expired_grace().await?);

    let purges = h
        .audit
        .query(&EventQuery {
            action: Some(AuditAction::ApiKeyGracePurged),
            ..EventQuery::default()
        })
        .await?;
    assert_eq!(purges.len(), 1);
    Ok(())
}

#[tokio::test]
async fn restart_resumes_without_rebootstrap() -> Result<()> {
    let h = harness();
    h.rotator.init().await?;
    let first = published_key(&h.store);
    assert!(h.rotator.rotate(true).await?);
    let second = published_key(&h.store);

    // A fresh process over the same stores.
    let audit = AuditLog::new(h.store.clone(), h.clock.clone());
    let restarted = CredentialRotator::new(
        h.store.clone(),
        h.keystore.clone(),
        audit,
        h.clock.clone(),
        SecurityConfig::new(),
    );
    restarted.init().await?;

    assert_eq!(published_key(&h.store), second);
    assert!(restarted.validate_key(&second).await?);
    assert!(restarted.validate_key(&first).await?);
    assert!(restarted.status().await.grace_active);
    assert!(!restarted.rotation_needed().await?);

    // Still only bootstrap + forced; init on the restart minted nothing.
    let rotations = h
        .audit
        .query(&EventQuery {
            action: Some(AuditAction::ApiKeyRotated),
            ..EventQuery::default()
        })
        .await?;
    assert_eq!(rotations.len(), 2);
    Ok(())
}

#[tokio::test]
async fn backend_outage_aborts_then_next_attempt_succeeds() -> Result<()> {
    let h = harness();
    h.rotator.init().await?;
    let first = published_key(&h.store);

    h.clock.advance(Duration::days(84));
    h.store.set_failing(true);
    assert!(h.rotator.rotate(false).await.is_err());
    h.store.set_failing(false);

    // The published key never moved, so consumers kept working.
    assert_eq!(published_key(&h.store), first);
    assert!(h.rotator.validate_key(&first).await?);

    // Still due; the retry goes through.
    assert!(h.rotator.rotation_needed().await?);
    assert!(h.rotator.rotate(false).await?);
    assert_ne!(published_key(&h.store), first);
    Ok(())
}

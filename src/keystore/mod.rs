//! Secure key-value store access.
//!
//! Secret material (TOTP seeds, recovery code hashes, rotation state, session
//! records) never touches the table store; it lives behind [`SecureStore`].
//! Production uses [`vault::VaultKeystore`] (KV v2), tests use
//! [`memory::InMemoryKeystore`] with fault injection.

pub mod memory;
pub mod vault;

pub use memory::InMemoryKeystore;
pub use vault::VaultKeystore;

use crate::store::StoreError;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous version.
    async fn write(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Read the value under `key`. Absent keys are `Ok(None)`, not an error.
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

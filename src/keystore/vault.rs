//! Vault KV v2 backend for the secure store.
//!
//! Keys are namespaced under a configurable prefix inside one KV v2 mount:
//! reads and writes go through `/v1/{mount}/data/{prefix}/{key}`, deletes
//! through the metadata endpoint so all versions are removed.

use super::SecureStore;
use crate::store::StoreError;
use crate::store::http::endpoint_url;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{Instrument, info_span};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Clone)]
pub struct VaultKeystore {
    client: Client,
    base_url: String,
    mount: String,
    prefix: String,
    token: SecretString,
}

impl VaultKeystore {
    /// Build a keystore client with its own HTTP client.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(
        base_url: &str,
        token: SecretString,
        mount: &str,
        prefix: &str,
        user_agent: &str,
    ) -> Result<Self, StoreError> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Self::with_client(client, base_url, token, mount, prefix)
    }

    /// Build a keystore client on top of an existing HTTP client, typically
    /// one carrying a certificate-pinned TLS configuration.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn with_client(
        client: Client,
        base_url: &str,
        token: SecretString,
        mount: &str,
        prefix: &str,
    ) -> Result<Self, StoreError> {
        endpoint_url(base_url, "")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            token,
        })
    }

    fn data_url(&self, key: &str) -> Result<String, StoreError> {
        endpoint_url(
            &self.base_url,
            &format!("/v1/{}/data/{}/{key}", self.mount, self.prefix),
        )
    }

    fn metadata_url(&self, key: &str) -> Result<String, StoreError> {
        endpoint_url(
            &self.base_url,
            &format!("/v1/{}/metadata/{}/{key}", self.mount, self.prefix),
        )
    }

    async fn backend_error(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::Backend { status, body }
    }
}

impl std::fmt::Debug for VaultKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKeystore")
            .field("base_url", &self.base_url)
            .field("mount", &self.mount)
            .field("prefix", &self.prefix)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecureStore for VaultKeystore {
    async fn write(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let url = self.data_url(key)?;

        let span = info_span!(
            "keystore.write",
            http.method = "POST",
            url = %url
        );
        let response = self
            .client
            .post(&url)
            .header(VAULT_TOKEN_HEADER, self.token.expose_secret())
            .json(&serde_json::json!({ "data": value }))
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let url = self.data_url(key)?;

        let span = info_span!(
            "keystore.read",
            http.method = "GET",
            url = %url
        );
        let response = self
            .client
            .get(&url)
            .header(VAULT_TOKEN_HEADER, self.token.expose_secret())
            .send()
            .instrument(span)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        let data = json
            .get("data")
            .and_then(|data| data.get("data"))
            .cloned()
            .ok_or_else(|| StoreError::Malformed("missing data.data in KV response".to_string()))?;
        Ok(Some(data))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self.metadata_url(key)?;

        let span = info_span!(
            "keystore.delete",
            http.method = "DELETE",
            url = %url
        );
        let response = self
            .client
            .delete(&url)
            .header(VAULT_TOKEN_HEADER, self.token.expose_secret())
            .send()
            .instrument(span)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keystore() -> VaultKeystore {
        VaultKeystore::new(
            "https://vault.example.com:8200/",
            SecretString::from("token".to_string()),
            "/secret/",
            "gardisto",
            "gardisto/test",
        )
        .unwrap()
    }

    #[test]
    fn data_url_namespaces_keys_under_prefix() {
        let url = keystore().data_url("mfa/alice").unwrap();
        assert_eq!(
            url,
            "https://vault.example.com:8200/v1/secret/data/gardisto/mfa/alice"
        );
    }

    #[test]
    fn metadata_url_used_for_deletes() {
        let url = keystore().metadata_url("rotation/state").unwrap();
        assert_eq!(
            url,
            "https://vault.example.com:8200/v1/secret/metadata/gardisto/rotation/state"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = VaultKeystore::new(
            "not-a-url",
            SecretString::from("token".to_string()),
            "secret",
            "gardisto",
            "gardisto/test",
        );
        assert!(result.is_err());
    }

    #[test]
    fn debug_masks_token() {
        let rendered = format!("{:?}", keystore());
        assert!(rendered.contains("***"));
        assert!(!rendered.contains("token\": \"token"));
    }
}

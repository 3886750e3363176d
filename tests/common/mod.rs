//! Shared fixtures for the integration suites.

use anyhow::Result;
use async_trait::async_trait;
use gardisto::auth::{Authenticator, ClientInfo, Principal};
use std::collections::HashMap;

/// Credential backend with a fixed set of accounts.
pub struct StaticAuthenticator {
    accounts: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn with_account(identifier: &str, secret: &str) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(identifier.to_string(), secret.to_string());
        Self { accounts }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Option<Principal>> {
        Ok(self
            .accounts
            .get(identifier)
            .filter(|stored| stored.as_str() == secret)
            .map(|_| Principal {
                id: identifier.to_string(),
                display_name: identifier.to_string(),
                roles: vec!["member".to_string()],
            }))
    }
}

/// Request context as a reverse proxy would report it.
pub fn client(ip: &str) -> ClientInfo {
    ClientInfo {
        ip_address: Some(ip.to_string()),
        device_fingerprint: Some("device-1".to_string()),
        user_agent: Some("integration-tests/1.0".to_string()),
    }
}
